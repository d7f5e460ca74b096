//! The physical mapper: projects the schema AST onto PostgreSQL tables,
//! columns and indexes, as plain descriptors that the DDL planner and the
//! ingesters consume.

mod bind;
mod descriptor;
pub mod dml;

pub use bind::{bind_value, parse_date_time, BindError};
pub use descriptor::{
    ColumnDescriptor, IndexDescriptor, IndexMethod, NamingOptions, SqlType, TableDescriptor,
};

#[cfg(test)]
mod test {
    use super::*;
    use models::{DatasetSchema, EmptyCollection};
    use serde_json::json;

    fn nap() -> DatasetSchema {
        DatasetSchema::from_value(json!({
            "id": "nap",
            "type": "dataset",
            "crs": "EPSG:28992",
            "tables": [{
                "id": "peilmerken",
                "type": "table",
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "identifier": ["identificatie"],
                    "required": ["schema", "identificatie"],
                    "properties": {
                        "schema": {"$ref": "https://schemas.data.amsterdam.nl/schema@v1.1.1#/definitions/schema"},
                        "identificatie": {"type": "string"},
                        "hoogteTovNap": {"type": "number"},
                        "jaar": {"type": "integer"},
                        "windrichting": {"type": "string"},
                        "publiceerbaar": {"type": "boolean"},
                        "vervaldatum": {"type": "string", "format": "date"},
                        "registratiedatum": {"type": "string", "format": "date-time"},
                        "status": {
                            "type": "object",
                            "properties": {
                                "code": {"type": "integer"},
                                "omschrijving": {"type": "string"}
                            }
                        },
                        "ligtInBouwblok": {
                            "type": "object",
                            "relation": "gebieden:bouwblokken",
                            "properties": {
                                "identificatie": {"type": "string"},
                                "volgnummer": {"type": "integer"}
                            }
                        },
                        "geometrie": {"$ref": "https://geojson.org/schema/Point.json"}
                    }
                }
            }]
        }))
        .unwrap()
    }

    fn descriptor() -> TableDescriptor {
        let dataset = nap();
        let table = dataset.get_declared_table("peilmerken").unwrap().clone();
        TableDescriptor::from_table(&dataset, &table, &EmptyCollection, &NamingOptions::default())
            .unwrap()
    }

    #[test]
    fn test_table_naming() {
        let descriptor = descriptor();
        assert_eq!(descriptor.name, "nap_peilmerken");
        assert_eq!(descriptor.qualified_name(), "nap_peilmerken");
        assert!(descriptor.db_schema.is_none());
    }

    #[test]
    fn test_column_mapping() {
        let descriptor = descriptor();
        let type_of = |name: &str| descriptor.column(name).unwrap().sql_type.clone();

        assert_eq!(type_of("identificatie"), SqlType::Varchar);
        assert_eq!(type_of("hoogte_tov_nap"), SqlType::Double);
        assert_eq!(type_of("jaar"), SqlType::BigInt);
        assert_eq!(type_of("publiceerbaar"), SqlType::Boolean);
        assert_eq!(type_of("vervaldatum"), SqlType::Date);
        assert_eq!(type_of("registratiedatum"), SqlType::Timestamp);
        assert_eq!(
            type_of("geometrie"),
            SqlType::Geometry { geometry_type: "Point".to_string(), srid: 28992 }
        );

        // The schema pointer has no column; the single-field identifier is
        // the primary key.
        assert!(descriptor.column("schema").is_none());
        assert!(descriptor.column("identificatie").unwrap().primary_key);
        assert_eq!(descriptor.key_column(), "identificatie");
    }

    #[test]
    fn test_object_fields_expand_to_columns() {
        let descriptor = descriptor();
        // Plain object: prefixed per-subfield columns.
        assert_eq!(descriptor.column("status_code").unwrap().sql_type, SqlType::BigInt);
        assert!(descriptor.column("status_omschrijving").is_some());
        // Compound foreign key: subkey columns plus the joined id column.
        assert!(descriptor.column("ligt_in_bouwblok_identificatie").is_some());
        assert!(descriptor.column("ligt_in_bouwblok_volgnummer").is_some());
        assert_eq!(
            descriptor.column("ligt_in_bouwblok_id").unwrap().sql_type,
            SqlType::Varchar
        );
    }

    #[test]
    fn test_index_plan() {
        let descriptor = descriptor();
        let names: Vec<&str> = descriptor.indexes.iter().map(|i| i.name.as_str()).collect();
        assert!(names.contains(&"nap_peilmerken_identifier_idx"));
        assert!(names.contains(&"nap_peilmerken_ligt_in_bouwblok_id_idx"));
        assert!(names.contains(&"nap_peilmerken_geometrie_idx"));

        let gist = descriptor
            .indexes
            .iter()
            .find(|i| i.columns == ["geometrie"])
            .unwrap();
        assert_eq!(gist.method, IndexMethod::Gist);

        for index in &descriptor.indexes {
            assert!(index.name.len() <= names::MAX_IDENTIFIER_LENGTH);
        }
    }

    #[test]
    fn test_versioned_naming() {
        let dataset = DatasetSchema::from_value(json!({
            "id": "bag",
            "type": "dataset",
            "version": "2.0.0",
            "defaultVersion": "1.0.0",
            "tables": [{
                "id": "panden",
                "type": "table",
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "properties": {"identificatie": {"type": "string"}}
                }
            }]
        }))
        .unwrap();
        let table = dataset.get_declared_table("panden").unwrap().clone();

        // Non-default major version: infixed in the public-schema name.
        let public = TableDescriptor::from_table(
            &dataset,
            &table,
            &EmptyCollection,
            &NamingOptions::default(),
        )
        .unwrap();
        assert_eq!(public.name, "bag_2_panden");

        // Versioned layout: own schema, version-suffixed name.
        let versioned = TableDescriptor::from_table(
            &dataset,
            &table,
            &EmptyCollection,
            &NamingOptions {
                versioned: true,
                ..NamingOptions::default()
            },
        )
        .unwrap();
        assert_eq!(versioned.db_schema.as_deref(), Some("bag"));
        assert_eq!(versioned.name, "panden_v2");
        assert_eq!(versioned.qualified_name(), "bag.panden_v2");
    }

    #[test]
    fn test_dimension_columns_on_through_tables() {
        use models::DatasetCollection;
        use std::sync::Arc;

        struct OneDataset(Arc<DatasetSchema>);
        impl DatasetCollection for OneDataset {
            fn get_dataset(&self, dataset_id: &str) -> Result<Arc<DatasetSchema>, models::Error> {
                if dataset_id == self.0.id {
                    Ok(self.0.clone())
                } else {
                    Err(models::Error::DatasetNotFound(dataset_id.to_string()))
                }
            }
        }

        let dataset = Arc::new(
            DatasetSchema::from_value(json!({
                "id": "gebieden",
                "type": "dataset",
                "crs": "EPSG:28992",
                "useDimensionFields": true,
                "temporal": {
                    "identifier": "volgnummer",
                    "dimensions": {"geldigOp": ["beginGeldigheid", "eindGeldigheid"]}
                },
                "tables": [{
                    "id": "ggwgebieden",
                    "type": "table",
                    "schema": {
                        "$schema": "http://json-schema.org/draft-07/schema#",
                        "type": "object",
                        "identifier": ["identificatie", "volgnummer"],
                        "required": ["identificatie", "volgnummer"],
                        "properties": {
                            "identificatie": {"type": "string"},
                            "volgnummer": {"type": "integer"},
                            "bestaatUitBuurten": {
                                "type": "array",
                                "relation": "gebieden:buurten",
                                "items": {"type": "string"}
                            }
                        }
                    }
                }, {
                    "id": "buurten",
                    "type": "table",
                    "schema": {
                        "$schema": "http://json-schema.org/draft-07/schema#",
                        "type": "object",
                        "identifier": ["identificatie", "volgnummer"],
                        "required": ["identificatie", "volgnummer"],
                        "properties": {
                            "identificatie": {"type": "string"},
                            "volgnummer": {"type": "integer"}
                        }
                    }
                }]
            }))
            .unwrap(),
        );

        let through = dataset.through_tables().remove(0);
        let collection = OneDataset(dataset.clone());
        let descriptor = TableDescriptor::from_table(
            &dataset,
            &through,
            &collection,
            &NamingOptions::default(),
        )
        .unwrap();

        // The n-m relation target is temporal, so the through table gets
        // the bare validity-range columns.
        assert_eq!(
            descriptor.column("begin_geldigheid").unwrap().sql_type,
            SqlType::Timestamp
        );
        assert!(descriptor.column("eind_geldigheid").is_some());
    }

    #[test]
    fn test_full_load_postfix_survives() {
        let dataset = nap();
        let table = dataset.get_declared_table("peilmerken").unwrap().clone();
        let shadow = TableDescriptor::from_table(
            &dataset,
            &table,
            &EmptyCollection,
            &NamingOptions::with_postfix("_full_load"),
        )
        .unwrap();
        assert_eq!(shadow.name, "nap_peilmerken_full_load");
    }
}
