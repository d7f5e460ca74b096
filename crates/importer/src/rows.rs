use std::collections::BTreeMap;

use serde_json::{Map, Value};

use models::{FieldSchema, TableSchema};
use names::{rel_table_identifier, to_snake_case, RELATION_INDICATOR};

use crate::record::Record;
use crate::{geometry, ParseError};

/// The rows produced by one input record: the main row plus rows for the
/// nested and through sub-tables, keyed by derived table id.
#[derive(Debug, Default)]
pub struct RowSet {
    pub main: Map<String, Value>,
    pub sub_rows: BTreeMap<String, Vec<Map<String, Value>>>,
}

fn bare_subfield_id<'f>(field: &FieldSchema, subfield: &'f FieldSchema) -> &'f str {
    subfield
        .id
        .strip_prefix(&format!("{}{}", field.name(), RELATION_INDICATOR))
        .unwrap_or(&subfield.id)
}

/// Build the physical rows for one raw input record. This applies
/// provenance, converts geometries to EWKT, computes the composite key,
/// flattens object fields and fans array fields out to their sub-tables.
pub fn build_row_set(
    table: &TableSchema,
    srid: i32,
    raw: Map<String, Value>,
) -> Result<RowSet, ParseError> {
    let provenances: Vec<(String, String)> = table
        .fields()
        .iter()
        .filter_map(|f| f.provenance.clone().map(|p| (p, f.id.clone())))
        .collect();
    let mut record = Record::new(raw, &provenances);
    let mut row_set = RowSet::default();

    // Geometry fields arrive as GeoJSON objects and are stored as EWKT.
    for field in table.fields().iter().filter(|f| f.is_geo()) {
        if let Some(value) = record.get(&field.id) {
            if value.is_object() {
                let ewkt = geometry::geojson_to_ewkt(value, srid)?;
                record.insert(field.id.clone(), Value::String(ewkt));
            }
        }
    }

    // The row key: joined identifier values, also stored as `id` for
    // composite keys. Autoincrement tables leave key generation to the
    // database.
    let mut id_value = None;
    if !table.is_autoincrement() {
        let identifier_fields = table.identifier_fields()?;
        let mut parts = Vec::with_capacity(identifier_fields.len());
        for field in &identifier_fields {
            let value = record
                .get(&field.id)
                .filter(|v| !v.is_null())
                .ok_or_else(|| ParseError::MissingIdentifier(field.qualified_id()))?;
            parts.push(plain_string(value));
        }
        let joined = parts.join(".");
        if table.has_composite_key() {
            record.insert("id", Value::String(joined.clone()));
        }
        id_value = Some(joined);
    }

    for field in table.fields().to_vec() {
        // 1-n relations: store the (possibly joined) key in `<field>_id`,
        // with one column per subkey for compound keys.
        if field.relation().is_some() && !field.is_array() {
            let Some(value) = record.remove(&field.id) else {
                continue;
            };
            if field.is_object() {
                let mut parts = Vec::new();
                for subfield in field.subfields() {
                    if subfield.is_temporal {
                        continue;
                    }
                    let sub_value = value
                        .get(bare_subfield_id(&field, subfield))
                        .cloned()
                        .unwrap_or(Value::Null);
                    if !sub_value.is_null() {
                        parts.push(plain_string(&sub_value));
                    }
                    row_set
                        .main
                        .insert(subfield.db_name(), sub_value);
                }
                let joined = if parts.is_empty() {
                    Value::Null
                } else {
                    Value::String(parts.join("."))
                };
                row_set.main.insert(field.db_name(), joined);
            } else {
                row_set.main.insert(field.db_name(), value);
            }
            continue;
        }

        // Nested tables: one sub-row per array item, linked by parent_id.
        if field.is_nested_table() {
            let Some(value) = record.remove(&field.id) else {
                continue;
            };
            let Some(items) = value.as_array() else {
                continue;
            };
            let parent_id = id_value.clone().unwrap_or_default();
            let rows: Vec<Map<String, Value>> = items
                .iter()
                .map(|item| {
                    let mut row = Map::new();
                    row.insert("parent_id".to_string(), Value::String(parent_id.clone()));
                    for subfield in field.subfields() {
                        if subfield.is_temporal {
                            continue;
                        }
                        row.insert(
                            subfield.db_name(),
                            item.get(&subfield.id).cloned().unwrap_or(Value::Null),
                        );
                    }
                    row
                })
                .collect();
            if !rows.is_empty() {
                row_set
                    .sub_rows
                    .insert(sub_table_id(table, &field), rows);
            }
            continue;
        }

        // n-m relations: through-table rows carrying both foreign keys.
        if field.nm_relation().is_some() {
            let Some(value) = record.remove(&field.id) else {
                continue;
            };
            let values: Vec<Value> = match value {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                single => vec![single],
            };
            let from_fk = id_value.clone().unwrap_or_default();
            let mut rows = Vec::with_capacity(values.len());
            for item in values {
                let mut row = Map::new();
                row.insert(
                    format!("{}_id", to_snake_case(table.name())),
                    Value::String(from_fk.clone()),
                );
                if table.has_composite_key() {
                    for key_field in table.identifier_fields()? {
                        row.insert(
                            to_snake_case(&format!("{}_{}", table.name(), key_field.name())),
                            record.get(&key_field.id).cloned().unwrap_or(Value::Null),
                        );
                    }
                }

                let to_fk = if field.is_array_of_objects() {
                    let mut parts = Vec::new();
                    for subfield in field.subfields() {
                        let bare = bare_subfield_id(&field, subfield);
                        let sub_value = item.get(bare).cloned().unwrap_or(Value::Null);
                        if !subfield.is_temporal && !sub_value.is_null() {
                            parts.push(plain_string(&sub_value));
                        }
                        let column = if subfield.is_temporal {
                            to_snake_case(bare)
                        } else {
                            subfield.db_name()
                        };
                        row.insert(column, sub_value);
                    }
                    Value::String(parts.join("."))
                } else {
                    item
                };
                row.insert(format!("{}_id", to_snake_case(field.name())), to_fk);
                rows.push(row);
            }
            if !rows.is_empty() {
                row_set
                    .sub_rows
                    .insert(sub_table_id(table, &field), rows);
            }
            continue;
        }

        // Plain objects: flattened into prefixed columns; objects stored
        // as JSON pass through as-is.
        if field.is_object() && field.format.as_deref() != Some("json") {
            let Some(value) = record.remove(&field.id) else {
                continue;
            };
            for subfield in field.subfields() {
                if subfield.is_temporal {
                    continue;
                }
                row_set.main.insert(
                    subfield.db_name(),
                    value
                        .get(bare_subfield_id(&field, subfield))
                        .cloned()
                        .unwrap_or(Value::Null),
                );
            }
            continue;
        }

        if field.is_schema_ref() {
            record.remove(&field.id);
            continue;
        }

        if let Some(value) = record.remove(&field.id) {
            row_set.main.insert(field.db_name(), value);
        }
    }

    // Keys that no field claimed (e.g. the generated `id`) pass through
    // snake-cased.
    for (key, value) in record.into_inner() {
        let key = if key == "id" { key } else { to_snake_case(&key) };
        row_set.main.entry(key).or_insert(value);
    }

    Ok(row_set)
}

/// The derived sub-table id for an array field, matching the derivation
/// engine's naming.
pub fn sub_table_id(table: &TableSchema, field: &FieldSchema) -> String {
    rel_table_identifier(
        table.dataset_id().len() + 1,
        &table.id,
        &to_snake_case(&field.id),
    )
}

/// A JSON scalar as its key-component text: strings keep their value,
/// numbers and booleans their literal form.
pub fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::DatasetSchema;
    use serde_json::json;

    fn bag() -> DatasetSchema {
        DatasetSchema::from_value(json!({
            "id": "bag",
            "type": "dataset",
            "crs": "EPSG:28992",
            "tables": [{
                "id": "verblijfsobjecten",
                "type": "table",
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "identifier": ["identificatie", "volgnummer"],
                    "required": ["identificatie", "volgnummer"],
                    "properties": {
                        "identificatie": {"type": "string"},
                        "volgnummer": {"type": "integer"},
                        "gebruiksdoel": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "code": {"type": "string"},
                                    "omschrijving": {"type": "string"}
                                }
                            }
                        },
                        "ligtInBuurt": {
                            "type": "object",
                            "relation": "gebieden:buurten",
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

    fn as_map(value: serde_json::Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_composite_key_and_flattening() {
        let dataset = bag();
        let table = dataset.get_declared_table("verblijfsobjecten").unwrap();
        let row_set = build_row_set(
            table,
            28992,
            as_map(json!({
                "identificatie": "VB.1",
                "volgnummer": 1,
                "ligtInBuurt": {"identificatie": "B.12", "volgnummer": 2},
                "geometrie": {"type": "Point", "coordinates": [1.0, 2.0]}
            })),
        )
        .unwrap();

        assert_eq!(row_set.main["id"], json!("VB.1.1"));
        assert_eq!(row_set.main["ligt_in_buurt_identificatie"], json!("B.12"));
        assert_eq!(row_set.main["ligt_in_buurt_volgnummer"], json!(2));
        assert_eq!(row_set.main["ligt_in_buurt_id"], json!("B.12.2"));
        assert_eq!(row_set.main["geometrie"], json!("SRID=28992;POINT(1 2)"));
    }

    #[test]
    fn test_nested_fan_out() {
        let dataset = bag();
        let table = dataset.get_declared_table("verblijfsobjecten").unwrap();
        let row_set = build_row_set(
            table,
            28992,
            as_map(json!({
                "identificatie": "VB.1",
                "volgnummer": 1,
                "gebruiksdoel": [
                    {"code": "1", "omschrijving": "doel 1"},
                    {"code": "2", "omschrijving": "doel 2"}
                ]
            })),
        )
        .unwrap();

        let nested = &row_set.sub_rows["verblijfsobjecten_gebruiksdoel"];
        assert_eq!(nested.len(), 2);
        assert_eq!(nested[0]["parent_id"], json!("VB.1.1"));
        assert_eq!(nested[0]["code"], json!("1"));
        assert_eq!(nested[1]["omschrijving"], json!("doel 2"));
    }

    #[test]
    fn test_missing_identifier_is_an_error() {
        let dataset = bag();
        let table = dataset.get_declared_table("verblijfsobjecten").unwrap();
        let err = build_row_set(table, 28992, as_map(json!({"volgnummer": 1}))).unwrap_err();
        assert!(matches!(err, ParseError::MissingIdentifier(_)));
    }

    #[test]
    fn test_null_relation_yields_null_columns() {
        let dataset = bag();
        let table = dataset.get_declared_table("verblijfsobjecten").unwrap();
        let row_set = build_row_set(
            table,
            28992,
            as_map(json!({
                "identificatie": "VB.1",
                "volgnummer": 1,
                "ligtInBuurt": null
            })),
        )
        .unwrap();
        assert_eq!(row_set.main["ligt_in_buurt_id"], Value::Null);
        assert_eq!(row_set.main["ligt_in_buurt_identificatie"], Value::Null);
    }
}
