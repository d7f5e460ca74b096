use models::{DatasetCollection, DatasetSchema, Error, TableSchema};
use tables::{NamingOptions, TableDescriptor};

/// The DDL migrating a table from one version to another: added columns,
/// dropped columns and type changes, as `ALTER TABLE` statements against
/// the current physical name.
pub fn migrate_statements(
    dataset: &DatasetSchema,
    from: &TableSchema,
    to: &TableSchema,
    collection: &dyn DatasetCollection,
) -> Result<Vec<String>, Error> {
    let options = NamingOptions::default();
    let from_descriptor = TableDescriptor::from_table(dataset, from, collection, &options)?;
    let to_descriptor = TableDescriptor::from_table(dataset, to, collection, &options)?;
    let table = from_descriptor.qualified_name();

    let mut statements = Vec::new();
    for column in &to_descriptor.columns {
        match from_descriptor.column(&column.name) {
            None => {
                let mut clause = format!(
                    "ALTER TABLE {table} ADD COLUMN {} {}",
                    ddl::quote_ident(&column.name),
                    column.sql_type.ddl()
                );
                if !column.nullable {
                    clause.push_str(" NOT NULL");
                }
                statements.push(clause);
            }
            Some(existing) if existing.sql_type != column.sql_type => {
                statements.push(format!(
                    "ALTER TABLE {table} ALTER COLUMN {} TYPE {} USING {}::{}",
                    ddl::quote_ident(&column.name),
                    column.sql_type.ddl(),
                    ddl::quote_ident(&column.name),
                    column.sql_type.ddl()
                ));
            }
            Some(_) => {}
        }
    }
    for column in &from_descriptor.columns {
        if to_descriptor.column(&column.name).is_none() {
            statements.push(format!(
                "ALTER TABLE {table} DROP COLUMN {}",
                ddl::quote_ident(&column.name)
            ));
        }
    }
    Ok(statements)
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{EmptyCollection, TableSpec};
    use serde_json::json;

    fn table(version: &str, extra_property: bool) -> (DatasetSchema, TableSchema) {
        let mut properties = json!({
            "identificatie": {"type": "string"},
            "jaar": {"type": "integer"}
        });
        if extra_property {
            properties["omschrijving"] = json!({"type": "string"});
            properties["jaar"] = json!({"type": "string"});
        }
        let dataset = DatasetSchema::from_value(json!({
            "id": "nap",
            "type": "dataset",
            "tables": [{
                "id": "peilmerken",
                "type": "table",
                "version": version,
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "properties": properties.clone()
                }
            }]
        }))
        .unwrap();
        let spec: TableSpec = serde_json::from_value(json!({
            "id": "peilmerken",
            "type": "table",
            "version": version,
            "schema": {
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "properties": properties
            }
        }))
        .unwrap();
        let table = TableSchema::from_spec(&spec, dataset.context()).unwrap();
        (dataset, table)
    }

    #[test]
    fn test_column_diff() {
        let (dataset, from) = table("1.0.0", false);
        let (_, to) = table("2.0.0", true);

        let statements = migrate_statements(&dataset, &from, &to, &EmptyCollection).unwrap();
        assert!(statements
            .iter()
            .any(|s| s.contains("ADD COLUMN \"omschrijving\" character varying")));
        assert!(statements
            .iter()
            .any(|s| s.contains("ALTER COLUMN \"jaar\" TYPE character varying")));

        // The reverse migration drops the added column.
        let reverse = migrate_statements(&dataset, &to, &from, &EmptyCollection).unwrap();
        assert!(reverse.iter().any(|s| s.contains("DROP COLUMN \"omschrijving\"")));
    }
}
