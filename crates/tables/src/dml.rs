use serde_json::{Map, Value};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

use crate::{bind_value, BindError, ColumnDescriptor, SqlType, TableDescriptor};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// The columns to write for a row: every column of the table, except an
/// autoincrement key the row does not supply.
pub fn write_columns<'d>(
    descriptor: &'d TableDescriptor,
    row: &Map<String, Value>,
) -> Vec<&'d ColumnDescriptor> {
    descriptor
        .columns
        .iter()
        .filter(|column| column.sql_type != SqlType::BigSerial || row.contains_key(&column.name))
        .collect()
}

/// `INSERT INTO t ("a", "b") VALUES ($1, ST_GeomFromEWKT($2))` for the
/// given columns.
pub fn insert_statement(descriptor: &TableDescriptor, columns: &[&ColumnDescriptor]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote(&c.name)).collect();
    let values: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| c.insert_expression(&format!("${}", i + 1)))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        descriptor.qualified_name(),
        names.join(", "),
        values.join(", ")
    )
}

/// `UPDATE t SET "a" = $1, ... WHERE "key" = $n` for the given columns.
pub fn update_statement(descriptor: &TableDescriptor, columns: &[&ColumnDescriptor]) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{} = {}",
                quote(&c.name),
                c.insert_expression(&format!("${}", i + 1))
            )
        })
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {} = ${}",
        descriptor.qualified_name(),
        assignments.join(", "),
        quote(descriptor.key_column()),
        columns.len() + 1
    )
}

/// Bind the row's value (or NULL) for each column, in order.
pub fn bind_row<'q>(
    mut query: PgQuery<'q>,
    columns: &[&ColumnDescriptor],
    row: &Map<String, Value>,
) -> Result<PgQuery<'q>, BindError> {
    for column in columns {
        let value = row.get(&column.name).unwrap_or(&Value::Null);
        query = bind_value(query, column, value)?;
    }
    Ok(query)
}

pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{NamingOptions, TableDescriptor};
    use models::{DatasetSchema, EmptyCollection};
    use serde_json::json;

    fn descriptor() -> TableDescriptor {
        let dataset = DatasetSchema::from_value(json!({
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
                    "required": ["identificatie"],
                    "properties": {
                        "identificatie": {"type": "string"},
                        "geometrie": {"$ref": "https://geojson.org/schema/Point.json"}
                    }
                }
            }]
        }))
        .unwrap();
        let table = dataset.get_declared_table("peilmerken").unwrap().clone();
        TableDescriptor::from_table(&dataset, &table, &EmptyCollection, &NamingOptions::default())
            .unwrap()
    }

    #[test]
    fn test_insert_statement_wraps_geometry() {
        let descriptor = descriptor();
        let columns = write_columns(&descriptor, &serde_json::Map::new());
        let sql = insert_statement(&descriptor, &columns);
        assert_eq!(
            sql,
            "INSERT INTO nap_peilmerken (\"identificatie\", \"geometrie\") \
             VALUES ($1, ST_GeomFromEWKT($2))"
        );
    }

    #[test]
    fn test_update_statement_targets_key() {
        let descriptor = descriptor();
        let columns = write_columns(&descriptor, &serde_json::Map::new());
        let sql = update_statement(&descriptor, &columns);
        assert!(sql.ends_with("WHERE \"identificatie\" = $3"));
    }
}
