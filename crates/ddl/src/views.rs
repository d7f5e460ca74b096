use models::{DatasetCollection, DatasetSchema, Error, TableSchema};

use crate::grants::{scope_to_role, write_role};

/// A syntactic sanity check on view SQL: a single SELECT (or WITH)
/// statement with balanced parentheses. This is not a parser; it guards
/// against obviously broken or multi-statement definitions before they
/// reach the database.
pub fn is_valid_view_sql(sql: &str) -> bool {
    let trimmed = sql.trim().trim_end_matches(';');
    if trimmed.contains(';') {
        return false;
    }
    let upper = trimmed.to_uppercase();
    if !upper.starts_with("SELECT") && !upper.starts_with("WITH") {
        return false;
    }
    let mut depth: i64 = 0;
    for c in trimmed.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    depth == 0
}

/// The scopes a view needs: for every `dataset:table` it derives from,
/// the table's scopes (falling back to its dataset's) plus any field
/// scopes.
pub fn required_view_scopes(
    table: &TableSchema,
    collection: &dyn DatasetCollection,
) -> Result<Vec<String>, Error> {
    let mut scopes: Vec<String> = Vec::new();
    for reference in table.derived_from() {
        let Some((dataset_id, table_id)) = reference.split_once(':') else {
            return Err(Error::InvalidSchema(format!(
                "view '{}' derives from '{reference}', expected 'dataset:table'",
                table.id
            )));
        };
        let dataset = collection.get_dataset(dataset_id)?;
        let source = dataset.get_table_by_id(table_id)?;

        if !source.auth.is_empty() {
            scopes.extend(source.auth.iter().map(str::to_string));
        } else {
            scopes.extend(dataset.auth.iter().map(str::to_string));
        }
        for field in source.fields() {
            scopes.extend(field.auth.iter().map(str::to_string));
        }
    }
    scopes.sort();
    scopes.dedup();
    Ok(scopes)
}

/// The statements creating one view: grant the required scope roles to
/// the dataset's writer role, create the view as that role, reset.
pub fn view_statements(
    dataset: &DatasetSchema,
    table: &TableSchema,
    collection: &dyn DatasetCollection,
) -> Result<Vec<String>, Error> {
    let Some(sql) = table.view_sql() else {
        return Err(Error::InvalidSchema(format!(
            "table '{}' is marked as view but carries no SQL",
            table.id
        )));
    };
    if !is_valid_view_sql(sql) {
        return Err(Error::InvalidSchema(format!(
            "view SQL of '{}' is not a single valid SELECT statement",
            table.id
        )));
    }

    let writer = write_role(&dataset.id);
    let mut statements = Vec::new();
    for scope in required_view_scopes(table, collection)? {
        statements.push(format!("GRANT {} TO {writer}", scope_to_role(&scope)));
    }
    statements.push(format!("SET ROLE {writer}"));
    statements.push(format!(
        "CREATE OR REPLACE VIEW {} AS {}",
        table.db_name(),
        sql.trim().trim_end_matches(';')
    ));
    statements.push("RESET ROLE".to_string());
    Ok(statements)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_view_sql_check() {
        assert!(is_valid_view_sql("SELECT id, naam FROM gebieden_buurten"));
        assert!(is_valid_view_sql(
            "WITH recent AS (SELECT * FROM x) SELECT * FROM recent;"
        ));
        assert!(!is_valid_view_sql("DROP TABLE gebieden_buurten"));
        assert!(!is_valid_view_sql("SELECT 1; SELECT 2"));
        assert!(!is_valid_view_sql("SELECT (1"));
    }
}
