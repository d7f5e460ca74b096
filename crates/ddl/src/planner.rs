use std::collections::{HashMap, HashSet};

use models::{DatasetCollection, DatasetSchema, Error, TableSchema};
use tables::{IndexMethod, NamingOptions, TableDescriptor};

/// The DDL for a set of datasets: ordered statements that create schemas,
/// tables and indexes. Generation is pure; execution lives in
/// [`crate::apply_statements`].
#[derive(Debug, Default)]
pub struct Plan {
    pub statements: Vec<String>,
}

impl Plan {
    pub fn push(&mut self, statement: impl Into<String>) {
        self.statements.push(statement.into());
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `CREATE SCHEMA` for a versioned dataset.
pub fn create_schema_statement(db_schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {db_schema}")
}

/// `CREATE TABLE` for one descriptor, column names quoted (reserved words
/// such as `table` occur).
pub fn create_table_statement(descriptor: &TableDescriptor) -> String {
    let mut clauses: Vec<String> = descriptor
        .columns
        .iter()
        .map(|column| {
            let mut clause = format!("{} {}", quote_ident(&column.name), column.sql_type.ddl());
            if !column.nullable {
                clause.push_str(" NOT NULL");
            }
            clause
        })
        .collect();

    let primary_keys: Vec<String> = descriptor
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| quote_ident(&c.name))
        .collect();
    if !primary_keys.is_empty() {
        clauses.push(format!("PRIMARY KEY ({})", primary_keys.join(", ")));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        descriptor.qualified_name(),
        clauses.join(",\n  ")
    )
}

/// `CREATE INDEX` for every index of the plan.
pub fn create_index_statements(descriptor: &TableDescriptor) -> Vec<String> {
    descriptor
        .indexes
        .iter()
        .map(|index| {
            let columns = index
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let using = match index.method {
                IndexMethod::BTree => String::new(),
                IndexMethod::Gist => " USING gist".to_string(),
            };
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}{using} ({columns})",
                index.name,
                descriptor.qualified_name(),
            )
        })
        .collect()
}

/// Order tables so that relation targets precede their referrers. The
/// relations carry no database-level constraints, but dependency order
/// keeps replay of the statements well-defined.
fn topo_sort(tables: Vec<TableSchema>) -> Vec<TableSchema> {
    let ids: HashSet<String> = tables.iter().map(|t| t.id.clone()).collect();
    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
    for table in &tables {
        let mut wants: Vec<String> = table
            .fields()
            .iter()
            .filter_map(|f| f.any_relation())
            .filter(|r| r.dataset_id == table.dataset_id() && ids.contains(&r.table_id))
            .map(|r| r.table_id.clone())
            .collect();
        if let Some(parent) = table.parent_table_id() {
            wants.push(parent.to_string());
        }
        wants.retain(|id| *id != table.id);
        dependencies.insert(table.id.clone(), wants);
    }

    let mut ordered = Vec::with_capacity(tables.len());
    let mut placed: HashSet<String> = HashSet::new();
    let mut pending = tables;
    while !pending.is_empty() {
        let ready: Vec<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                dependencies[&t.id]
                    .iter()
                    .all(|dep| placed.contains(dep) || !ids.contains(dep))
            })
            .map(|(i, _)| i)
            .collect();
        if ready.is_empty() {
            // Cyclic relations: emit the remainder in document order.
            ordered.extend(pending.drain(..));
            break;
        }
        for index in ready.into_iter().rev() {
            let table = pending.remove(index);
            placed.insert(table.id.clone());
            ordered.push(table);
        }
    }
    ordered
}

/// The full table/index plan for a dataset, including derived nested and
/// through tables. `versioned` selects the private-schema layout.
pub fn plan_dataset(
    dataset: &DatasetSchema,
    collection: &dyn DatasetCollection,
    versioned: bool,
) -> Result<Plan, Error> {
    let mut plan = Plan::default();
    let options = NamingOptions {
        versioned,
        ..NamingOptions::default()
    };

    if versioned {
        plan.push(create_schema_statement(&names::to_snake_case(&dataset.id)));
    }

    for table in topo_sort(dataset.tables_including_derived()) {
        if table.is_view() {
            continue;
        }
        let descriptor = TableDescriptor::from_table(dataset, &table, collection, &options)?;
        plan.push(create_table_statement(&descriptor));
        for statement in create_index_statements(&descriptor) {
            plan.push(statement);
        }
    }
    Ok(plan)
}
