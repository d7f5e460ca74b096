use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde_json::{Map, Value};
use sqlx::PgPool;

use models::{DatasetCollection, DatasetSchema, TableSchema};
use tables::{dml, NamingOptions, TableDescriptor};

use crate::rows::{build_row_set, plain_string, RowSet};
use crate::{geojson_input, ndjson, ImportError};

/// Counters reported after an import run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: u64,
    pub duplicates: u64,
    pub record_errors: u64,
}

/// Imports NDJSON and GeoJSON files into the physical tables of one
/// dataset table, fanning records out to nested and through sub-tables.
pub struct BulkImporter<'a> {
    pool: &'a PgPool,
    batch_size: usize,
}

struct Target {
    descriptors: BTreeMap<String, TableDescriptor>,
    main_table_id: String,
    /// Known primary keys of the main table, to skip duplicates.
    seen_keys: HashSet<String>,
}

impl<'a> BulkImporter<'a> {
    pub fn new(pool: &'a PgPool) -> BulkImporter<'a> {
        BulkImporter {
            pool,
            batch_size: 100,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> BulkImporter<'a> {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Import one NDJSON file into `table_id` of `dataset`.
    pub async fn import_ndjson(
        &self,
        dataset: &DatasetSchema,
        collection: &dyn DatasetCollection,
        table_id: &str,
        path: &Path,
    ) -> Result<ImportStats, ImportError> {
        let table = dataset.get_table_by_id(table_id)?;
        let mut target = self.prepare_target(dataset, &table, collection).await?;

        let srid = dataset.srid().unwrap_or(28992);
        let mut stats = ImportStats::default();
        let mut batch: Vec<RowSet> = Vec::with_capacity(self.batch_size);

        tracing::info!(file = %path.display(), table = %table.id, "importing NDJSON");
        for record in ndjson::read_ndjson(path)? {
            let record = record?;
            match build_row_set(&table, srid, record) {
                Ok(row_set) => {
                    batch.push(row_set);
                    if batch.len() >= self.batch_size {
                        self.flush(&mut target, &mut batch, &mut stats).await?;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "skipping record");
                    stats.record_errors += 1;
                }
            }
        }
        self.flush(&mut target, &mut batch, &mut stats).await?;
        tracing::info!(imported = stats.imported, duplicates = stats.duplicates, "import done");
        Ok(stats)
    }

    /// Import one GeoJSON FeatureCollection into `table_id` of `dataset`.
    pub async fn import_geojson(
        &self,
        dataset: &DatasetSchema,
        collection: &dyn DatasetCollection,
        table_id: &str,
        path: &Path,
    ) -> Result<ImportStats, ImportError> {
        let table = dataset.get_table_by_id(table_id)?;
        let mut target = self.prepare_target(dataset, &table, collection).await?;

        let srid = dataset.srid().unwrap_or(28992);
        let mut stats = ImportStats::default();
        let mut batch: Vec<RowSet> = Vec::with_capacity(self.batch_size);

        tracing::info!(file = %path.display(), table = %table.id, "importing GeoJSON");
        for record in geojson_input::read_geojson(path, &table)? {
            match build_row_set(&table, srid, record) {
                Ok(row_set) => {
                    batch.push(row_set);
                    if batch.len() >= self.batch_size {
                        self.flush(&mut target, &mut batch, &mut stats).await?;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "skipping feature");
                    stats.record_errors += 1;
                }
            }
        }
        self.flush(&mut target, &mut batch, &mut stats).await?;
        Ok(stats)
    }

    /// Build descriptors for the table and its sub-tables, create them
    /// when missing, and snapshot the existing primary keys for
    /// deduplication.
    async fn prepare_target(
        &self,
        dataset: &DatasetSchema,
        table: &TableSchema,
        collection: &dyn DatasetCollection,
    ) -> Result<Target, ImportError> {
        let options = NamingOptions::default();
        let mut descriptors = BTreeMap::new();
        descriptors.insert(
            table.id.clone(),
            TableDescriptor::from_table(dataset, table, collection, &options)?,
        );
        for field in table.fields() {
            if field.is_nested_table() {
                let nested = dataset.build_nested_table(table, field);
                descriptors.insert(
                    nested.id.clone(),
                    TableDescriptor::from_table(dataset, &nested, collection, &options)?,
                );
            } else if field.is_through_table() && field.is_array() {
                let through = dataset.build_through_table(table, field);
                descriptors.insert(
                    through.id.clone(),
                    TableDescriptor::from_table(dataset, &through, collection, &options)?,
                );
            }
        }

        let mut statements = Vec::new();
        for descriptor in descriptors.values() {
            statements.push(ddl::create_table_statement(descriptor));
        }
        ddl::apply_statements(self.pool, &statements).await?;

        // Autoincrement keys cannot clash; everything else is read once.
        let main = &descriptors[&table.id];
        let seen_keys = if table.is_autoincrement() {
            HashSet::new()
        } else {
            let sql = format!(
                "SELECT {}::text FROM {}",
                dml::quote(main.key_column()),
                main.qualified_name()
            );
            sqlx::query_scalar::<_, Option<String>>(&sql)
                .fetch_all(self.pool)
                .await?
                .into_iter()
                .flatten()
                .collect()
        };

        Ok(Target {
            main_table_id: table.id.clone(),
            descriptors,
            seen_keys,
        })
    }

    /// Write one batch in a single transaction. Duplicate keys are
    /// skipped with a warning; an insert failure aborts the batch.
    async fn flush(
        &self,
        target: &mut Target,
        batch: &mut Vec<RowSet>,
        stats: &mut ImportStats,
    ) -> Result<(), ImportError> {
        if batch.is_empty() {
            return Ok(());
        }

        let main = target.descriptors[&target.main_table_id].clone();
        let mut txn = self.pool.begin().await?;

        for row_set in batch.drain(..) {
            let key = row_set
                .main
                .get(main.key_column())
                .map(plain_string)
                .unwrap_or_default();
            if !key.is_empty() && !target.seen_keys.insert(key.clone()) {
                tracing::warn!(
                    table = %main.name,
                    key = %key,
                    "duplicate record, skipping"
                );
                stats.duplicates += 1;
                continue;
            }

            insert_row(&mut txn, &main, &row_set.main).await?;
            for (sub_table, rows) in &row_set.sub_rows {
                let Some(descriptor) = target.descriptors.get(sub_table) else {
                    continue;
                };
                for row in rows {
                    insert_row(&mut txn, descriptor, row).await?;
                }
            }
            stats.imported += 1;
        }

        txn.commit().await?;
        Ok(())
    }
}

async fn insert_row(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    descriptor: &TableDescriptor,
    row: &Map<String, Value>,
) -> Result<(), ImportError> {
    let columns = dml::write_columns(descriptor, row);
    let sql = dml::insert_statement(descriptor, &columns);
    let query = dml::bind_row(sqlx::query(&sql), &columns, row)?;
    query.execute(&mut *txn).await?;
    Ok(())
}
