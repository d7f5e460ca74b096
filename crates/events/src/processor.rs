use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::{PgConnection, PgPool};

use models::{DatasetCollection, DatasetSchema, Error as ModelError, FieldSchema, TableSchema};
use names::to_snake_case;
use tables::{dml, NamingOptions, SqlType, TableDescriptor};

use crate::event::{Event, EventMeta, EventType};
use crate::watermark::LastEventIds;
use crate::EventError;

/// Postfix of the shadow tables that receive full-load sequences.
pub const FULL_LOAD_TABLE_POSTFIX: &str = "_full_load";

/// A dataset collection over the datasets handed to the processor.
struct MapCollection(HashMap<String, Arc<DatasetSchema>>);

impl DatasetCollection for MapCollection {
    fn get_dataset(&self, dataset_id: &str) -> Result<Arc<DatasetSchema>, ModelError> {
        self.0
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| ModelError::DatasetNotFound(dataset_id.to_string()))
    }
}

/// Denormalized relation columns on a parent table that must follow the
/// rows of a relation table.
#[derive(Debug, Clone)]
struct ParentUpdate {
    descriptor: TableDescriptor,
    /// Columns of the parent matching `<relation>_*`.
    columns: Vec<String>,
    /// The source-side foreign key column in the relation table rows,
    /// e.g. `peilmerken_id`.
    parent_ref_column: String,
    /// The identifier columns of the parent, prefixed as they appear in
    /// relation-table rows.
    prefixed_identifier_columns: Vec<String>,
}

/// What one batch of events operates on, including the recovery-mode
/// adjustments.
#[derive(Debug, Clone)]
struct RunConfiguration {
    check_existence_on_add: bool,
    process_events: bool,
    execute_after_process: bool,
    /// False for relation events without a physical relation table; only
    /// the parent columns are updated then.
    update_table: bool,
    descriptor: Option<TableDescriptor>,
    schema_table: Option<TableSchema>,
    /// The watermark key: the physical destination table name.
    table_name: String,
    parent_update: Option<ParentUpdate>,
    nested_fields: Vec<FieldSchema>,
    dataset_id: String,
}

/// The event processor: applies `ADD`/`MODIFY`/`DELETE` events to the
/// physical tables, maintains nested sub-tables and denormalized parent
/// columns, runs full-load sequences through shadow tables, and
/// deduplicates by per-table watermarks.
///
/// Construct it once with the datasets it will serve; missing tables
/// (including the watermark table) are created up front, shadow tables on
/// demand.
pub struct EventsProcessor {
    pool: PgPool,
    datasets: HashMap<String, Arc<DatasetSchema>>,
    tables: HashMap<(String, String), (TableDescriptor, TableSchema)>,
    full_load_tables: HashMap<(String, String), (TableDescriptor, TableSchema)>,
    lasteventids: LastEventIds,
}

impl EventsProcessor {
    /// Set up the processor: build descriptors for every (derived) table
    /// of the datasets, create missing tables, and optionally truncate
    /// them for a clean replay.
    pub async fn new(
        datasets: Vec<Arc<DatasetSchema>>,
        pool: PgPool,
        truncate: bool,
    ) -> Result<EventsProcessor, EventError> {
        let dataset_map: HashMap<String, Arc<DatasetSchema>> = datasets
            .iter()
            .map(|ds| (ds.id.clone(), ds.clone()))
            .collect();
        let collection = MapCollection(dataset_map.clone());

        let mut tables = HashMap::new();
        let mut statements = Vec::new();
        for dataset in &datasets {
            for table in dataset.tables_including_derived() {
                if table.is_view() {
                    continue;
                }
                let descriptor = TableDescriptor::from_table(
                    dataset,
                    &table,
                    &collection,
                    &NamingOptions::default(),
                )?;
                statements.push(ddl::create_table_statement(&descriptor));
                tables.insert(
                    (dataset.id.clone(), to_snake_case(&table.id)),
                    (descriptor, table),
                );
            }
        }
        ddl::apply_statements(&pool, &statements).await?;

        let mut conn = pool.acquire().await?;
        LastEventIds::ensure_table(&mut conn).await?;
        if truncate {
            for (descriptor, _) in tables.values() {
                sqlx::query(&format!("DELETE FROM {}", descriptor.qualified_name()))
                    .execute(&mut *conn)
                    .await?;
            }
        }
        drop(conn);

        Ok(EventsProcessor {
            pool,
            datasets: dataset_map,
            tables,
            full_load_tables: HashMap::new(),
            lasteventids: LastEventIds::new(),
        })
    }

    /// Process a single event.
    pub async fn process_event(
        &mut self,
        event: Event,
        recovery_mode: bool,
    ) -> Result<(), EventError> {
        self.process_events(&[event], recovery_mode).await
    }

    /// Process an ordered batch of events for one destination table.
    pub async fn process_events(
        &mut self,
        events: &[Event],
        recovery_mode: bool,
    ) -> Result<(), EventError> {
        let result = self.process_events_inner(events, recovery_mode).await;
        if result.is_err() {
            // A failed transaction may have advanced the in-memory
            // watermark past what was committed; re-read from the table.
            self.lasteventids.clear_cache();
        }
        result
    }

    async fn process_events_inner(
        &mut self,
        events: &[Event],
        recovery_mode: bool,
    ) -> Result<(), EventError> {
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Ok(());
        };

        let mut run = self.run_configuration(&first.meta, &last.meta, recovery_mode).await?;

        self.before_process(&run, &first.meta).await?;

        if run.process_events {
            if first.meta.full_load_sequence {
                // A full-load sequence only contains ADD events; bulk them.
                self.process_bulk_adds(&mut run, events).await?;
            } else {
                for event in events {
                    self.process_row(&run, event).await?;
                }
            }
        }

        if run.execute_after_process {
            self.after_process(&run, &last.meta).await?;
        }
        Ok(())
    }

    /// Replay an event file one event at a time.
    pub async fn load_events_from_file(&mut self, path: &Path) -> Result<(), EventError> {
        for event in crate::event::read_events_file(path)? {
            self.process_event(event, false).await?;
        }
        Ok(())
    }

    /// Replay an event file as one batch, taking the bulk path for
    /// full-load sequences.
    pub async fn load_events_from_file_bulk(&mut self, path: &Path) -> Result<(), EventError> {
        let events = crate::event::read_events_file(path)?;
        self.process_events(&events, false).await
    }

    fn collection(&self) -> MapCollection {
        MapCollection(self.datasets.clone())
    }

    fn dataset(&self, dataset_id: &str) -> Result<Arc<DatasetSchema>, EventError> {
        self.datasets
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| EventError::UnknownDataset(dataset_id.to_string()))
    }

    /// The shadow (full-load) table for a destination, created on first
    /// use.
    async fn full_load_table(
        &mut self,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<(TableDescriptor, TableSchema), EventError> {
        let key = (dataset_id.to_string(), to_snake_case(table_id));
        if let Some(found) = self.full_load_tables.get(&key) {
            return Ok(found.clone());
        }

        let dataset = self.dataset(dataset_id)?;
        let table = dataset.get_table_by_id(table_id)?;
        let descriptor = TableDescriptor::from_table(
            &dataset,
            &table,
            &self.collection(),
            &NamingOptions::with_postfix(FULL_LOAD_TABLE_POSTFIX),
        )?;
        ddl::apply_statements(&self.pool, &[ddl::create_table_statement(&descriptor)]).await?;

        let entry = (descriptor, table);
        self.full_load_tables.insert(key, entry.clone());
        Ok(entry)
    }

    fn active_table(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> Option<&(TableDescriptor, TableSchema)> {
        self.tables
            .get(&(dataset_id.to_string(), to_snake_case(table_id)))
    }

    async fn run_configuration(
        &mut self,
        first: &EventMeta,
        last: &EventMeta,
        recovery_mode: bool,
    ) -> Result<RunConfiguration, EventError> {
        let dataset_id = &first.dataset_id;
        let table_id = &first.table_id;
        let dataset = self.dataset(dataset_id)?;

        let resolved: Result<(TableDescriptor, TableSchema), EventError> =
            if first.full_load_sequence {
                self.full_load_table(dataset_id, table_id).await
            } else {
                self.active_table(dataset_id, table_id)
                    .cloned()
                    .ok_or_else(|| {
                        EventError::Model(ModelError::table_not_found(
                            dataset_id,
                            table_id,
                            dataset.tables().iter().map(|t| t.id.clone()),
                        ))
                    })
            };

        let mut run = match resolved {
            Ok((descriptor, schema_table)) => {
                let parent_update =
                    self.parent_update_for(&dataset, &schema_table)?;
                RunConfiguration {
                    check_existence_on_add: false,
                    process_events: true,
                    execute_after_process: true,
                    update_table: true,
                    table_name: descriptor.name.clone(),
                    nested_fields: schema_table
                        .fields()
                        .iter()
                        .filter(|f| f.is_nested_table())
                        .cloned()
                        .collect(),
                    descriptor: Some(descriptor),
                    schema_table: Some(schema_table),
                    parent_update,
                    dataset_id: dataset_id.clone(),
                }
            }
            Err(EventError::Model(ModelError::DatasetTableNotFound { .. })) => {
                // A relation event without a relation table in the
                // database: only the denormalized parent columns change.
                let Some((parent_table_id, field_id)) = table_id.split_once('_') else {
                    return Err(EventError::UnknownDestination {
                        dataset: dataset_id.clone(),
                        table: table_id.clone(),
                    });
                };
                let parent = dataset.get_declared_table(parent_table_id)?.clone();
                let field = parent.get_field_by_id(field_id)?.clone();
                if field.relation().is_none() {
                    return Err(EventError::UnknownDestination {
                        dataset: dataset_id.clone(),
                        table: table_id.clone(),
                    });
                }
                tracing::info!(
                    dataset = %dataset_id,
                    table = %table_id,
                    "relation has no table, only updating parent columns"
                );
                let parent_update =
                    self.build_parent_update(dataset_id, &parent, &field)?;
                RunConfiguration {
                    check_existence_on_add: false,
                    process_events: true,
                    execute_after_process: true,
                    update_table: false,
                    table_name: to_snake_case(table_id),
                    nested_fields: Vec::new(),
                    descriptor: None,
                    schema_table: None,
                    parent_update: Some(parent_update),
                    dataset_id: dataset_id.clone(),
                }
            }
            Err(other) => return Err(other),
        };

        if recovery_mode {
            self.recover(&mut run, first, last).await?;
        }
        Ok(run)
    }

    /// Parent denormalization applies when the destination is a relation
    /// table spawned by a 1-n relation field of its parent.
    fn parent_update_for(
        &self,
        dataset: &DatasetSchema,
        schema_table: &TableSchema,
    ) -> Result<Option<ParentUpdate>, EventError> {
        let (Some(parent_table_id), Some([_, field_id])) = (
            schema_table.parent_table_id(),
            schema_table.through_fields(),
        ) else {
            return Ok(None);
        };
        let Ok(parent) = dataset.get_declared_table(parent_table_id) else {
            return Ok(None);
        };
        let Ok(field) = parent.get_field_by_id(field_id) else {
            return Ok(None);
        };
        if field.relation().is_none() {
            return Ok(None);
        }
        Ok(Some(self.build_parent_update(&dataset.id, parent, field)?))
    }

    fn build_parent_update(
        &self,
        dataset_id: &str,
        parent: &TableSchema,
        field: &FieldSchema,
    ) -> Result<ParentUpdate, EventError> {
        let (descriptor, _) = self
            .active_table(dataset_id, &parent.id)
            .ok_or_else(|| {
                EventError::Model(ModelError::table_not_found(
                    dataset_id,
                    &parent.id,
                    std::iter::empty(),
                ))
            })?
            .clone();

        let relation_prefix = format!("{}_", to_snake_case(field.name()));
        let columns: Vec<String> = descriptor
            .columns
            .iter()
            .filter(|c| c.name.starts_with(&relation_prefix))
            .map(|c| c.name.clone())
            .collect();

        let parent_name = to_snake_case(parent.name());
        let prefixed_identifier_columns = parent
            .identifier_fields()?
            .iter()
            .map(|f| format!("{parent_name}_{}", to_snake_case(f.name())))
            .collect();

        Ok(ParentUpdate {
            descriptor,
            columns,
            parent_ref_column: format!("{parent_name}_id"),
            prefixed_identifier_columns,
        })
    }

    /// The recovery-mode classification for redelivered batches.
    async fn recover(
        &mut self,
        run: &mut RunConfiguration,
        first: &EventMeta,
        last: &EventMeta,
    ) -> Result<(), EventError> {
        // The shadow table's content only matters for the sequence-end
        // case; probe it lazily.
        let shadow_empty = if first.full_load_sequence
            && !first.first_of_sequence
            && last.last_of_sequence
        {
            match &run.descriptor {
                Some(descriptor) => self.table_empty(descriptor).await?,
                None => true,
            }
        } else {
            false
        };

        let actions = recovery_actions(first, last, shadow_empty);
        run.check_existence_on_add = actions.check_existence_on_add;
        run.process_events = actions.process_events;
        run.execute_after_process = actions.execute_after_process;
        Ok(())
    }

    /// Truncate the shadow table and reset its watermark at the start of
    /// a full-load sequence.
    async fn before_process(
        &mut self,
        run: &RunConfiguration,
        first: &EventMeta,
    ) -> Result<(), EventError> {
        if !run.update_table || !first.full_load_sequence || !first.first_of_sequence {
            return Ok(());
        }
        let descriptor = run.descriptor.as_ref().expect("update_table implies a descriptor");
        let mut conn = self.pool.acquire().await?;
        sqlx::query(&format!("TRUNCATE {}", descriptor.qualified_name()))
            .execute(&mut *conn)
            .await?;
        self.lasteventids.set(&mut conn, &run.table_name, None).await?;
        Ok(())
    }

    /// At the end of a full-load sequence, atomically swap the shadow
    /// content into the active tables, refresh parent columns in bulk,
    /// drop the shadows, and carry the watermark over.
    async fn after_process(
        &mut self,
        run: &RunConfiguration,
        last: &EventMeta,
    ) -> Result<(), EventError> {
        if !run.update_table || !last.full_load_sequence || !last.last_of_sequence {
            return Ok(());
        }
        let dataset_id = &run.dataset_id;
        let schema_table = run
            .schema_table
            .as_ref()
            .expect("update_table implies a schema table");

        tracing::info!(table = %run.table_name, "end of full load sequence, replacing active table");

        let mut table_ids = vec![to_snake_case(&schema_table.id)];
        let dataset = self.dataset(dataset_id)?;
        for field in &run.nested_fields {
            let nested = dataset.build_nested_table(schema_table, field);
            table_ids.push(to_snake_case(&nested.id));
        }

        // Resolve all shadow tables before opening the transaction.
        let mut replacements = Vec::with_capacity(table_ids.len());
        for table_id in &table_ids {
            let (active, _) = self
                .active_table(dataset_id, table_id)
                .ok_or_else(|| {
                    EventError::Model(ModelError::table_not_found(
                        dataset_id,
                        table_id,
                        std::iter::empty(),
                    ))
                })?
                .clone();
            let (shadow, shadow_schema) = self.full_load_table(dataset_id, table_id).await?;
            replacements.push((active, shadow, shadow_schema));
        }

        let mut txn = self.pool.begin().await?;
        for (active, shadow, shadow_schema) in &replacements {
            // Nested tables let the database regenerate their ids.
            let columns: Vec<String> = if shadow_schema.is_nested_table() {
                active.data_columns().map(|c| dml::quote(&c.name)).collect()
            } else {
                active.columns.iter().map(|c| dml::quote(&c.name)).collect()
            };
            let column_list = columns.join(", ");
            sqlx::query(&format!("TRUNCATE {}", active.qualified_name()))
                .execute(&mut *txn)
                .await?;
            sqlx::query(&format!(
                "INSERT INTO {} ({column_list}) SELECT {column_list} FROM {}",
                active.qualified_name(),
                shadow.qualified_name()
            ))
            .execute(&mut *txn)
            .await?;
        }

        if let Some(parent_update) = &run.parent_update {
            let shadow = &replacements[0].1;
            self.update_parent_table_bulk(&mut txn, parent_update, shadow)
                .await?;
        }

        for (_, shadow, _) in &replacements {
            sqlx::query(&format!("DROP TABLE {} CASCADE", shadow.qualified_name()))
                .execute(&mut *txn)
                .await?;
        }
        for table_id in &table_ids {
            self.full_load_tables
                .remove(&(dataset_id.clone(), table_id.clone()));
        }

        let active_name = replacements[0].0.name.clone();
        self.lasteventids
            .copy(&mut txn, &run.table_name, &active_name)
            .await?;
        self.lasteventids
            .set(&mut txn, &run.table_name, None)
            .await?;

        txn.commit().await?;
        Ok(())
    }

    /// Apply one normal event in its own transaction.
    async fn process_row(&mut self, run: &RunConfiguration, event: &Event) -> Result<(), EventError> {
        let mut conn = self.pool.acquire().await?;
        if self
            .lasteventids
            .is_processed(&mut conn, &run.table_name, event.meta.event_id)
            .await?
        {
            tracing::warn!(event_id = event.meta.event_id, "event already processed, skipping");
            return Ok(());
        }
        drop(conn);

        let row = prepare_row(run, &event.data)?;
        let id_value = row.get("id").cloned().unwrap_or(Value::Null);

        if run.update_table
            && run.check_existence_on_add
            && event.meta.event_type == EventType::Add
            && self
                .row_exists(run.descriptor.as_ref().expect("update_table"), &row)
                .await?
        {
            tracing::info!(id = %id_value, "row already exists in database, skipping");
            return Ok(());
        }

        let mut txn = self.pool.begin().await?;
        if run.update_table {
            let descriptor = run.descriptor.as_ref().expect("update_table");
            let key_value = row
                .get(descriptor.key_column())
                .cloned()
                .unwrap_or(Value::Null);

            match event.meta.event_type {
                EventType::Add => {
                    let columns = dml::write_columns(descriptor, &row);
                    let sql = dml::insert_statement(descriptor, &columns);
                    dml::bind_row(sqlx::query(&sql), &columns, &row)?
                        .execute(&mut *txn)
                        .await?;
                }
                EventType::Modify => {
                    let columns = dml::write_columns(descriptor, &row);
                    let sql = dml::update_statement(descriptor, &columns);
                    let key_column = key_column(descriptor)?;
                    let query = dml::bind_row(sqlx::query(&sql), &columns, &row)?;
                    tables::bind_value(query, key_column, &key_value)?
                        .execute(&mut *txn)
                        .await?;
                }
                EventType::Delete => {
                    let key_column = key_column(descriptor)?;
                    let sql = format!(
                        "DELETE FROM {} WHERE {} = $1",
                        descriptor.qualified_name(),
                        dml::quote(&key_column.name)
                    );
                    tables::bind_value(sqlx::query(&sql), key_column, &key_value)?
                        .execute(&mut *txn)
                        .await?;
                }
            }

            self.update_nested_tables(&mut txn, run, &row, event.meta.event_type)
                .await?;
        }

        self.lasteventids
            .set(&mut txn, &run.table_name, Some(event.meta.event_id))
            .await?;

        if let Some(parent_update) = &run.parent_update {
            update_parent_table(&mut txn, parent_update, event.meta.event_type, &row).await?;
        }

        txn.commit().await?;
        Ok(())
    }

    /// The bulk path for full-load sequences: filter out already-applied
    /// events, insert the rest in one transaction, and advance the
    /// watermark once.
    async fn process_bulk_adds(
        &mut self,
        run: &mut RunConfiguration,
        events: &[Event],
    ) -> Result<(), EventError> {
        let mut rows: Vec<Map<String, Value>> = Vec::with_capacity(events.len());
        let mut last_event_id = None;
        let mut first = true;

        let mut conn = self.pool.acquire().await?;
        for event in events {
            if event.meta.event_type != EventType::Add {
                return Err(EventError::NonAddInFullLoad {
                    event_id: event.meta.event_id,
                });
            }
            let row = prepare_row(run, &event.data)?;

            if run.check_existence_on_add && first && run.update_table {
                // Events within a batch are contiguous, so probing the
                // first row decides for the whole batch.
                if self
                    .row_exists(run.descriptor.as_ref().expect("update_table"), &row)
                    .await?
                {
                    tracing::info!("first row already present, skipping bulk adds");
                    return Ok(());
                }
                first = false;
            }

            if self
                .lasteventids
                .is_processed(&mut conn, &run.table_name, event.meta.event_id)
                .await?
            {
                tracing::warn!(
                    event_id = event.meta.event_id,
                    "event already processed, skipping"
                );
                continue;
            }

            last_event_id = Some(event.meta.event_id);
            rows.push(row);
        }
        drop(conn);

        if rows.is_empty() {
            return Ok(());
        }

        let mut txn = self.pool.begin().await?;
        if run.update_table {
            let descriptor = run.descriptor.as_ref().expect("update_table");
            for row in &rows {
                let columns = dml::write_columns(descriptor, row);
                let sql = dml::insert_statement(descriptor, &columns);
                dml::bind_row(sqlx::query(&sql), &columns, row)?
                    .execute(&mut *txn)
                    .await?;
            }
        }
        txn.commit().await?;

        // Nested rows go to the shadow sub-tables, outside the insert
        // transaction only in that shadow tables may need creating.
        if run.update_table && !run.nested_fields.is_empty() {
            self.update_nested_tables_bulk(run, &rows).await?;
        }

        let mut conn = self.pool.acquire().await?;
        self.lasteventids
            .set(&mut conn, &run.table_name, last_event_id)
            .await?;
        Ok(())
    }

    /// Replace the nested sub-table rows belonging to one parent row.
    async fn update_nested_tables(
        &mut self,
        txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        run: &RunConfiguration,
        row: &Map<String, Value>,
        event_type: EventType,
    ) -> Result<(), EventError> {
        let Some(schema_table) = &run.schema_table else {
            return Ok(());
        };
        let dataset = self.dataset(&run.dataset_id)?;
        let id_value = row.get("id").cloned().unwrap_or_else(|| {
            run.descriptor
                .as_ref()
                .and_then(|d| row.get(d.key_column()).cloned())
                .unwrap_or(Value::Null)
        });

        for field in &run.nested_fields {
            let nested = dataset.build_nested_table(schema_table, field);
            let Some((descriptor, _)) = self.active_table(&run.dataset_id, &nested.id) else {
                continue;
            };
            let descriptor = descriptor.clone();

            sqlx::query(&format!(
                "DELETE FROM {} WHERE parent_id = $1",
                descriptor.qualified_name()
            ))
            .bind(value_as_string(&id_value))
            .execute(&mut **txn)
            .await?;

            if event_type == EventType::Delete {
                continue;
            }
            for nested_row in nested_rows(field, row, &id_value) {
                let columns = dml::write_columns(&descriptor, &nested_row);
                let sql = dml::insert_statement(&descriptor, &columns);
                dml::bind_row(sqlx::query(&sql), &columns, &nested_row)?
                    .execute(&mut **txn)
                    .await?;
            }
        }
        Ok(())
    }

    /// Bulk variant used inside full-load sequences: nested rows are
    /// written to the shadow sub-tables.
    async fn update_nested_tables_bulk(
        &mut self,
        run: &RunConfiguration,
        rows: &[Map<String, Value>],
    ) -> Result<(), EventError> {
        let Some(schema_table) = &run.schema_table else {
            return Ok(());
        };
        let dataset = self.dataset(&run.dataset_id)?;

        for field in &run.nested_fields {
            let nested = dataset.build_nested_table(schema_table, field);
            let (descriptor, _) = self.full_load_table(&run.dataset_id, &nested.id).await?;

            let mut txn = self.pool.begin().await?;
            for row in rows {
                let id_value = row.get("id").cloned().unwrap_or(Value::Null);
                for nested_row in nested_rows(field, row, &id_value) {
                    let columns = dml::write_columns(&descriptor, &nested_row);
                    let sql = dml::insert_statement(&descriptor, &columns);
                    dml::bind_row(sqlx::query(&sql), &columns, &nested_row)?
                        .execute(&mut *txn)
                        .await?;
                }
            }
            txn.commit().await?;
        }
        Ok(())
    }

    /// Per-event parent refresh lives in [`update_parent_table`]; this is
    /// the bulk variant joining parent and shadow relation table.
    async fn update_parent_table_bulk(
        &self,
        txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        parent_update: &ParentUpdate,
        shadow: &TableDescriptor,
    ) -> Result<(), EventError> {
        if parent_update.columns.is_empty() {
            return Ok(());
        }
        let set_clause = if parent_update.columns.len() > 1 {
            format!(
                "({}) = ({})",
                parent_update.columns.join(", "),
                parent_update
                    .columns
                    .iter()
                    .map(|c| format!("s.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        } else {
            format!("{0} = s.{0}", parent_update.columns[0])
        };
        sqlx::query(&format!(
            "UPDATE {parent} p SET {set_clause} FROM {shadow} s WHERE p.{key} = s.{reference}",
            parent = parent_update.descriptor.qualified_name(),
            shadow = shadow.qualified_name(),
            key = dml::quote(parent_update.descriptor.key_column()),
            reference = dml::quote(&parent_update.parent_ref_column),
        ))
        .execute(&mut **txn)
        .await?;
        Ok(())
    }

    async fn row_exists(
        &self,
        descriptor: &TableDescriptor,
        row: &Map<String, Value>,
    ) -> Result<bool, EventError> {
        let key_column = key_column(descriptor)?;
        let key_value = row.get(&key_column.name).cloned().unwrap_or(Value::Null);
        let sql = format!(
            "SELECT 1 FROM {} WHERE {} = $1 LIMIT 1",
            descriptor.qualified_name(),
            dml::quote(&key_column.name)
        );
        let probe = tables::bind_value(sqlx::query(&sql), key_column, &key_value)?;
        Ok(probe.fetch_optional(&self.pool).await?.is_some())
    }

    async fn table_empty(&self, descriptor: &TableDescriptor) -> Result<bool, EventError> {
        let exists: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT 1 FROM {} LIMIT 1",
            descriptor.qualified_name()
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(exists.is_none())
    }
}

/// Per-event refresh of the denormalized relation columns on the parent
/// table: copied from the relation row for `ADD`/`MODIFY`, nulled for
/// `DELETE`.
async fn update_parent_table(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    parent_update: &ParentUpdate,
    event_type: EventType,
    row: &Map<String, Value>,
) -> Result<(), EventError> {
    if parent_update.columns.is_empty() {
        return Ok(());
    }

    let parent_id = parent_id_value(parent_update, row);
    let assignments: Vec<String> = parent_update
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", dml::quote(c), i + 1))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ${}",
        parent_update.descriptor.qualified_name(),
        assignments.join(", "),
        dml::quote(parent_update.descriptor.key_column()),
        parent_update.columns.len() + 1
    );

    let mut query = sqlx::query(&sql);
    for column_name in &parent_update.columns {
        let value = if event_type == EventType::Delete {
            Value::Null
        } else {
            row.get(column_name).cloned().unwrap_or(Value::Null)
        };
        let column = parent_update
            .descriptor
            .column(column_name)
            .expect("parent column exists");
        query = tables::bind_value(query, column, &value)?;
    }
    let key_column = key_column(&parent_update.descriptor)?;
    query = tables::bind_value(query, key_column, &Value::String(parent_id))?;
    query.execute(&mut **txn).await?;
    Ok(())
}

/// The parent row key as found in a relation-table row: the prefixed
/// identifier columns joined, with the plain source foreign key as
/// fallback.
fn parent_id_value(parent_update: &ParentUpdate, row: &Map<String, Value>) -> String {
    let parts: Vec<String> = parent_update
        .prefixed_identifier_columns
        .iter()
        .filter_map(|c| row.get(c).filter(|v| !v.is_null()).map(value_as_string))
        .collect();
    if parts.len() == parent_update.prefixed_identifier_columns.len() && !parts.is_empty() {
        return parts.join(".");
    }
    row.get(&parent_update.parent_ref_column)
        .map(value_as_string)
        .unwrap_or_default()
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Rows for the nested sub-table of one parent row.
fn nested_rows(
    field: &FieldSchema,
    row: &Map<String, Value>,
    id_value: &Value,
) -> Vec<Map<String, Value>> {
    let key = to_snake_case(&field.id);
    let Some(Value::Array(items)) = row.get(&key).or_else(|| row.get(&field.id)) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| {
            let mut nested_row = Map::new();
            nested_row.insert(
                "parent_id".to_string(),
                Value::String(value_as_string(id_value)),
            );
            for subfield in field.subfields() {
                if subfield.is_temporal {
                    continue;
                }
                let column = subfield.db_name();
                let value = item
                    .get(&column)
                    .or_else(|| item.get(&subfield.id))
                    .cloned()
                    .unwrap_or(Value::Null);
                nested_row.insert(column, value);
            }
            nested_row
        })
        .collect()
}

/// Build the physical row for one event: flatten nested objects to
/// `a_b` keys, null out schema columns the event does not carry, prefix
/// bare geometries with the SRID, and compute the joined key value.
fn prepare_row(
    run: &RunConfiguration,
    data: &Map<String, Value>,
) -> Result<Map<String, Value>, EventError> {
    let mut row = Map::new();
    flatten_into(&mut row, data, "");

    let Some(descriptor) = &run.descriptor else {
        return Ok(row);
    };

    // Missing schema columns become explicit NULLs; the generated id is
    // computed below instead.
    for column in &descriptor.columns {
        if column.name != "id" && !row.contains_key(&column.name) {
            row.insert(column.name.clone(), Value::Null);
        }
    }

    for column in &descriptor.columns {
        if let SqlType::Geometry { srid, .. } = &column.sql_type {
            if let Some(Value::String(wkt)) = row.get(&column.name) {
                if !wkt.starts_with("SRID") {
                    let prefixed = format!("SRID={srid};{wkt}");
                    row.insert(column.name.clone(), Value::String(prefixed));
                }
            }
        }
    }

    if run.update_table {
        let schema_table = run.schema_table.as_ref().expect("update_table");
        let mut parts = Vec::new();
        for field in schema_table.identifier_fields()? {
            let column = field.db_name();
            match row.get(&column).filter(|v| !v.is_null()) {
                Some(value) => parts.push(value_as_string(value)),
                None => {
                    return Err(EventError::MissingIdentifier {
                        field: field.qualified_id(),
                    })
                }
            }
        }
        let id_value = parts.join(".");
        if descriptor.column("id").is_some() {
            row.insert("id".to_string(), Value::String(id_value));
        }
    }
    Ok(row)
}

/// The physical column holding the row key, erroring on tables that have
/// none (legacy schemas without a declared identifier).
fn key_column(descriptor: &TableDescriptor) -> Result<&tables::ColumnDescriptor, EventError> {
    descriptor
        .column(descriptor.key_column())
        .ok_or_else(|| EventError::MissingIdentifier {
            field: format!("{}.{}", descriptor.table_id, descriptor.key_column()),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecoveryActions {
    check_existence_on_add: bool,
    process_events: bool,
    execute_after_process: bool,
}

/// What a redelivered batch must do, by its position in (or outside) a
/// full-load sequence:
///
/// 1. not sequenced: replay with existence checks on `ADD`;
/// 2. sequence start: the truncate makes plain replay safe;
/// 3. sequence middle: replay with existence checks;
/// 4. sequence end with an empty shadow: the swap already ran, skip
///    everything; with a non-empty shadow: replay with existence checks,
///    then swap.
fn recovery_actions(first: &EventMeta, last: &EventMeta, shadow_empty: bool) -> RecoveryActions {
    let mut actions = RecoveryActions {
        check_existence_on_add: false,
        process_events: true,
        execute_after_process: true,
    };
    if !first.full_load_sequence {
        actions.check_existence_on_add = true;
    } else if first.first_of_sequence {
        // Replay truncates the shadow and starts over.
    } else if !last.last_of_sequence {
        actions.check_existence_on_add = true;
    } else if shadow_empty {
        actions.process_events = false;
        actions.execute_after_process = false;
    } else {
        actions.check_existence_on_add = true;
    }
    actions
}

/// `{a: {b: v}}` becomes `{a_b: v}`; arrays and scalars pass through.
fn flatten_into(target: &mut Map<String, Value>, source: &Map<String, Value>, prefix: &str) {
    for (key, value) in source {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}_{key}")
        };
        match value {
            Value::Object(nested) => flatten_into(target, nested, &full_key),
            other => {
                target.insert(full_key, other.clone());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::EmptyCollection;
    use serde_json::json;

    fn meta(
        full_load_sequence: bool,
        first_of_sequence: bool,
        last_of_sequence: bool,
    ) -> EventMeta {
        EventMeta {
            event_type: EventType::Add,
            event_id: 1,
            dataset_id: "gebieden".to_string(),
            table_id: "bouwblokken".to_string(),
            full_load_sequence,
            first_of_sequence,
            last_of_sequence,
        }
    }

    #[test]
    fn test_recovery_classification() {
        // Case 1: plain events replay with existence checks.
        let actions = recovery_actions(&meta(false, false, false), &meta(false, false, false), false);
        assert!(actions.check_existence_on_add);
        assert!(actions.process_events && actions.execute_after_process);

        // Case 2: a sequence start truncates; no checks needed.
        let actions = recovery_actions(&meta(true, true, false), &meta(true, false, false), false);
        assert!(!actions.check_existence_on_add);
        assert!(actions.process_events && actions.execute_after_process);

        // Case 3: sequence middle.
        let actions = recovery_actions(&meta(true, false, false), &meta(true, false, false), false);
        assert!(actions.check_existence_on_add);

        // Case 4a: sequence end, empty shadow: fully handled before.
        let actions = recovery_actions(&meta(true, false, false), &meta(true, false, true), true);
        assert!(!actions.process_events);
        assert!(!actions.execute_after_process);

        // Case 4b: sequence end, shadow holds data: replay and swap.
        let actions = recovery_actions(&meta(true, false, false), &meta(true, false, true), false);
        assert!(actions.check_existence_on_add);
        assert!(actions.process_events && actions.execute_after_process);
    }

    #[test]
    fn test_flatten() {
        let mut row = Map::new();
        let source = match json!({
            "identificatie": "VB.1",
            "status": {"code": 3, "omschrijving": "Vervallen"},
            "gebruiksdoel": [{"code": "1"}]
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        flatten_into(&mut row, &source, "");

        assert_eq!(row["identificatie"], json!("VB.1"));
        assert_eq!(row["status_code"], json!(3));
        assert_eq!(row["status_omschrijving"], json!("Vervallen"));
        // Arrays are left intact for the nested-table fan-out.
        assert_eq!(row["gebruiksdoel"], json!([{"code": "1"}]));
    }

    fn gebieden() -> DatasetSchema {
        DatasetSchema::from_value(json!({
            "id": "gebieden",
            "type": "dataset",
            "crs": "EPSG:28992",
            "tables": [{
                "id": "bouwblokken",
                "type": "table",
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "identifier": ["identificatie", "volgnummer"],
                    "required": ["identificatie", "volgnummer"],
                    "properties": {
                        "identificatie": {"type": "string"},
                        "volgnummer": {"type": "integer"},
                        "code": {"type": "string"},
                        "geometrie": {"$ref": "https://geojson.org/schema/Polygon.json"}
                    }
                }
            }]
        }))
        .unwrap()
    }

    fn run_for(dataset: &DatasetSchema, table_id: &str) -> RunConfiguration {
        let table = dataset.get_table_by_id(table_id).unwrap();
        let descriptor = TableDescriptor::from_table(
            dataset,
            &table,
            &EmptyCollection,
            &NamingOptions::default(),
        )
        .unwrap();
        RunConfiguration {
            check_existence_on_add: false,
            process_events: true,
            execute_after_process: true,
            update_table: true,
            table_name: descriptor.name.clone(),
            nested_fields: Vec::new(),
            descriptor: Some(descriptor),
            schema_table: Some(table),
            parent_update: None,
            dataset_id: dataset.id.clone(),
        }
    }

    #[test]
    fn test_prepare_row_computes_key_and_nulls() {
        let dataset = gebieden();
        let run = run_for(&dataset, "bouwblokken");
        let data = match json!({"identificatie": "03630012096976", "volgnummer": 1}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let row = prepare_row(&run, &data).unwrap();

        assert_eq!(row["id"], json!("03630012096976.1"));
        // Columns the event does not carry become explicit NULLs.
        assert_eq!(row["code"], Value::Null);
    }

    #[test]
    fn test_prepare_row_prefixes_srid() {
        let dataset = gebieden();
        let run = run_for(&dataset, "bouwblokken");
        let data = match json!({
            "identificatie": "A",
            "volgnummer": 1,
            "geometrie": "POLYGON((0 0, 1 0, 1 1, 0 0))"
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let row = prepare_row(&run, &data).unwrap();
        assert_eq!(row["geometrie"], json!("SRID=28992;POLYGON((0 0, 1 0, 1 1, 0 0))"));

        // Already-prefixed geometries stay as they are.
        let data = match json!({
            "identificatie": "A",
            "volgnummer": 1,
            "geometrie": "SRID=28992;POLYGON((0 0, 1 0, 1 1, 0 0))"
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let row = prepare_row(&run, &data).unwrap();
        assert_eq!(row["geometrie"], json!("SRID=28992;POLYGON((0 0, 1 0, 1 1, 0 0))"));
    }

    #[test]
    fn test_prepare_row_missing_identifier() {
        let dataset = gebieden();
        let run = run_for(&dataset, "bouwblokken");
        let data = match json!({"identificatie": "A"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let err = prepare_row(&run, &data).unwrap_err();
        assert!(matches!(err, EventError::MissingIdentifier { .. }));
    }
}
