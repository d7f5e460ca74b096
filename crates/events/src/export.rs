use std::io::Write;

use serde_json::Value;
use sqlx::{PgPool, Row};

use models::{DatasetCollection, DatasetSchema};
use tables::{NamingOptions, TableDescriptor};

use crate::event::{EventMeta, EventType};
use crate::EventError;

/// Write the current content of a table back out as `ADD` events in the
/// line-oriented replay format, one event per row.
pub async fn export_events(
    pool: &PgPool,
    dataset: &DatasetSchema,
    collection: &dyn DatasetCollection,
    table_id: &str,
    out: &mut impl Write,
) -> Result<u64, EventError> {
    let table = dataset.get_table_by_id(table_id)?;
    let descriptor =
        TableDescriptor::from_table(dataset, &table, collection, &NamingOptions::default())?;

    let sql = format!(
        "SELECT row_to_json(t)::text AS row FROM {} t",
        descriptor.qualified_name()
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;

    let mut count = 0u64;
    for row in rows {
        count += 1;
        let data: Value = serde_json::from_str(row.get::<String, _>("row").as_str())?;
        let meta = EventMeta {
            event_type: EventType::Add,
            event_id: count as i64,
            dataset_id: dataset.id.clone(),
            table_id: table.id.clone(),
            full_load_sequence: false,
            first_of_sequence: false,
            last_of_sequence: false,
        };
        writeln!(
            out,
            "{}|{}|{}",
            meta.event_id,
            serde_json::to_string(&meta)?,
            serde_json::to_string(&data)?
        )?;
    }
    Ok(count)
}
