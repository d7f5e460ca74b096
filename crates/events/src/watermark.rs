use std::collections::HashMap;

use sqlx::PgConnection;

use crate::EventError;

/// The watermark table: one row per destination table (active and shadow
/// tables each have their own), holding the highest applied event id.
pub const LASTEVENTIDS_TABLE: &str = "benk_lasteventids";

/// Tracks the per-table `last_event_id` watermarks with upsert semantics.
/// Reads are cached for the lifetime of the processor and refreshed on
/// every write.
#[derive(Debug, Default)]
pub struct LastEventIds {
    cache: HashMap<String, Option<i64>>,
}

impl LastEventIds {
    pub fn new() -> LastEventIds {
        LastEventIds::default()
    }

    /// Create the watermark table when missing.
    pub async fn ensure_table(conn: &mut PgConnection) -> Result<(), EventError> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {LASTEVENTIDS_TABLE} (\"table\" text PRIMARY KEY, last_event_id bigint)"
        ))
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Whether `event_id` was already applied to `table_name`.
    pub async fn is_processed(
        &mut self,
        conn: &mut PgConnection,
        table_name: &str,
        event_id: i64,
    ) -> Result<bool, EventError> {
        Ok(match self.get(conn, table_name).await? {
            Some(last_event_id) => last_event_id >= event_id,
            None => false,
        })
    }

    pub async fn get(
        &mut self,
        conn: &mut PgConnection,
        table_name: &str,
    ) -> Result<Option<i64>, EventError> {
        if let Some(cached) = self.cache.get(table_name) {
            return Ok(*cached);
        }
        let row: Option<Option<i64>> = sqlx::query_scalar(&format!(
            "SELECT last_event_id FROM {LASTEVENTIDS_TABLE} WHERE \"table\" = $1"
        ))
        .bind(table_name)
        .fetch_optional(&mut *conn)
        .await?;
        let value = row.flatten();
        self.cache.insert(table_name.to_string(), value);
        Ok(value)
    }

    /// Upsert the watermark; `None` resets it (used when a shadow table
    /// starts a new sequence).
    pub async fn set(
        &mut self,
        conn: &mut PgConnection,
        table_name: &str,
        event_id: Option<i64>,
    ) -> Result<(), EventError> {
        sqlx::query(&format!(
            "INSERT INTO {LASTEVENTIDS_TABLE} (\"table\", last_event_id) VALUES ($1, $2) \
             ON CONFLICT (\"table\") DO UPDATE SET last_event_id = $2"
        ))
        .bind(table_name)
        .bind(event_id)
        .execute(conn)
        .await?;
        self.cache.insert(table_name.to_string(), event_id);
        Ok(())
    }

    /// Copy one table's watermark to another, as done when a shadow table
    /// replaces the active one.
    pub async fn copy(
        &mut self,
        conn: &mut PgConnection,
        from_table: &str,
        to_table: &str,
    ) -> Result<(), EventError> {
        let value = self.get(&mut *conn, from_table).await?;
        self.set(conn, to_table, value).await
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}
