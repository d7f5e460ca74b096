//! The streaming event processor: an idempotent, at-least-once ingester
//! of ordered per-object `ADD`/`MODIFY`/`DELETE` events, with full-load
//! sequences over shadow tables, per-table watermarks, and a recovery
//! mode for redelivered broker batches.

mod event;
mod export;
mod processor;
mod watermark;

pub use event::{read_events_file, Event, EventMeta, EventType};
pub use export::export_events;
pub use processor::{EventsProcessor, FULL_LOAD_TABLE_POSTFIX};
pub use watermark::{LastEventIds, LASTEVENTIDS_TABLE};

/// Errors of event processing. SQL failures roll back the surrounding
/// transaction, leaving the watermark unadvanced.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("dataset '{0}' is not configured for this processor")]
    UnknownDataset(String),

    #[error("event for '{dataset}.{table}' has no destination table or relation")]
    UnknownDestination { dataset: String, table: String },

    #[error("event misses a value for identifier field '{field}'")]
    MissingIdentifier { field: String },

    #[error("event {event_id} is not an ADD inside a full-load sequence")]
    NonAddInFullLoad { event_id: i64 },

    #[error("malformed event line: {0}")]
    MalformedLine(String),

    #[error(transparent)]
    Model(#[from] models::Error),

    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Bind(#[from] tables::BindError),

    #[error("failed to read event file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse event JSON: {0}")]
    Json(#[from] serde_json::Error),
}
