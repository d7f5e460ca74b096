//! Bulk import of NDJSON and GeoJSON files into the physical tables of a
//! dataset, with provenance mapping, geometry conversion, fan-out to
//! nested and through sub-tables, deduplication and batched inserts.

mod geojson_input;
mod geometry;
mod importer;
mod ndjson;
mod record;
mod rows;

pub use geojson_input::read_geojson;
pub use geometry::geojson_to_ewkt;
pub use importer::{BulkImporter, ImportStats};
pub use ndjson::read_ndjson;
pub use record::{jsonpath, Record};
pub use rows::{build_row_set, sub_table_id, RowSet};

/// Errors while parsing input records. Parse errors abort the file;
/// record-level problems are counted and logged by the importer instead.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("'{0}' is not a valid GeoJSON file")]
    InvalidGeoJson(String),

    #[error("not a GeoJSON geometry: {0}")]
    InvalidGeometry(String),

    #[error("record is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("record misses identifier field '{0}'")]
    MissingIdentifier(String),

    #[error(transparent)]
    Model(#[from] models::Error),
}

/// Errors of a full import run.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Model(#[from] models::Error),

    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Bind(#[from] tables::BindError),
}
