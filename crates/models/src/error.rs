/// Errors raised while loading or navigating Amsterdam Schema documents.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("dataset '{0}' not found")]
    DatasetNotFound(String),

    #[error("table '{table}' does not exist in dataset '{dataset}', available are: '{available}'")]
    DatasetTableNotFound {
        dataset: String,
        table: String,
        available: String,
    },

    #[error("no field named '{qualified_id}' exists")]
    DatasetFieldNotFound { qualified_id: String },

    #[error("invalid Amsterdam schema file: {0}")]
    InvalidSchema(String),

    #[error("dataset '{dataset}' failed validation:\n{}", errors.join("\n"))]
    Validation {
        dataset: String,
        errors: Vec<String>,
    },

    #[error("failed to parse JSON document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema loader failure: {0}")]
    Loader(String),
}

impl Error {
    pub fn table_not_found(dataset: &str, table: &str, available: impl IntoIterator<Item = String>) -> Self {
        Self::DatasetTableNotFound {
            dataset: dataset.to_string(),
            table: table.to_string(),
            available: available.into_iter().collect::<Vec<_>>().join("', '"),
        }
    }

    pub fn field_not_found(dataset: &str, table: &str, field: &str) -> Self {
        Self::DatasetFieldNotFound {
            qualified_id: format!("{dataset}.{table}.{field}"),
        }
    }
}
