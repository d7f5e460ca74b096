//! Resolution of Amsterdam Schema documents from their storage location:
//! a filesystem tree of `dataset.json` files or a schema repository URL.
//! All loaded datasets are shared through a single [`CachedSchemaLoader`],
//! which doubles as the process-wide dataset collection.

mod filesystem;
mod http;
mod loader;
mod profiles;

pub use filesystem::FileSystemSchemaLoader;
pub use http::UrlSchemaLoader;
pub use loader::{CachedSchemaLoader, SchemaLoader};
pub use profiles::{
    publishers_from_dir, scopes_from_dir, FileSystemProfileLoader, ProfileLoader, UrlProfileLoader,
};

/// Default location of the dataset schema repository.
pub const DEFAULT_SCHEMA_URL: &str = "https://schemas.data.amsterdam.nl/datasets/";

/// Default location of the profile repository.
pub const DEFAULT_PROFILE_URL: &str = "https://schemas.data.amsterdam.nl/profiles/";

/// Errors raised while locating or reading schema documents.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Model(#[from] models::Error),

    #[error("failed to read '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch '{url}'")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid Amsterdam schema file '{location}'")]
    Json {
        location: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid schema location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },
}

impl Error {
    /// Flatten into the model error space, for the `DatasetCollection`
    /// trait whose callers only know `models::Error`.
    pub fn into_model_error(self) -> models::Error {
        match self {
            Error::Model(inner) => inner,
            other => models::Error::Loader(other.to_string()),
        }
    }
}

/// Pick the loader matching the location: URLs get the HTTP loader,
/// anything else is treated as a filesystem path.
pub fn get_schema_loader(location: &str) -> Result<Box<dyn SchemaLoader>, Error> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(UrlSchemaLoader::new(location)?))
    } else {
        Ok(Box::new(FileSystemSchemaLoader::new(location)?))
    }
}

/// Pick the profile loader matching the location.
pub fn get_profile_loader(location: &str) -> Result<Box<dyn ProfileLoader>, Error> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(UrlProfileLoader::new(location)?))
    } else {
        Ok(Box::new(FileSystemProfileLoader::new(location)?))
    }
}
