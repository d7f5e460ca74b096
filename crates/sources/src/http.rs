use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::{Error, SchemaLoader};

/// Loads dataset schemas from a schema repository URL. The repository
/// serves an `index.json` mapping dataset ids to relative paths, with the
/// documents underneath.
pub struct UrlSchemaLoader {
    base: Url,
    client: reqwest::blocking::Client,
}

impl UrlSchemaLoader {
    pub fn new(base: &str) -> Result<UrlSchemaLoader, Error> {
        let mut base = base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).map_err(|err| Error::InvalidLocation {
            location: base.clone(),
            reason: err.to_string(),
        })?;
        Ok(UrlSchemaLoader {
            base,
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("constructing an HTTP client cannot fail"),
        })
    }

    fn read_json_url(&self, relative: &str) -> Result<Value, Error> {
        let url = self.base.join(relative).map_err(|err| Error::InvalidLocation {
            location: format!("{}{relative}", self.base),
            reason: err.to_string(),
        })?;
        tracing::debug!(%url, "fetching schema document");
        let wrap = |source| Error::Http {
            url: url.to_string(),
            source,
        };
        self.client
            .get(url.clone())
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(wrap)?
            .json()
            .map_err(wrap)
    }
}

impl SchemaLoader for UrlSchemaLoader {
    fn read_index(&self) -> Result<BTreeMap<String, String>, Error> {
        let value = self.read_json_url("index.json")?;
        serde_json::from_value(value).map_err(|source| Error::Json {
            location: format!("{}index.json", self.base),
            source,
        })
    }

    fn read_dataset(&self, dataset_id: &str) -> Result<Value, Error> {
        let index = self.read_index()?;
        let relative = index
            .get(dataset_id)
            .ok_or_else(|| models::Error::DatasetNotFound(dataset_id.to_string()))?;
        self.read_json_url(&format!("{relative}/dataset"))
    }

    fn read_table(&self, dataset_id: &str, table_ref: &str) -> Result<Value, Error> {
        let index = self.read_index()?;
        let relative = index
            .get(dataset_id)
            .ok_or_else(|| models::Error::DatasetNotFound(dataset_id.to_string()))?;
        self.read_json_url(&format!("{relative}/{table_ref}"))
    }

    fn location(&self) -> String {
        self.base.to_string()
    }
}
