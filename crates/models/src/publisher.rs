use serde::{Deserialize, Serialize};

use crate::Error;

/// An access scope as published in the schema repository. Opaque to the
/// tooling apart from its id; kept whole for re-serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Scope {
    pub fn from_value(value: serde_json::Value) -> Result<Scope, Error> {
        Ok(serde_json::from_value(value)?)
    }
}

/// A publisher record from the schema repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publisher {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Publisher {
    pub fn from_value(value: serde_json::Value) -> Result<Publisher, Error> {
        Ok(serde_json::from_value(value)?)
    }
}
