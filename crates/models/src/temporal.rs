use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Temporal configuration of a dataset: the field that distinguishes
/// versions of an object, plus named dimensions that bound each version's
/// validity in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Temporal {
    pub identifier: String,
    #[serde(default)]
    pub dimensions: BTreeMap<String, Dimension>,
}

/// A temporal dimension: the pair of fields holding the start and end of
/// a validity range, e.g. `["beginGeldigheid", "eindGeldigheid"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension(pub String, pub String);

impl Dimension {
    pub fn start(&self) -> &str {
        &self.0
    }

    pub fn end(&self) -> &str {
        &self.1
    }

    pub fn fields(&self) -> [&str; 2] {
        [&self.0, &self.1]
    }
}
