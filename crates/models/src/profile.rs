use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, PermissionLevel, ScopeSet};

/// A profile: a named policy that opens up data to users holding a
/// specific combination of scopes. Where the `auth` clauses of a schema
/// act as a blacklist, profiles act as a whitelist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSchema {
    pub name: String,
    #[serde(default)]
    pub scopes: ScopeSet,
    #[serde(default)]
    pub datasets: BTreeMap<String, ProfileDataset>,
}

impl ProfileSchema {
    pub fn from_value(value: serde_json::Value) -> Result<ProfileSchema, Error> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn dataset(&self, dataset_id: &str) -> Option<&ProfileDataset> {
        self.datasets.get(dataset_id)
    }
}

/// Permissions a profile grants within one dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDataset {
    /// Dataset-wide permission; tables not mentioned explicitly inherit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionLevel>,
    #[serde(default)]
    pub tables: BTreeMap<String, ProfileTable>,
}

/// Permissions a profile grants within one table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionLevel>,
    #[serde(default)]
    pub fields: BTreeMap<String, PermissionLevel>,
    /// Rules that gate listing access: the table only applies when at
    /// least one rule has all of its query parameters present.
    #[serde(default, rename = "mandatoryFilterSets")]
    pub mandatory_filtersets: Vec<Vec<String>>,
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_profile_parsing() {
        let profile = ProfileSchema::from_value(json!({
            "name": "brk_encoded",
            "scopes": ["BRK/ENCODED"],
            "datasets": {
                "brk": {
                    "tables": {
                        "kadastraleobjecten": {
                            "fields": {"identificatie": "encoded"},
                            "mandatoryFilterSets": [["buurtcode", "type"]]
                        }
                    }
                }
            }
        }))
        .unwrap();

        assert_eq!(profile.name, "brk_encoded");
        assert!(profile.scopes.contains("BRK/ENCODED"));
        let table = &profile.datasets["brk"].tables["kadastraleobjecten"];
        assert_eq!(table.fields["identificatie"], PermissionLevel::Encoded);
        assert_eq!(table.mandatory_filtersets, vec![vec!["buurtcode", "type"]]);
    }
}
