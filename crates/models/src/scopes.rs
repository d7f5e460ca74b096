use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};

/// The scope that every request implicitly holds; data without an `auth`
/// clause is readable by it.
pub const PUBLIC_SCOPE: &str = "OPENBAAR";

/// A set of scope tokens as written in the `auth` clause of a dataset,
/// table or field. The JSON form is either a single string or a list of
/// strings; an absent clause is the empty set, which means public access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    pub fn new(scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ScopeSet(scopes.into_iter().map(Into::into).collect())
    }

    /// Whether this clause leaves the data public.
    pub fn is_public(&self) -> bool {
        self.0.is_empty() || self.0.iter().all(|s| s == PUBLIC_SCOPE)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// The scopes without the public one; used when a more specific layer
    /// overrides a broader one.
    pub fn without_public(&self) -> ScopeSet {
        ScopeSet(self.0.iter().filter(|s| *s != PUBLIC_SCOPE).cloned().collect())
    }
}

impl<'de> Deserialize<'de> for ScopeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(BTreeSet<String>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(scope) => ScopeSet(BTreeSet::from([scope])),
            OneOrMany::Many(scopes) => ScopeSet(scopes),
        })
    }
}

impl FromIterator<String> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        ScopeSet(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ScopeSet {
    type Item = &'a String;
    type IntoIter = std::collections::btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_scope_set_from_string_or_list() {
        let single: ScopeSet = serde_json::from_str("\"BRK/RO\"").unwrap();
        assert!(single.contains("BRK/RO"));

        let many: ScopeSet = serde_json::from_str(r#"["BRK/RO", "BRK/RSN"]"#).unwrap();
        assert!(many.contains("BRK/RO") && many.contains("BRK/RSN"));
    }

    #[test]
    fn test_public() {
        assert!(ScopeSet::default().is_public());
        assert!(ScopeSet::new(["OPENBAAR"]).is_public());
        assert!(!ScopeSet::new(["BRK/RO"]).is_public());
    }
}
