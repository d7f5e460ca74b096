use serde::{Deserialize, Serialize};

/// Access level for a dataset, table or field, as used in profiles.
///
/// Levels are totally ordered; a higher level implies every lower one.
/// `Read` grants the value as-is, the middle levels grant progressively
/// degraded renditions (encoded, random, first letters), and
/// `SubobjectsOnly` only permits descending into sub-objects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    #[default]
    None,
    SubobjectsOnly,
    Letters,
    Random,
    Encoded,
    Read,
}

impl PermissionLevel {
    /// The level that gives unrestricted read access.
    pub const fn highest() -> Self {
        PermissionLevel::Read
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::None => "none",
            PermissionLevel::SubobjectsOnly => "subobjects_only",
            PermissionLevel::Letters => "letters",
            PermissionLevel::Random => "random",
            PermissionLevel::Encoded => "encoded",
            PermissionLevel::Read => "read",
        }
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A computed permission: the granted level plus where it came from.
///
/// The source (`"dataset.auth"`, `"table.auth"`, `"field.auth"`,
/// `"field.filter_auth"` or a profile name) is diagnostic only and does not
/// participate in comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub level: PermissionLevel,
    pub source: Option<String>,
}

impl Permission {
    /// No access at all.
    pub const fn none() -> Self {
        Permission {
            level: PermissionLevel::None,
            source: None,
        }
    }

    pub fn new(level: PermissionLevel, source: impl Into<String>) -> Self {
        Permission {
            level,
            source: Some(source.into()),
        }
    }

    pub fn read(source: impl Into<String>) -> Self {
        Self::new(PermissionLevel::highest(), source)
    }

    /// Whether any access is granted.
    pub fn granted(&self) -> bool {
        self.level > PermissionLevel::None
    }

    /// The higher of two permissions, keeping the winner's source.
    pub fn max(self, other: Permission) -> Permission {
        if other.level > self.level {
            other
        } else {
            self
        }
    }
}

impl PartialOrd for Permission {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.level.partial_cmp(&other.level)
    }
}
