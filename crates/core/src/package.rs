//! Package exports and imports declared by uploads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A versioned library identifier, e.g. `npm:left-pad@1.3.0`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageKey {
    pub scheme: String,
    pub name: String,
    pub version: String,
}

impl PackageKey {
    pub fn new(
        scheme: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.scheme, self.name, self.version)
    }
}

/// A package exported by an upload.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Package {
    pub upload_id: i64,
    #[serde(flatten)]
    pub key: PackageKey,
}

impl Package {
    pub fn new(upload_id: i64, key: PackageKey) -> Self {
        Self { upload_id, key }
    }
}

/// A package an upload depends on. The target need not be indexed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageReference {
    pub upload_id: i64,
    #[serde(flatten)]
    pub key: PackageKey,
}

impl PackageReference {
    pub fn new(upload_id: i64, key: PackageKey) -> Self {
        Self { upload_id, key }
    }
}
