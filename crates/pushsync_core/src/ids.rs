//! Resource identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a remote resource, used as a serialization key.
///
/// For installation and user operations this is the push registration id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Creates a resource id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A derived id naming a sub-resource, e.g. the message inbox of a
    /// registration. Derived ids serialize independently of their parent.
    pub fn child(&self, name: &str) -> ResourceId {
        ResourceId(format!("{}/{}", self.0, name))
    }

    /// The top-level id a derived id was made from (itself if not derived).
    pub fn root(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
