//! Cluster member identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// One clustered process instance.
///
/// The id is assigned by the substrate when the process joins and is stable
/// for the lifetime of the process. Equality and hashing use the id only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    id: String,
    host: String,
    port: u16,
}

impl Node {
    /// Creates a node identity.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// Cluster-assigned unique id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host the node listens on.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port the node listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Display name, `host:port`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.name())
    }
}
