//! One logical cluster joined by the local process.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::collections::{DistributedList, DistributedMap, DistributedSet};
use crate::config_store::ConfigStore;
use crate::configuration::{parse_bool, CONSUMER_KEY, NODE_PID, PRODUCER_KEY};
use crate::node::Node;
use crate::substrate::Substrate;

/// Name of the cluster every node joins at startup.
pub const DEFAULT_CLUSTER_NAME: &str = "cellar";

/// Handle on the distributed collections of one logical cluster.
///
/// Collections of the default cluster use their well-known names unchanged;
/// collections of any other cluster are prefixed with the cluster name.
pub struct Cluster {
    name: String,
    substrate: Arc<dyn Substrate>,
    store: Arc<ConfigStore>,
}

impl Cluster {
    /// Opens a logical cluster over a substrate.
    pub fn new(name: impl Into<String>, substrate: Arc<dyn Substrate>, store: Arc<ConfigStore>) -> Self {
        Self {
            name: name.into(),
            substrate,
            store,
        }
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying substrate.
    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Node-local configuration store.
    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Identity of the local process.
    pub fn local_node(&self) -> Node {
        self.substrate.local_node()
    }

    /// Current members.
    pub fn nodes(&self) -> Vec<Node> {
        self.substrate.members()
    }

    /// Finds a member by id.
    pub fn find_node(&self, id: &str) -> Option<Node> {
        self.nodes().into_iter().find(|n| n.id() == id)
    }

    /// Opens a distributed map of this cluster.
    pub fn map<V: Serialize + DeserializeOwned>(&self, name: &str) -> DistributedMap<V> {
        DistributedMap::new(self.substrate.clone(), self.qualify(name))
    }

    /// Opens a distributed list of this cluster.
    pub fn list<V: Serialize + DeserializeOwned + PartialEq>(&self, name: &str) -> DistributedList<V> {
        DistributedList::new(self.substrate.clone(), self.qualify(name))
    }

    /// Opens a distributed set of this cluster.
    pub fn set(&self, name: &str) -> DistributedSet {
        DistributedSet::new(self.substrate.clone(), self.qualify(name))
    }

    /// Qualified name of a collection of this cluster.
    pub fn qualify(&self, name: &str) -> String {
        if self.name == DEFAULT_CLUSTER_NAME {
            name.to_string()
        } else {
            format!("{}::{}", self.name, name)
        }
    }

    /// True when the local producer switch is ON in configuration.
    pub fn emits_events(&self) -> bool {
        self.read_flag(PRODUCER_KEY)
    }

    /// True when the local consumer switch is ON in configuration.
    pub fn accepts_events(&self) -> bool {
        self.read_flag(CONSUMER_KEY)
    }

    fn read_flag(&self, key: &str) -> bool {
        self.store
            .get_property(NODE_PID, key)
            .as_deref()
            .and_then(parse_bool)
            .unwrap_or(true)
    }
}
