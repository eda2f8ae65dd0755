//! Registry of the logical clusters joined by the local process.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::info;

use crate::cluster::{Cluster, DEFAULT_CLUSTER_NAME};
use crate::config_store::ConfigStore;
use crate::error::{CellarError, Result};
use crate::node::Node;
use crate::substrate::Substrate;

/// Aggregates joined clusters and resolves nodes.
pub struct ClusterManager {
    substrate: Arc<dyn Substrate>,
    store: Arc<ConfigStore>,
    clusters: RwLock<BTreeMap<String, Arc<Cluster>>>,
}

impl ClusterManager {
    /// Creates the manager and joins the default cluster.
    pub fn new(substrate: Arc<dyn Substrate>, store: Arc<ConfigStore>) -> Self {
        let default = Arc::new(Cluster::new(
            DEFAULT_CLUSTER_NAME,
            substrate.clone(),
            store.clone(),
        ));
        let mut clusters = BTreeMap::new();
        clusters.insert(DEFAULT_CLUSTER_NAME.to_string(), default);
        Self {
            substrate,
            store,
            clusters: RwLock::new(clusters),
        }
    }

    /// The cluster joined at startup.
    pub fn default_cluster(&self) -> Arc<Cluster> {
        self.clusters
            .read()
            .get(DEFAULT_CLUSTER_NAME)
            .cloned()
            .unwrap_or_else(|| {
                Arc::new(Cluster::new(
                    DEFAULT_CLUSTER_NAME,
                    self.substrate.clone(),
                    self.store.clone(),
                ))
            })
    }

    /// Joins a logical cluster. Joining twice returns the same handle.
    pub fn join_cluster(&self, name: &str) -> Arc<Cluster> {
        let mut clusters = self.clusters.write();
        clusters
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(cluster = name, "joined cluster");
                Arc::new(Cluster::new(name, self.substrate.clone(), self.store.clone()))
            })
            .clone()
    }

    /// Leaves a logical cluster. Returns false if it was not joined.
    pub fn leave_cluster(&self, name: &str) -> Result<bool> {
        if name == DEFAULT_CLUSTER_NAME {
            return Err(CellarError::DefaultClusterProtected);
        }
        let removed = self.clusters.write().remove(name).is_some();
        if removed {
            info!(cluster = name, "left cluster");
        }
        Ok(removed)
    }

    /// Leaves every cluster except the default one. Returns how many were left.
    pub fn leave_all_clusters(&self) -> usize {
        let mut clusters = self.clusters.write();
        let before = clusters.len();
        clusters.retain(|name, _| name == DEFAULT_CLUSTER_NAME);
        before - clusters.len()
    }

    /// Finds a joined cluster.
    pub fn find_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().get(name).cloned()
    }

    /// Names of joined clusters, sorted.
    pub fn list_clusters(&self) -> Vec<String> {
        self.clusters.read().keys().cloned().collect()
    }

    /// Every member of the substrate, sorted by id.
    pub fn list_nodes(&self) -> Vec<Node> {
        let mut nodes = self.substrate.members();
        nodes.sort();
        nodes
    }

    /// Identity of the local process.
    pub fn local_node(&self) -> Node {
        self.substrate.local_node()
    }

    /// Finds a member by id.
    pub fn find_node_by_id(&self, id: &str) -> Option<Node> {
        self.substrate.members().into_iter().find(|n| n.id() == id)
    }

    /// Finds every member whose id is listed. Unknown ids are skipped.
    pub fn find_nodes_by_ids(&self, ids: &[String]) -> HashSet<Node> {
        self.substrate
            .members()
            .into_iter()
            .filter(|n| ids.iter().any(|id| id == n.id()))
            .collect()
    }

    /// Finds a member by `host:port` name.
    pub fn find_node_by_name(&self, name: &str) -> Option<Node> {
        self.substrate.members().into_iter().find(|n| n.name() == name)
    }

    /// Resolves a node given either its id or its `host:port` name.
    pub fn resolve_node(&self, id_or_name: &str) -> Result<Node> {
        self.find_node_by_id(id_or_name)
            .or_else(|| self.find_node_by_name(id_or_name))
            .ok_or_else(|| CellarError::NodeNotFound(id_or_name.to_string()))
    }

    /// Generates a cluster-unique id.
    pub fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
