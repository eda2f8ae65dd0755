//! Remote service endpoints.
//!
//! One cluster-wide map records, per service interface and version, the nodes
//! hosting it. Entries are edited under their entry lock and dropped once no
//! node hosts them. Departed members are pruned from every entry.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use cellar_core::collections::DistributedMap;
use cellar_core::substrate::MembershipEvent;
use cellar_core::{CellarNode, Cluster, Node, NodeService};

use crate::error::Result;

/// Cluster-wide map of exported endpoints.
pub const ENDPOINTS_MAP: &str = "org.apache.karaf.cellar.dosgi.endpoints";

/// A service interface exported by one or more nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescription {
    /// `service_class/version`.
    pub id: String,
    /// Service interface.
    pub service_class: String,
    /// Interface version.
    pub version: String,
    /// Nodes hosting the service.
    pub nodes: BTreeSet<Node>,
}

impl EndpointDescription {
    /// Endpoint id of a service interface and version.
    pub fn endpoint_id(service_class: &str, version: &str) -> String {
        format!("{}/{}", service_class, version)
    }

    fn new(service_class: &str, version: &str) -> Self {
        Self {
            id: Self::endpoint_id(service_class, version),
            service_class: service_class.to_string(),
            version: version.to_string(),
            nodes: BTreeSet::new(),
        }
    }
}

/// Export and import of remote services for the local node.
pub struct EndpointRegistry {
    cluster: Arc<Cluster>,
    endpoints: DistributedMap<EndpointDescription>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointRegistry {
    /// Registry over the endpoints map of `cluster`.
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            endpoints: cluster.map(ENDPOINTS_MAP),
            cluster,
            watcher: Mutex::new(None),
        }
    }

    /// Advertises a service hosted by the local node. Returns false when it
    /// was already advertised.
    pub async fn export(&self, service_class: &str, version: &str) -> Result<bool> {
        let id = EndpointDescription::endpoint_id(service_class, version);
        let _lock = self.endpoints.lock(&id).await?;
        let mut endpoint = self
            .endpoints
            .get(&id)?
            .unwrap_or_else(|| EndpointDescription::new(service_class, version));
        if !endpoint.nodes.insert(self.cluster.local_node()) {
            return Ok(false);
        }
        self.endpoints.put(&id, &endpoint)?;
        info!(endpoint = %id, "service exported");
        Ok(true)
    }

    /// Withdraws the local node from a service. Returns false when it was not
    /// advertised.
    pub async fn unexport(&self, service_class: &str, version: &str) -> Result<bool> {
        let id = EndpointDescription::endpoint_id(service_class, version);
        self.remove_node(&id, &self.cluster.local_node()).await
    }

    async fn remove_node(&self, id: &str, node: &Node) -> Result<bool> {
        let _lock = self.endpoints.lock(id).await?;
        let Some(mut endpoint) = self.endpoints.get(id)? else {
            return Ok(false);
        };
        if !endpoint.nodes.remove(node) {
            return Ok(false);
        }
        if endpoint.nodes.is_empty() {
            self.endpoints.remove(id)?;
            info!(endpoint = %id, "last provider gone, endpoint removed");
        } else {
            self.endpoints.put(id, &endpoint)?;
        }
        Ok(true)
    }

    /// Looks up an endpoint.
    pub fn endpoint(&self, service_class: &str, version: &str) -> Result<Option<EndpointDescription>> {
        Ok(self
            .endpoints
            .get(&EndpointDescription::endpoint_id(service_class, version))?)
    }

    /// Nodes other than the local one hosting a service.
    pub fn remote_providers(&self, service_class: &str, version: &str) -> Result<Vec<Node>> {
        let local = self.cluster.local_node();
        Ok(self
            .endpoint(service_class, version)?
            .map(|e| e.nodes.into_iter().filter(|n| *n != local).collect())
            .unwrap_or_default())
    }

    /// Every endpoint, by id.
    pub fn endpoints(&self) -> Result<Vec<EndpointDescription>> {
        Ok(self.endpoints.entries()?.into_values().collect())
    }

    /// Removes a node from every endpoint. Returns the number of endpoints it
    /// was withdrawn from.
    pub async fn prune(&self, node: &Node) -> Result<usize> {
        let mut pruned = 0;
        for id in self.endpoints.keys()? {
            if self.remove_node(&id, node).await? {
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    /// Starts pruning departed members. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }
        let mut rx = self.cluster.substrate().subscribe_membership();
        let weak = Arc::downgrade(self);
        *watcher = Some(tokio::spawn(async move {
            loop {
                let event = rx.recv().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                match event {
                    Ok(MembershipEvent::MemberRemoved(node)) => match registry.prune(&node).await {
                        Ok(0) => {}
                        Ok(pruned) => info!(node = %node, pruned, "departed node pruned from endpoints"),
                        Err(e) => warn!(node = %node, error = %e, "failed to prune endpoints"),
                    },
                    Ok(MembershipEvent::MemberAdded(_)) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "endpoint watcher lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    /// True while departed members are being pruned.
    pub fn is_running(&self) -> bool {
        self.watcher.lock().is_some()
    }
}

impl NodeService for EndpointRegistry {
    fn name(&self) -> &str {
        "endpoints"
    }

    fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for EndpointRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Creates the endpoint registry of a node and starts pruning departed
/// members until the node shuts down.
pub fn register(node: &CellarNode) -> Arc<EndpointRegistry> {
    let registry = Arc::new(EndpointRegistry::new(node.cluster()));
    registry.start();
    node.register_service(registry.clone());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_core::{CellarConfig, ConfigStore, MemoryGrid};

    fn registry(grid: &MemoryGrid, host: &str) -> EndpointRegistry {
        let member = Arc::new(grid.join(host, 5701));
        EndpointRegistry::new(Arc::new(Cluster::new(
            "cellar",
            member,
            Arc::new(ConfigStore::in_memory()),
        )))
    }

    #[tokio::test]
    async fn test_export_unexport() {
        let grid = MemoryGrid::new();
        let a = registry(&grid, "a");
        let b = registry(&grid, "b");

        assert!(a.export("org.example.Greeter", "1.0").await.unwrap());
        assert!(!a.export("org.example.Greeter", "1.0").await.unwrap());
        assert!(b.export("org.example.Greeter", "1.0").await.unwrap());

        let endpoint = a.endpoint("org.example.Greeter", "1.0").unwrap().unwrap();
        assert_eq!(endpoint.nodes.len(), 2);
        assert_eq!(a.remote_providers("org.example.Greeter", "1.0").unwrap().len(), 1);

        assert!(a.unexport("org.example.Greeter", "1.0").await.unwrap());
        assert!(!a.unexport("org.example.Greeter", "1.0").await.unwrap());
        assert!(b.unexport("org.example.Greeter", "1.0").await.unwrap());
        assert!(a.endpoints().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_departed_node() {
        let grid = MemoryGrid::new();
        let a = registry(&grid, "a");
        let b = registry(&grid, "b");
        a.export("org.example.Greeter", "1.0").await.unwrap();
        b.export("org.example.Greeter", "1.0").await.unwrap();
        b.export("org.example.Clock", "2.0").await.unwrap();

        let departed = b.cluster.local_node();
        assert_eq!(a.prune(&departed).await.unwrap(), 2);
        let remaining = a.endpoints().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "org.example.Greeter/1.0");
    }

    #[tokio::test]
    async fn test_registered_registry_stops_with_node() {
        let grid = MemoryGrid::new();
        let node = CellarNode::open(CellarConfig::default(), Arc::new(grid.join("a", 5701))).unwrap();
        let registry = register(&node);
        node.start().await.unwrap();
        assert!(registry.is_running());

        node.shutdown().await.unwrap();
        assert!(!registry.is_running());
        let weak = Arc::downgrade(&registry);
        drop(registry);
        drop(node);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_registry_over_joined_cluster_is_scoped() {
        let grid = MemoryGrid::new();
        let node = CellarNode::open(CellarConfig::default(), Arc::new(grid.join("a", 5701))).unwrap();
        let east = EndpointRegistry::new(node.clusters().join_cluster("east"));
        let default = EndpointRegistry::new(node.cluster());

        assert!(east.export("org.example.Greeter", "1.0").await.unwrap());
        assert_eq!(east.endpoints().unwrap().len(), 1);
        assert!(default.endpoints().unwrap().is_empty());
        assert!(default.endpoint("org.example.Greeter", "1.0").unwrap().is_none());
    }
}
