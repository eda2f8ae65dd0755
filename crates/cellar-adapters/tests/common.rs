//! Common test utilities: nodes with every adapter registered.

#![allow(dead_code)]

use cellar_adapters::{
    bundle, config, endpoint, features, BundleSupport, ConfigurationSupport, EndpointRegistry,
    FeaturesSupport, MemoryBundleService, MemoryFeaturesService,
};
use cellar_core::{CellarConfig, CellarNode, ConfigStore, MemoryGrid};
use std::sync::Arc;
use std::time::Duration;

pub struct AdaptedNode {
    pub node: CellarNode,
    pub features: Arc<MemoryFeaturesService>,
    pub feature_support: FeaturesSupport,
    pub bundles: Arc<MemoryBundleService>,
    pub bundle_support: BundleSupport,
    pub configuration: Arc<ConfigurationSupport>,
    pub endpoints: Arc<EndpointRegistry>,
}

pub struct AdaptedCluster {
    pub grid: MemoryGrid,
    nodes: Vec<AdaptedNode>,
}

impl AdaptedCluster {
    /// Builds `num_nodes` nodes with adapters registered, without starting them.
    pub async fn build(num_nodes: usize) -> Self {
        let grid = MemoryGrid::new();
        let mut nodes = Vec::with_capacity(num_nodes);
        for i in 0..num_nodes {
            let config = CellarConfig {
                host: format!("10.0.1.{}", i + 1),
                rpc_timeout_ms: 2_000,
                poll_interval_ms: 20,
                ..CellarConfig::default()
            };
            let member = grid.join(&config.host, config.port);
            let node = CellarNode::init(config, Arc::new(member), Arc::new(ConfigStore::in_memory()))
                .unwrap();
            let features_service = Arc::new(MemoryFeaturesService::new());
            let bundle_service = Arc::new(MemoryBundleService::new());
            nodes.push(AdaptedNode {
                feature_support: features::register(&node, features_service.clone()),
                bundle_support: bundle::register(&node, bundle_service.clone()),
                configuration: config::register(&node),
                endpoints: endpoint::register(&node),
                features: features_service,
                bundles: bundle_service,
                node,
            });
        }
        Self { grid, nodes }
    }

    /// Builds and starts every node.
    pub async fn start(num_nodes: usize) -> Self {
        let cluster = Self::build(num_nodes).await;
        for n in &cluster.nodes {
            n.node.start().await.unwrap();
        }
        cluster
    }

    pub fn node(&self, index: usize) -> &AdaptedNode {
        &self.nodes[index]
    }

    pub async fn shutdown(&self) {
        for n in &self.nodes {
            n.node.shutdown().await.unwrap();
        }
    }
}

/// Polls an async check for up to two seconds.
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
