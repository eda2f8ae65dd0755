//! Common test utilities: an in-process multi-node cellar cluster.

#![allow(dead_code)]

use async_trait::async_trait;
use cellar_core::dispatcher::handler_switch;
use cellar_core::{
    CellarConfig, CellarNode, ConfigStore, Event, EventHandler, EventType, MemoryGrid, Result,
    Switch,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Timeouts tuned for fast tests.
pub fn test_config(index: usize) -> CellarConfig {
    CellarConfig {
        host: format!("10.0.0.{}", index + 1),
        port: 5701,
        rpc_timeout_ms: 2_000,
        poll_interval_ms: 20,
        ..CellarConfig::default()
    }
}

/// Started nodes sharing one in-process grid.
pub struct TestCluster {
    pub grid: MemoryGrid,
    nodes: Vec<CellarNode>,
}

impl TestCluster {
    /// Starts `num_nodes` nodes, one after the other.
    pub async fn start(num_nodes: usize) -> Self {
        let grid = MemoryGrid::new();
        let mut nodes = Vec::with_capacity(num_nodes);
        for i in 0..num_nodes {
            let config = test_config(i);
            let member = grid.join(&config.host, config.port);
            let node = CellarNode::init(config, Arc::new(member), Arc::new(ConfigStore::in_memory()))
                .unwrap();
            node.start().await.unwrap();
            nodes.push(node);
        }
        Self { grid, nodes }
    }

    pub fn node(&self, index: usize) -> &CellarNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[CellarNode] {
        &self.nodes
    }

    /// Id of a node, as accepted by the admin facade.
    pub fn node_id(&self, index: usize) -> String {
        self.nodes[index].local_node().id().to_string()
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await.unwrap();
        }
    }
}

/// Lets spawned consumers and watchers run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Polls `check` for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Event handler recording the ids of feature repository events it applied.
pub struct RecordingHandler {
    switch: Switch,
    applied: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn register(node: &CellarNode) -> Arc<Self> {
        let handler = Arc::new(Self {
            switch: handler_switch("recording", node.store().clone()),
            applied: Mutex::new(Vec::new()),
        });
        node.register_event_handler(handler.clone());
        handler
    }

    pub fn applied(&self) -> usize {
        self.applied.lock().len()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    fn event_type(&self) -> EventType {
        EventType::FeatureRepository
    }

    fn switch(&self) -> &Switch {
        &self.switch
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        if self.switch.is_on() {
            self.applied.lock().push(event.header.id.clone());
        }
        Ok(())
    }
}
