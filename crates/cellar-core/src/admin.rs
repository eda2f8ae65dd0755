//! Administrative facade over the core.
//!
//! Each method builds the matching command, runs it on the resolved nodes
//! through the execution context and returns the per-node results. Callers
//! check `successful` per node; a failing node never fails the call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::cluster_manager::ClusterManager;
use crate::error::Result;
use crate::event::{
    Command, CommandResult, ManageClusterAction, ManageGroupAction, Request,
};
use crate::execution::DistributedExecutionContext;
use crate::group::Group;
use crate::group_manager::GroupManager;
use crate::node::Node;
use crate::switch::SwitchStatus;

/// Per-node command results.
pub type NodeResults = HashMap<Node, CommandResult>;

/// Which nodes a command goes to when none are named.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Fallback {
    LocalNode,
    AllNodes,
}

/// Administrative command surface.
pub struct ClusterAdmin {
    clusters: Arc<ClusterManager>,
    groups: Arc<GroupManager>,
    execution: DistributedExecutionContext,
}

impl ClusterAdmin {
    /// Creates the facade.
    pub fn new(
        clusters: Arc<ClusterManager>,
        groups: Arc<GroupManager>,
        execution: DistributedExecutionContext,
    ) -> Self {
        Self {
            clusters,
            groups,
            execution,
        }
    }

    fn resolve(&self, nodes: &[String], fallback: Fallback) -> Result<HashSet<Node>> {
        if nodes.is_empty() {
            return Ok(match fallback {
                Fallback::LocalNode => [self.clusters.local_node()].into_iter().collect(),
                Fallback::AllNodes => self.clusters.list_nodes().into_iter().collect(),
            });
        }
        nodes.iter().map(|n| self.clusters.resolve_node(n)).collect()
    }

    async fn run(&self, request: Request, nodes: &[String], fallback: Fallback) -> Result<NodeResults> {
        let targets = self.resolve(nodes, fallback)?;
        Ok(self
            .execution
            .execute_and_wait_on_nodes(Command::new(request), targets)
            .await)
    }

    async fn manage_group(
        &self,
        action: ManageGroupAction,
        group: Option<&str>,
        nodes: &[String],
    ) -> Result<NodeResults> {
        let request = Request::ManageGroup {
            action,
            group: group.map(str::to_string),
        };
        self.run(request, nodes, Fallback::LocalNode).await
    }

    /// Creates a group in the cluster.
    pub async fn create_group(&self, name: &str) -> Result<Group> {
        self.groups.create_group(name).await
    }

    /// Deletes a group. Refused for the default group.
    pub async fn delete_group(&self, name: &str) -> Result<bool> {
        self.groups.delete_group(name).await
    }

    /// Every group with its members.
    pub fn list_groups(&self) -> Result<BTreeMap<String, Group>> {
        self.groups.list_all_groups()
    }

    /// Every cluster member, sorted.
    pub fn list_nodes(&self) -> Vec<Node> {
        self.clusters.list_nodes()
    }

    /// Joins nodes (default: the local node) to a group.
    pub async fn join_group(&self, group: &str, nodes: &[String]) -> Result<NodeResults> {
        self.manage_group(ManageGroupAction::Join, Some(group), nodes)
            .await
    }

    /// Removes nodes (default: the local node) from a group.
    pub async fn quit_group(&self, group: &str, nodes: &[String]) -> Result<NodeResults> {
        self.manage_group(ManageGroupAction::Quit, Some(group), nodes)
            .await
    }

    /// Removes nodes from every group except the default group.
    pub async fn purge_groups(&self, nodes: &[String]) -> Result<NodeResults> {
        self.manage_group(ManageGroupAction::Purge, None, nodes).await
    }

    /// Makes a group the only non-default group of the nodes.
    pub async fn set_group(&self, group: &str, nodes: &[String]) -> Result<NodeResults> {
        self.manage_group(ManageGroupAction::Set, Some(group), nodes)
            .await
    }

    /// Sets (or with `None` queries) the producer switch of nodes
    /// (default: every node).
    pub async fn producer_switch(
        &self,
        status: Option<SwitchStatus>,
        nodes: &[String],
    ) -> Result<NodeResults> {
        self.run(Request::ProducerSwitch { status }, nodes, Fallback::AllNodes)
            .await
    }

    /// Sets (or with `None` queries) the consumer switch of nodes
    /// (default: every node).
    pub async fn consumer_switch(
        &self,
        status: Option<SwitchStatus>,
        nodes: &[String],
    ) -> Result<NodeResults> {
        self.run(Request::ConsumerSwitch { status }, nodes, Fallback::AllNodes)
            .await
    }

    /// Enables or disables a named event handler on nodes (default: every node).
    pub async fn handler_switch(
        &self,
        handler: &str,
        status: SwitchStatus,
        nodes: &[String],
    ) -> Result<NodeResults> {
        let request = Request::ManageHandlers {
            handler: Some(handler.to_string()),
            status: Some(status),
        };
        self.run(request, nodes, Fallback::AllNodes).await
    }

    /// Lists event handlers of nodes (default: every node).
    pub async fn list_handlers(&self, nodes: &[String]) -> Result<NodeResults> {
        let request = Request::ManageHandlers {
            handler: None,
            status: None,
        };
        self.run(request, nodes, Fallback::AllNodes).await
    }

    /// Applies a logical-cluster action on nodes (default: the local node).
    pub async fn manage_cluster(
        &self,
        action: ManageClusterAction,
        cluster: Option<&str>,
        nodes: &[String],
    ) -> Result<NodeResults> {
        let request = Request::ManageCluster {
            action,
            cluster: cluster.map(str::to_string),
        };
        self.run(request, nodes, Fallback::LocalNode).await
    }
}
