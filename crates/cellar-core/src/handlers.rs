//! Command handlers executed on the destination node of administrative
//! commands.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::cluster_manager::ClusterManager;
use crate::config_store::ConfigStore;
use crate::configuration::{CONSUMER_KEY, DEFAULT_GROUP_NAME, NODE_PID, PRODUCER_KEY};
use crate::dispatcher::{CommandHandler, EventDispatcher};
use crate::error::{CellarError, Result};
use crate::event::{Command, CommandType, ManageClusterAction, ManageGroupAction, Request, Response};
use crate::group_manager::GroupManager;
use crate::switch::{Switch, SwitchStatus};

fn unexpected(expected: CommandType, command: &Command) -> CellarError {
    CellarError::Handler(format!(
        "{} handler received {}",
        expected,
        command.command_type()
    ))
}

fn required(name: Option<&String>, what: &str) -> Result<String> {
    name.cloned()
        .ok_or_else(|| CellarError::Handler(format!("{} name required", what)))
}

/// Joins, quits, purges or lists groups on the destination node.
pub struct ManageGroupCommandHandler {
    groups: Arc<GroupManager>,
}

impl ManageGroupCommandHandler {
    /// Creates the handler.
    pub fn new(groups: Arc<GroupManager>) -> Self {
        Self { groups }
    }
}

#[async_trait]
impl CommandHandler for ManageGroupCommandHandler {
    fn command_type(&self) -> CommandType {
        CommandType::ManageGroup
    }

    async fn execute(&self, command: &Command) -> Result<Response> {
        let Request::ManageGroup { action, group } = &command.request else {
            return Err(unexpected(self.command_type(), command));
        };
        match action {
            ManageGroupAction::Join => {
                let name = required(group.as_ref(), "group")?;
                self.groups.join_group(&name).await?;
            }
            ManageGroupAction::Quit => {
                let name = required(group.as_ref(), "group")?;
                self.groups.deregister_node_from_group(&name).await?;
            }
            ManageGroupAction::Purge => {
                self.groups.deregister_node_from_all_groups().await?;
            }
            ManageGroupAction::Set => {
                let name = required(group.as_ref(), "group")?;
                self.groups.deregister_node_from_all_groups().await?;
                if name != DEFAULT_GROUP_NAME {
                    self.groups.join_group(&name).await?;
                }
            }
            ManageGroupAction::List => {}
        }
        let groups = self.groups.list_all_groups()?;
        Ok(Response::from_groups(groups.values()))
    }
}

/// Lists, enables or disables event handlers on the destination node.
pub struct ManageHandlersCommandHandler {
    dispatcher: Arc<EventDispatcher>,
}

impl ManageHandlersCommandHandler {
    /// Creates the handler.
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl CommandHandler for ManageHandlersCommandHandler {
    fn command_type(&self) -> CommandType {
        CommandType::ManageHandlers
    }

    async fn execute(&self, command: &Command) -> Result<Response> {
        let Request::ManageHandlers { handler, status } = &command.request else {
            return Err(unexpected(self.command_type(), command));
        };
        if let (Some(name), Some(status)) = (handler, status) {
            let target = self
                .dispatcher
                .handler(name)
                .ok_or_else(|| CellarError::NoHandler(name.clone()))?;
            target.switch().set(*status)?;
            info!(handler = %name, %status, "event handler switched");
        }
        let mut statuses = self.dispatcher.handler_statuses();
        if let Some(name) = handler {
            statuses.retain(|k, _| k == name);
        }
        Ok(Response::Handlers(statuses))
    }
}

/// Queries or sets the producer switch of the destination node.
pub struct ProducerSwitchCommandHandler {
    switch: Switch,
}

impl ProducerSwitchCommandHandler {
    /// Creates the handler over the node's persisted producer flag.
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            switch: Switch::backed_by("producer", store, NODE_PID, PRODUCER_KEY, SwitchStatus::On),
        }
    }
}

#[async_trait]
impl CommandHandler for ProducerSwitchCommandHandler {
    fn command_type(&self) -> CommandType {
        CommandType::ProducerSwitch
    }

    async fn execute(&self, command: &Command) -> Result<Response> {
        let Request::ProducerSwitch { status } = &command.request else {
            return Err(unexpected(self.command_type(), command));
        };
        if let Some(status) = status {
            self.switch.set(*status)?;
            info!(%status, "producer switched");
        }
        Ok(Response::Switch(self.switch.status()))
    }
}

/// Queries or sets the consumer switch of the destination node.
pub struct ConsumerSwitchCommandHandler {
    switch: Switch,
}

impl ConsumerSwitchCommandHandler {
    /// Creates the handler over the node's persisted consumer flag.
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            switch: Switch::backed_by("consumer", store, NODE_PID, CONSUMER_KEY, SwitchStatus::On),
        }
    }
}

#[async_trait]
impl CommandHandler for ConsumerSwitchCommandHandler {
    fn command_type(&self) -> CommandType {
        CommandType::ConsumerSwitch
    }

    async fn execute(&self, command: &Command) -> Result<Response> {
        let Request::ConsumerSwitch { status } = &command.request else {
            return Err(unexpected(self.command_type(), command));
        };
        if let Some(status) = status {
            self.switch.set(*status)?;
            info!(%status, "consumer switched");
        }
        Ok(Response::Switch(self.switch.status()))
    }
}

/// Joins, leaves or lists logical clusters on the destination node.
pub struct ManageClusterCommandHandler {
    clusters: Arc<ClusterManager>,
}

impl ManageClusterCommandHandler {
    /// Creates the handler.
    pub fn new(clusters: Arc<ClusterManager>) -> Self {
        Self { clusters }
    }
}

#[async_trait]
impl CommandHandler for ManageClusterCommandHandler {
    fn command_type(&self) -> CommandType {
        CommandType::ManageCluster
    }

    async fn execute(&self, command: &Command) -> Result<Response> {
        let Request::ManageCluster { action, cluster } = &command.request else {
            return Err(unexpected(self.command_type(), command));
        };
        match action {
            ManageClusterAction::Join => {
                let name = required(cluster.as_ref(), "cluster")?;
                self.clusters.join_cluster(&name);
            }
            ManageClusterAction::Leave => {
                let name = required(cluster.as_ref(), "cluster")?;
                if !self.clusters.leave_cluster(&name)? {
                    return Err(CellarError::ClusterNotFound(name));
                }
            }
            ManageClusterAction::LeaveAll => {
                self.clusters.leave_all_clusters();
            }
            ManageClusterAction::List => {}
        }
        Ok(Response::Clusters(self.clusters.list_clusters()))
    }
}

/// Every core command handler for one node.
pub fn core_handlers(
    groups: Arc<GroupManager>,
    dispatcher: Arc<EventDispatcher>,
    clusters: Arc<ClusterManager>,
    store: Arc<ConfigStore>,
) -> Vec<Arc<dyn CommandHandler>> {
    vec![
        Arc::new(ManageGroupCommandHandler::new(groups)),
        Arc::new(ManageHandlersCommandHandler::new(dispatcher)),
        Arc::new(ProducerSwitchCommandHandler::new(store.clone())),
        Arc::new(ConsumerSwitchCommandHandler::new(store)),
        Arc::new(ManageClusterCommandHandler::new(clusters)),
    ]
}
