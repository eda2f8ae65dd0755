//! Collaborators shared by every adapter of a node.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use cellar_core::configuration::{Category, Direction};
use cellar_core::{
    CellarNode, CellarSupport, Cluster, ConfigStore, Event, EventProducer, GroupManager, Switch,
};

use crate::error::{AdapterError, Result};

/// Handles on the core services an adapter talks to.
#[derive(Clone)]
pub struct AdapterContext {
    cluster: Arc<Cluster>,
    groups: Arc<GroupManager>,
    support: Arc<CellarSupport>,
    producer: Arc<dyn EventProducer>,
}

impl AdapterContext {
    /// Context of a wired node.
    pub fn new(node: &CellarNode) -> Self {
        Self {
            cluster: node.cluster(),
            groups: node.groups().clone(),
            support: node.support().clone(),
            producer: node.producer(),
        }
    }

    /// Cluster the adapter works on.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Group manager.
    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }

    /// Node-local configuration store.
    pub fn store(&self) -> &Arc<ConfigStore> {
        self.cluster.config_store()
    }

    /// Policy engine.
    pub fn support(&self) -> &Arc<CellarSupport> {
        &self.support
    }

    /// Groups the local node belongs to.
    pub fn local_groups(&self) -> BTreeSet<String> {
        self.groups.list_group_names()
    }

    /// Whether a resource may travel in `direction` for a group.
    pub fn is_allowed(
        &self,
        group: &str,
        category: Category,
        resource: &str,
        direction: Direction,
    ) -> bool {
        self.support
            .is_allowed_for(group, category, resource, direction)
    }

    /// Fails with [`AdapterError::Blocked`] unless the resource may travel.
    pub fn check_allowed(
        &self,
        group: &str,
        category: Category,
        resource: &str,
        direction: Direction,
    ) -> Result<()> {
        if self.is_allowed(group, category, resource, direction) {
            return Ok(());
        }
        Err(AdapterError::Blocked {
            resource: resource.to_string(),
            group: group.to_string(),
            direction: direction.as_str().to_string(),
        })
    }

    /// Push is skipped while the local producer switch is OFF.
    pub fn push_enabled(&self, synchronizer: &str, group: &str) -> bool {
        if self.cluster.emits_events() {
            return true;
        }
        warn!(synchronizer, group, "cluster event producer is OFF, skipping push");
        false
    }

    /// Fails unless the group exists and the producer is ON.
    pub fn check_can_publish(&self, group: &str) -> Result<()> {
        if self.groups.find_group_by_name(group)?.is_none() {
            return Err(cellar_core::CellarError::GroupNotFound(group.to_string()).into());
        }
        if !self.producer.switch().is_on() {
            return Err(AdapterError::ProducerOff);
        }
        Ok(())
    }

    /// Publishes an event on the cluster topic.
    pub fn publish(&self, event: Event) -> Result<bool> {
        Ok(self.producer.produce(event)?)
    }

    /// Decides whether an event handler should apply a received event.
    ///
    /// Forced events skip the handler switch and the inbound policy.
    pub fn accepts(
        &self,
        event: &Event,
        switch: &Switch,
        category: Category,
        resource: &str,
    ) -> Option<String> {
        let Some(group) = event.header.source_group.clone() else {
            debug!(event = %event.header.id, "event without group, ignoring");
            return None;
        };
        if !self.local_groups().contains(&group) {
            debug!(event = %event.header.id, group = %group, "not a local group, ignoring");
            return None;
        }
        let forced = event.header.force;
        if !forced && !switch.is_on() {
            debug!(handler = %switch.id(), group = %group, "handler switch is OFF, ignoring");
            return None;
        }
        if !forced && !self.is_allowed(&group, category, resource, Direction::Inbound) {
            warn!(group = %group, category = %category, resource, "resource blocked inbound");
            return None;
        }
        Some(group)
    }
}
