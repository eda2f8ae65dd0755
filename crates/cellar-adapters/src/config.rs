//! Configuration PID synchronization over the node's own configuration store.
//!
//! The cluster map of a group holds `pid -> properties`. The node and group
//! PIDs of cellar itself are never synchronized, whatever the policy says.
//! A local watcher turns store changes into map updates and events; a change
//! that leaves the map untouched, such as one applied from the cluster, is not
//! re-published.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cellar_core::collections::DistributedMap;
use cellar_core::config_store::{ConfigChange, ConfigChangeKind};
use cellar_core::configuration::{collection_name, Category, Direction, GROUPS_PID, NODE_PID};
use cellar_core::dispatcher::handler_switch;
use cellar_core::event::ConfigurationChange;
use cellar_core::{
    CellarNode, ConfigStore, Event, EventHandler, EventPayload, EventType, NodeService,
    Properties, Switch, Synchronizer,
};

use crate::context::AdapterContext;
use crate::error::Result;

/// Per-group map of configuration PIDs.
pub const CONFIGURATION_MAP: &str = "org.apache.karaf.cellar.configuration.map";

/// PIDs owned by cellar itself.
pub fn is_internal_pid(pid: &str) -> bool {
    pid == NODE_PID || pid == GROUPS_PID
}

fn configuration_map(ctx: &AdapterContext, group: &str) -> DistributedMap<Properties> {
    ctx.cluster().map(&collection_name(CONFIGURATION_MAP, group))
}

fn apply_properties(store: &ConfigStore, pid: &str, props: &Properties) -> Result<bool> {
    if store.get(pid).as_ref() == Some(props) {
        return Ok(false);
    }
    store.update(pid, props.clone())?;
    Ok(true)
}

/// Reconciles configuration PIDs of a group.
pub struct ConfigurationSynchronizer {
    ctx: AdapterContext,
}

impl ConfigurationSynchronizer {
    /// Synchronizer over the node's configuration store.
    pub fn new(ctx: AdapterContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Synchronizer for ConfigurationSynchronizer {
    fn name(&self) -> &str {
        "config"
    }

    fn is_sync_enabled(&self, group: &str) -> bool {
        self.ctx.support().is_sync_enabled(group, Category::Config)
    }

    async fn pull(&self, group: &str) -> cellar_core::Result<usize> {
        let mut changes = 0;
        for (pid, props) in configuration_map(&self.ctx, group).entries()? {
            if is_internal_pid(&pid)
                || !self
                    .ctx
                    .is_allowed(group, Category::Config, &pid, Direction::Inbound)
            {
                continue;
            }
            match apply_properties(self.ctx.store(), &pid, &props) {
                Ok(true) => changes += 1,
                Ok(false) => {}
                Err(e) => warn!(group, pid = %pid, error = %e, "failed to apply configuration"),
            }
        }
        debug!(group, changes, "configuration pulled");
        Ok(changes)
    }

    async fn push(&self, group: &str) -> cellar_core::Result<usize> {
        if !self.ctx.push_enabled(self.name(), group) {
            return Ok(0);
        }
        let map = configuration_map(&self.ctx, group);
        let store = self.ctx.store();
        let mut changes = 0;
        for pid in store.pids() {
            if is_internal_pid(&pid)
                || !self
                    .ctx
                    .is_allowed(group, Category::Config, &pid, Direction::Outbound)
            {
                continue;
            }
            let Some(props) = store.get(&pid) else {
                continue;
            };
            if map.get(&pid)?.as_ref() != Some(&props) {
                map.put(&pid, &props)?;
                changes += 1;
            }
        }
        debug!(group, changes, "configuration pushed");
        Ok(changes)
    }
}

/// Applies configuration events from other nodes.
pub struct ConfigurationEventHandler {
    ctx: AdapterContext,
    switch: Switch,
}

impl ConfigurationEventHandler {
    /// Handler applying cluster configuration events.
    pub fn new(ctx: AdapterContext) -> Self {
        let switch = handler_switch("config", ctx.store().clone());
        Self { ctx, switch }
    }
}

#[async_trait]
impl EventHandler for ConfigurationEventHandler {
    fn name(&self) -> &str {
        "config"
    }

    fn event_type(&self) -> EventType {
        EventType::Configuration
    }

    fn switch(&self) -> &Switch {
        &self.switch
    }

    async fn handle(&self, event: &Event) -> cellar_core::Result<()> {
        let EventPayload::Configuration {
            pid,
            properties,
            change,
        } = &event.payload
        else {
            return Ok(());
        };
        if is_internal_pid(pid)
            || self
                .ctx
                .accepts(event, &self.switch, Category::Config, pid)
                .is_none()
        {
            return Ok(());
        }
        let store = self.ctx.store();
        match (change, properties) {
            (ConfigurationChange::Update, Some(props)) => {
                apply_properties(store, pid, props)?;
            }
            (ConfigurationChange::Update, None) => {
                debug!(pid = %pid, "update event without properties, ignoring");
            }
            (ConfigurationChange::Delete, _) => {
                store.delete(pid)?;
            }
        }
        Ok(())
    }
}

/// Publishes local configuration changes to the local groups.
pub struct ConfigurationSupport {
    ctx: AdapterContext,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigurationSupport {
    /// Creates the support; call [`ConfigurationSupport::start`] to watch the store.
    pub fn new(ctx: AdapterContext) -> Self {
        Self {
            ctx,
            watcher: Mutex::new(None),
        }
    }

    /// Pushes one local change to every local group that accepts it. Returns
    /// the groups notified.
    pub fn on_local_change(&self, change: &ConfigChange) -> Result<Vec<String>> {
        let mut notified = Vec::new();
        if is_internal_pid(&change.pid) {
            return Ok(notified);
        }
        let current = self.ctx.store().get(&change.pid);
        for group in self.ctx.local_groups() {
            if !self.ctx.support().is_sync_enabled(&group, Category::Config)
                || !self
                    .ctx
                    .is_allowed(&group, Category::Config, &change.pid, Direction::Outbound)
            {
                continue;
            }
            let map = configuration_map(&self.ctx, &group);
            let payload = match (&change.kind, &current) {
                (ConfigChangeKind::Updated, Some(props)) => {
                    if map.get(&change.pid)?.as_ref() == Some(props) {
                        continue;
                    }
                    map.put(&change.pid, props)?;
                    EventPayload::Configuration {
                        pid: change.pid.clone(),
                        properties: Some(props.clone()),
                        change: ConfigurationChange::Update,
                    }
                }
                _ => {
                    if map.remove(&change.pid)?.is_none() {
                        continue;
                    }
                    EventPayload::Configuration {
                        pid: change.pid.clone(),
                        properties: None,
                        change: ConfigurationChange::Delete,
                    }
                }
            };
            self.ctx.publish(Event::new(payload).with_group(group.clone()))?;
            notified.push(group);
        }
        Ok(notified)
    }

    /// Starts watching the store. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }
        let mut rx = self.ctx.store().watch(None);
        let weak = Arc::downgrade(self);
        *watcher = Some(tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                let Some(support) = weak.upgrade() else {
                    break;
                };
                match support.on_local_change(&change) {
                    Ok(groups) if !groups.is_empty() => {
                        info!(pid = %change.pid, groups = ?groups, "configuration change published");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(pid = %change.pid, error = %e, "failed to publish configuration change"),
                }
            }
        }));
    }

    /// True while the store watcher runs.
    pub fn is_running(&self) -> bool {
        self.watcher.lock().is_some()
    }
}

impl NodeService for ConfigurationSupport {
    fn name(&self) -> &str {
        "config"
    }

    fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ConfigurationSupport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Registers the configuration synchronizer and event handler on a node and
/// starts the local watcher, which the node stops on shutdown.
pub fn register(node: &CellarNode) -> Arc<ConfigurationSupport> {
    let ctx = AdapterContext::new(node);
    node.register_synchronizer(Arc::new(ConfigurationSynchronizer::new(ctx.clone())));
    node.register_event_handler(Arc::new(ConfigurationEventHandler::new(ctx.clone())));
    let support = Arc::new(ConfigurationSupport::new(ctx));
    support.start();
    node.register_service(support.clone());
    support
}
