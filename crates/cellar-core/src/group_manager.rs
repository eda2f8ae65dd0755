//! Group lifecycle and membership reconciliation.
//!
//! The distributed groups map and the local node configuration both record
//! which groups this node belongs to. The manager keeps them consistent: joins
//! and leaves update both, and an external edit of the node's `groups`
//! property is reconciled into the map. Read-modify-write of a group entry
//! always happens under that entry's cluster-wide lock.
//!
//! Group policy is mirrored between `GROUPS_PID` and the cluster copy. Each
//! group keeps the last value pushed or applied as its baseline, and only a
//! group whose local value moved away from its baseline is pushed.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::collections::DistributedMap;
use crate::config_store::{ConfigStore, Properties};
use crate::configuration::{
    format_set, GroupConfig, NodeConfig, DEFAULT_GROUP_NAME, GROUPS_CONFIG_MAP, GROUPS_KEY,
    GROUPS_MAP, GROUPS_PID, NODE_PID,
};
use crate::error::{CellarError, Result};
use crate::group::Group;
use crate::node::Node;
use crate::substrate::{MapEventKind, MembershipEvent};
use crate::synchronizer::{SyncReport, SynchronizerRegistry};

fn group_properties(group: &str, props: &Properties) -> Properties {
    props
        .iter()
        .filter(|(k, _)| GroupConfig::owns_key(group, k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Orchestrates group lifecycle for the local node.
pub struct GroupManager {
    cluster: Arc<Cluster>,
    store: Arc<ConfigStore>,
    synchronizers: Arc<SynchronizerRegistry>,
    groups: DistributedMap<Group>,
    group_configs: DistributedMap<Properties>,
    membership: tokio::sync::Mutex<()>,
    baselines: Mutex<HashMap<String, Properties>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GroupManager {
    /// Creates a manager over the groups map of `cluster`.
    pub fn new(cluster: Arc<Cluster>, synchronizers: Arc<SynchronizerRegistry>) -> Self {
        Self {
            store: cluster.config_store().clone(),
            groups: cluster.map(GROUPS_MAP),
            group_configs: cluster.map(GROUPS_CONFIG_MAP),
            cluster,
            synchronizers,
            membership: tokio::sync::Mutex::new(()),
            baselines: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Identity of the local process.
    pub fn local_node(&self) -> Node {
        self.cluster.local_node()
    }

    /// Cluster this manager works on.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Typed view of the local node configuration.
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig::from_properties(&self.store.get(NODE_PID).unwrap_or_default())
    }

    /// Typed view of a group's policy.
    pub fn group_config(&self, name: &str) -> GroupConfig {
        GroupConfig::from_properties(name, &self.store.get(GROUPS_PID).unwrap_or_default())
    }

    fn save_local_groups(&self, groups: &BTreeSet<String>) -> Result<()> {
        self.store
            .set_property(NODE_PID, GROUPS_KEY, &format_set(groups))?;
        Ok(())
    }

    /// Makes sure policy properties exist locally for a group.
    ///
    /// A group known to the cluster takes the cluster's copy; a brand new group
    /// is seeded from the default group's policy. A group already configured
    /// locally but not yet mirrored adopts the cluster copy when there is one.
    /// Returns true when created.
    pub fn ensure_group_config(&self, name: &str) -> Result<bool> {
        let props = self.store.get(GROUPS_PID).unwrap_or_default();
        if GroupConfig::exists_in(name, &props) {
            if !self.baselines.lock().contains_key(name) {
                self.adopt_group_config(name)?;
            }
            return Ok(false);
        }
        let seeded = match self.group_configs.get(name)? {
            Some(remote) if !remote.is_empty() => remote,
            _ if name == DEFAULT_GROUP_NAME => {
                let mut defaults = Properties::new();
                GroupConfig::defaults(DEFAULT_GROUP_NAME).write_into(&mut defaults);
                defaults
            }
            _ => {
                self.ensure_group_config(DEFAULT_GROUP_NAME)?;
                let props = self.store.get(GROUPS_PID).unwrap_or_default();
                GroupConfig::copy_properties(DEFAULT_GROUP_NAME, name, &props)
            }
        };
        self.store.merge(GROUPS_PID, seeded)?;
        self.push_group_config(name)?;
        debug!(group = name, "group configuration created");
        Ok(true)
    }

    fn adopt_group_config(&self, name: &str) -> Result<bool> {
        if self.group_configs.get(name)?.is_some() {
            self.apply_cluster_group_config(name)
        } else {
            self.push_group_config(name)
        }
    }

    /// Mirrors the local policy of a group into the cluster. Returns true when
    /// the cluster copy changed.
    pub fn push_group_config(&self, name: &str) -> Result<bool> {
        let mut baselines = self.baselines.lock();
        let local = group_properties(name, &self.store.get(GROUPS_PID).unwrap_or_default());
        if local.is_empty() {
            return Ok(false);
        }
        let changed = self.group_configs.get(name)?.as_ref() != Some(&local);
        if changed {
            self.group_configs.put(name, &local)?;
            debug!(group = name, "group configuration pushed to cluster");
        }
        baselines.insert(name.to_string(), local);
        Ok(changed)
    }

    /// Pushes every local group whose policy changed since it was last pushed
    /// or applied. Returns the groups pushed.
    pub fn push_changed_group_configs(&self) -> Result<Vec<String>> {
        let mut pushed = Vec::new();
        for name in self.list_group_names() {
            let local = group_properties(&name, &self.store.get(GROUPS_PID).unwrap_or_default());
            let baseline = self.baselines.lock().get(&name).cloned();
            let changed = match baseline {
                Some(baseline) if baseline == local => false,
                Some(_) => self.push_group_config(&name)?,
                None => self.adopt_group_config(&name)?,
            };
            if changed {
                pushed.push(name);
            }
        }
        Ok(pushed)
    }

    /// Replaces the local policy of a group with the cluster copy. Returns true
    /// when local configuration changed.
    pub fn apply_cluster_group_config(&self, name: &str) -> Result<bool> {
        let mut baselines = self.baselines.lock();
        let Some(remote) = self.group_configs.get(name)? else {
            return Ok(false);
        };
        baselines.insert(name.to_string(), remote.clone());
        let changed = self.store.modify(GROUPS_PID, |props| {
            props.retain(|k, _| !GroupConfig::owns_key(name, k));
            props.extend(remote);
        })?;
        if changed {
            info!(group = name, "group configuration updated from cluster");
        }
        Ok(changed)
    }

    /// Ensures a group exists in the cluster without changing membership.
    pub async fn register_group(&self, name: &str) -> Result<Group> {
        self.ensure_group_config(name)?;
        let _guard = self.groups.lock(name).await?;
        match self.groups.get(name)? {
            Some(group) => Ok(group),
            None => {
                let group = Group::new(name);
                self.groups.put(name, &group)?;
                Ok(group)
            }
        }
    }

    /// Creates a group. Creating an existing group returns it unchanged.
    pub async fn create_group(&self, name: &str) -> Result<Group> {
        let group = self.register_group(name).await?;
        info!(group = name, "group created");
        Ok(group)
    }

    /// Deletes a group from the cluster and from local configuration.
    ///
    /// The default group cannot be deleted. Returns false if it did not exist.
    pub async fn delete_group(&self, name: &str) -> Result<bool> {
        if name == DEFAULT_GROUP_NAME {
            return Err(CellarError::DefaultGroupProtected {
                op: "delete".to_string(),
            });
        }
        let _membership = self.membership.lock().await;
        let mut local = self.node_config().groups;
        if local.remove(name) {
            self.save_local_groups(&local)?;
        }
        let existed = {
            let _guard = self.groups.lock(name).await?;
            self.groups.remove(name)?.is_some()
        };
        self.group_configs.remove(name)?;
        self.baselines.lock().remove(name);
        self.store.modify(GROUPS_PID, |props| {
            props.retain(|k, _| !GroupConfig::owns_key(name, k));
        })?;
        if existed {
            info!(group = name, "group deleted");
        }
        Ok(existed)
    }

    /// Reads one group.
    pub fn find_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        self.groups.get(name)
    }

    /// Every group known to the cluster, by name.
    pub fn list_all_groups(&self) -> Result<BTreeMap<String, Group>> {
        self.groups.entries()
    }

    /// Groups the local node is a member of, sorted by name.
    pub fn list_local_groups(&self) -> Result<Vec<Group>> {
        let local = self.local_node();
        Ok(self
            .groups
            .entries()?
            .into_values()
            .filter(|g| g.contains(&local))
            .collect())
    }

    /// True when the local node is a member of the group.
    pub fn is_local_group(&self, name: &str) -> Result<bool> {
        let local = self.local_node();
        Ok(self
            .groups
            .get(name)?
            .map(|g| g.contains(&local))
            .unwrap_or(false))
    }

    /// Groups the local node is configured to belong to.
    pub fn list_group_names(&self) -> BTreeSet<String> {
        self.node_config().groups
    }

    /// Groups a node is a member of according to the cluster.
    pub fn list_group_names_of(&self, node: &Node) -> Result<BTreeSet<String>> {
        Ok(self
            .groups
            .entries()?
            .into_iter()
            .filter(|(_, g)| g.contains(node))
            .map(|(name, _)| name)
            .collect())
    }

    /// Adds a node to a group entry under the entry lock. Returns true if it
    /// was not already a member.
    pub async fn add_node_to_group(&self, name: &str, node: &Node) -> Result<bool> {
        let _guard = self.groups.lock(name).await?;
        let existing = self.groups.get(name)?;
        let created = existing.is_none();
        let mut group = existing.unwrap_or_else(|| Group::new(name));
        let added = group.add_node(node.clone());
        if added || created {
            self.groups.put(name, &group)?;
        }
        Ok(added)
    }

    /// Removes a node from a group entry under the entry lock. Returns true if
    /// it was a member.
    pub async fn remove_node_from_group(&self, name: &str, node: &Node) -> Result<bool> {
        let _guard = self.groups.lock(name).await?;
        let Some(mut group) = self.groups.get(name)? else {
            return Ok(false);
        };
        let removed = group.remove_node(node);
        if removed {
            self.groups.put(name, &group)?;
        }
        Ok(removed)
    }

    async fn join_locked(&self, name: &str) -> Result<bool> {
        self.ensure_group_config(name)?;
        let local = self.local_node();
        let added = self.add_node_to_group(name, &local).await?;
        let mut groups = self.node_config().groups;
        if groups.insert(name.to_string()) {
            self.save_local_groups(&groups)?;
        }
        if added {
            info!(group = name, node = %local, "joined group");
        }
        Ok(added)
    }

    /// Joins the local node to a group, creating it if needed.
    ///
    /// Joining is idempotent. A node newly added to the group runs every
    /// registered synchronizer for it. Returns true when newly added.
    pub async fn join_group(&self, name: &str) -> Result<bool> {
        let added = {
            let _membership = self.membership.lock().await;
            self.join_locked(name).await?
        };
        if added {
            self.synchronize(name).await;
        }
        Ok(added)
    }

    async fn deregister_locked(&self, name: &str) -> Result<bool> {
        let local = self.local_node();
        let removed = self.remove_node_from_group(name, &local).await?;
        let mut groups = self.node_config().groups;
        let configured = groups.remove(name);
        if configured {
            self.save_local_groups(&groups)?;
        }
        if removed || configured {
            info!(group = name, node = %local, "left group");
        }
        Ok(removed || configured)
    }

    /// Removes the local node from a group. The default group cannot be left.
    pub async fn deregister_node_from_group(&self, name: &str) -> Result<bool> {
        if name == DEFAULT_GROUP_NAME {
            return Err(CellarError::DefaultGroupProtected {
                op: "leave".to_string(),
            });
        }
        let _membership = self.membership.lock().await;
        self.deregister_locked(name).await
    }

    /// Removes the local node from every group except the default group.
    /// Returns the groups left.
    pub async fn deregister_node_from_all_groups(&self) -> Result<Vec<String>> {
        let _membership = self.membership.lock().await;
        let mut names = self.list_group_names_of(&self.local_node())?;
        names.extend(self.node_config().groups);
        let mut left = Vec::new();
        for name in names {
            if name == DEFAULT_GROUP_NAME {
                continue;
            }
            if self.deregister_locked(&name).await? {
                left.push(name);
            }
        }
        Ok(left)
    }

    /// Runs every registered synchronizer for one group.
    pub async fn synchronize(&self, name: &str) -> SyncReport {
        let report = self.synchronizers.synchronize(name).await;
        debug!(group = name, changes = report.changes(), "group synchronized");
        report
    }

    /// Runs every registered synchronizer for every local group.
    pub async fn synchronize_all(&self) -> SyncReport {
        let mut total = SyncReport::default();
        for name in self.list_group_names() {
            total += self.synchronize(&name).await;
        }
        total
    }

    /// Brings cluster membership in line with the configured `groups` property.
    ///
    /// Newly joined groups are synchronized. The default group is always kept.
    pub async fn apply_node_config(&self) -> Result<()> {
        let joined = {
            let _membership = self.membership.lock().await;
            let mut desired = self.node_config().groups;
            if desired.insert(DEFAULT_GROUP_NAME.to_string()) {
                warn!("default group missing from node configuration, restoring it");
                self.save_local_groups(&desired)?;
            }
            let local = self.local_node();
            let actual = self.list_group_names_of(&local)?;

            let mut joined = Vec::new();
            for name in desired.difference(&actual) {
                if self.join_locked(name).await? {
                    joined.push(name.clone());
                }
            }
            for name in actual.difference(&desired) {
                if self.remove_node_from_group(name, &local).await? {
                    info!(group = %name, node = %local, "left group after configuration change");
                }
            }
            joined
        };
        for name in joined {
            self.synchronize(&name).await;
        }
        Ok(())
    }

    /// Removes a departed node from every group. Returns how many groups
    /// changed.
    pub async fn handle_member_removed(&self, node: &Node) -> Result<usize> {
        let mut changed = 0;
        for name in self.list_group_names_of(node)? {
            if self.remove_node_from_group(&name, node).await? {
                changed += 1;
            }
        }
        if changed > 0 {
            info!(node = %node, groups = changed, "removed departed node from groups");
        }
        Ok(changed)
    }

    /// Registers the local node in every configured group without
    /// synchronizing; startup synchronizes afterwards in one pass.
    pub async fn init(&self) -> Result<()> {
        let _membership = self.membership.lock().await;
        let mut groups = self.node_config().groups;
        if groups.insert(DEFAULT_GROUP_NAME.to_string()) {
            self.save_local_groups(&groups)?;
        }
        for name in &groups {
            self.join_locked(name).await?;
        }
        Ok(())
    }

    /// Spawns the membership, node-configuration and group-configuration
    /// watchers.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.spawn_membership_watcher());
        tasks.push(self.spawn_config_watcher());
        tasks.push(self.spawn_group_config_watcher());
        info!(node = %self.local_node(), "group manager started");
    }

    /// Stops the watchers.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn spawn_membership_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.cluster.substrate().subscribe_membership();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = rx.recv().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                match event {
                    Ok(MembershipEvent::MemberAdded(node)) => {
                        info!(node = %node, "member added");
                    }
                    Ok(MembershipEvent::MemberRemoved(node)) => {
                        if let Err(e) = manager.handle_member_removed(&node).await {
                            warn!(node = %node, error = %e, "failed to clean up departed node");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "membership watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_config_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self
            .store
            .watch(Some(vec![NODE_PID.to_string(), GROUPS_PID.to_string()]));
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if change.pid == NODE_PID {
                    if let Err(e) = manager.apply_node_config().await {
                        warn!(error = %e, "failed to apply node configuration");
                    }
                } else if let Err(e) = manager.push_changed_group_configs() {
                    warn!(error = %e, "failed to push group configuration");
                }
            }
        })
    }

    fn spawn_group_config_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.group_configs.subscribe();
        let local = self.local_node();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = rx.recv().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                match event {
                    Ok(event) => {
                        if event.origin == local || event.kind != MapEventKind::Put {
                            continue;
                        }
                        if !manager.list_group_names().contains(&event.key) {
                            continue;
                        }
                        if let Err(e) = manager.apply_cluster_group_config(&event.key) {
                            warn!(group = %event.key, error = %e, "failed to apply cluster group configuration");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "group configuration watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for GroupManager {
    fn drop(&mut self) {
        self.stop();
    }
}
