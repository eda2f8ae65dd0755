//! Bundle synchronization.
//!
//! The cluster keeps `symbolic_name/version -> BundleState` per group. Policy
//! is evaluated against the bundle location. Installed, resolved and stopped
//! are treated alike when comparing states; only presence and whether the
//! bundle runs are reconciled.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use cellar_core::collections::DistributedMap;
use cellar_core::configuration::{collection_name, Category, Direction};
use cellar_core::dispatcher::handler_switch;
use cellar_core::event::BundleStatus;
use cellar_core::{CellarNode, Event, EventHandler, EventPayload, EventType, Switch, Synchronizer};

use crate::context::AdapterContext;
use crate::error::{AdapterError, Result};

/// Per-group map of bundles.
pub const BUNDLE_MAP: &str = "org.apache.karaf.cellar.bundle.map";

/// Cluster view of one bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleState {
    /// Display name; the symbolic name unless a runtime reports another.
    pub name: String,
    /// Symbolic name.
    pub symbolic_name: String,
    /// Bundle version.
    pub version: String,
    /// Location the bundle is installed from. Policy is evaluated on it.
    pub location: String,
    /// Lifecycle status.
    pub status: BundleStatus,
}

impl BundleState {
    /// State of a bundle named by its symbolic name.
    pub fn new(
        symbolic_name: impl Into<String>,
        version: impl Into<String>,
        location: impl Into<String>,
        status: BundleStatus,
    ) -> Self {
        let symbolic_name = symbolic_name.into();
        Self {
            name: symbolic_name.clone(),
            symbolic_name,
            version: version.into(),
            location: location.into(),
            status,
        }
    }

    /// Map key: `symbolic_name/version`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.symbolic_name, self.version)
    }

    fn is_running(&self) -> bool {
        self.status == BundleStatus::Active
    }

    /// Same location, presence and running state.
    fn equivalent(&self, other: &BundleState) -> bool {
        self.location == other.location
            && (self.status == BundleStatus::Uninstalled) == (other.status == BundleStatus::Uninstalled)
            && self.is_running() == other.is_running()
    }
}

/// Local bundle runtime.
#[async_trait]
pub trait BundleService: Send + Sync {
    /// Installed bundles.
    async fn list_bundles(&self) -> Result<Vec<BundleState>>;

    /// One installed bundle.
    async fn bundle(&self, symbolic_name: &str, version: &str) -> Result<Option<BundleState>>;

    /// Installs a bundle; it ends up resolved.
    async fn install(&self, symbolic_name: &str, version: &str, location: &str) -> Result<()>;

    /// Starts an installed bundle.
    async fn start(&self, symbolic_name: &str, version: &str) -> Result<()>;

    /// Stops a bundle; it goes back to resolved.
    async fn stop(&self, symbolic_name: &str, version: &str) -> Result<()>;

    /// Removes a bundle.
    async fn uninstall(&self, symbolic_name: &str, version: &str) -> Result<()>;
}

#[derive(Default)]
struct Bundles {
    installed: BTreeMap<String, BundleState>,
    operations: usize,
}

/// In-memory bundle runtime.
#[derive(Default)]
pub struct MemoryBundleService {
    bundles: Mutex<Bundles>,
}

impl MemoryBundleService {
    /// Empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lifecycle operations applied.
    pub fn operations(&self) -> usize {
        self.bundles.lock().operations
    }

    fn transition(&self, symbolic_name: &str, version: &str, status: BundleStatus) -> Result<()> {
        let key = format!("{}/{}", symbolic_name, version);
        let mut bundles = self.bundles.lock();
        let bundle = bundles
            .installed
            .get_mut(&key)
            .ok_or_else(|| AdapterError::NotFound(key.clone()))?;
        bundle.status = status;
        bundles.operations += 1;
        Ok(())
    }
}

#[async_trait]
impl BundleService for MemoryBundleService {
    async fn list_bundles(&self) -> Result<Vec<BundleState>> {
        Ok(self.bundles.lock().installed.values().cloned().collect())
    }

    async fn bundle(&self, symbolic_name: &str, version: &str) -> Result<Option<BundleState>> {
        let key = format!("{}/{}", symbolic_name, version);
        Ok(self.bundles.lock().installed.get(&key).cloned())
    }

    async fn install(&self, symbolic_name: &str, version: &str, location: &str) -> Result<()> {
        let state = BundleState::new(symbolic_name, version, location, BundleStatus::Resolved);
        let mut bundles = self.bundles.lock();
        bundles.installed.insert(state.key(), state);
        bundles.operations += 1;
        Ok(())
    }

    async fn start(&self, symbolic_name: &str, version: &str) -> Result<()> {
        self.transition(symbolic_name, version, BundleStatus::Active)
    }

    async fn stop(&self, symbolic_name: &str, version: &str) -> Result<()> {
        self.transition(symbolic_name, version, BundleStatus::Resolved)
    }

    async fn uninstall(&self, symbolic_name: &str, version: &str) -> Result<()> {
        let key = format!("{}/{}", symbolic_name, version);
        let mut bundles = self.bundles.lock();
        if bundles.installed.remove(&key).is_none() {
            return Err(AdapterError::NotFound(key));
        }
        bundles.operations += 1;
        Ok(())
    }
}

fn bundle_map(ctx: &AdapterContext, group: &str) -> DistributedMap<BundleState> {
    ctx.cluster().map(&collection_name(BUNDLE_MAP, group))
}

/// Brings the local bundle in line with `target`. Returns true when something
/// changed.
async fn apply_bundle(service: &dyn BundleService, target: &BundleState) -> Result<bool> {
    let local = service.bundle(&target.symbolic_name, &target.version).await?;
    let (sn, version) = (target.symbolic_name.as_str(), target.version.as_str());

    if target.status == BundleStatus::Uninstalled {
        if local.is_none() {
            return Ok(false);
        }
        service.uninstall(sn, version).await?;
        info!(bundle = %target.key(), "bundle uninstalled from cluster");
        return Ok(true);
    }

    let mut changed = false;
    let running = match local {
        Some(local) => local.is_running(),
        None => {
            service.install(sn, version, &target.location).await?;
            info!(bundle = %target.key(), location = %target.location, "bundle installed from cluster");
            changed = true;
            false
        }
    };
    if target.is_running() && !running {
        service.start(sn, version).await?;
        changed = true;
    } else if !target.is_running() && running {
        service.stop(sn, version).await?;
        changed = true;
    }
    Ok(changed)
}

/// Reconciles bundles of a group.
pub struct BundleSynchronizer {
    ctx: AdapterContext,
    service: Arc<dyn BundleService>,
}

impl BundleSynchronizer {
    /// Synchronizer over a local runtime.
    pub fn new(ctx: AdapterContext, service: Arc<dyn BundleService>) -> Self {
        Self { ctx, service }
    }
}

#[async_trait]
impl Synchronizer for BundleSynchronizer {
    fn name(&self) -> &str {
        "bundle"
    }

    fn is_sync_enabled(&self, group: &str) -> bool {
        self.ctx.support().is_sync_enabled(group, Category::Bundle)
    }

    async fn pull(&self, group: &str) -> cellar_core::Result<usize> {
        let mut changes = 0;
        for (key, state) in bundle_map(&self.ctx, group).entries()? {
            if !self
                .ctx
                .is_allowed(group, Category::Bundle, &state.location, Direction::Inbound)
            {
                continue;
            }
            match apply_bundle(self.service.as_ref(), &state).await {
                Ok(true) => changes += 1,
                Ok(false) => {}
                Err(e) => warn!(group, bundle = %key, error = %e, "failed to apply bundle"),
            }
        }
        debug!(group, changes, "bundles pulled");
        Ok(changes)
    }

    async fn push(&self, group: &str) -> cellar_core::Result<usize> {
        if !self.ctx.push_enabled(self.name(), group) {
            return Ok(0);
        }
        let map = bundle_map(&self.ctx, group);
        let mut changes = 0;
        for state in self.service.list_bundles().await? {
            if !self
                .ctx
                .is_allowed(group, Category::Bundle, &state.location, Direction::Outbound)
            {
                continue;
            }
            let key = state.key();
            let current = map.get(&key)?;
            if current.map(|c| c.equivalent(&state)).unwrap_or(false) {
                continue;
            }
            map.put(&key, &state)?;
            changes += 1;
        }
        debug!(group, changes, "bundles pushed");
        Ok(changes)
    }
}

/// Applies bundle events from other nodes.
pub struct BundleEventHandler {
    ctx: AdapterContext,
    service: Arc<dyn BundleService>,
    switch: Switch,
}

impl BundleEventHandler {
    /// Handler applying cluster bundle events to a local runtime.
    pub fn new(ctx: AdapterContext, service: Arc<dyn BundleService>) -> Self {
        let switch = handler_switch("bundle", ctx.store().clone());
        Self {
            ctx,
            service,
            switch,
        }
    }
}

#[async_trait]
impl EventHandler for BundleEventHandler {
    fn name(&self) -> &str {
        "bundle"
    }

    fn event_type(&self) -> EventType {
        EventType::Bundle
    }

    fn switch(&self) -> &Switch {
        &self.switch
    }

    async fn handle(&self, event: &Event) -> cellar_core::Result<()> {
        let EventPayload::Bundle {
            symbolic_name,
            version,
            location,
            status,
        } = &event.payload
        else {
            return Ok(());
        };
        if self
            .ctx
            .accepts(event, &self.switch, Category::Bundle, location)
            .is_none()
        {
            return Ok(());
        }
        let target = BundleState::new(symbolic_name.clone(), version.clone(), location.clone(), *status);
        apply_bundle(self.service.as_ref(), &target).await?;
        Ok(())
    }
}

fn bundle_event(state: &BundleState) -> Event {
    Event::new(EventPayload::Bundle {
        symbolic_name: state.symbolic_name.clone(),
        version: state.version.clone(),
        location: state.location.clone(),
        status: state.status,
    })
}

/// Cluster-wide bundle operations and the local change listener.
pub struct BundleSupport {
    ctx: AdapterContext,
}

impl BundleSupport {
    /// Creates the entry point.
    pub fn new(ctx: AdapterContext) -> Self {
        Self { ctx }
    }

    /// Sets the cluster state of a bundle in a group and notifies its nodes.
    ///
    /// `force` skips the outbound policy here and the inbound policy and
    /// handler switches on receiving nodes.
    pub async fn update(&self, group: &str, state: BundleState, force: bool) -> Result<()> {
        self.ctx.check_can_publish(group)?;
        if !force {
            self.ctx
                .check_allowed(group, Category::Bundle, &state.location, Direction::Outbound)?;
        }
        bundle_map(&self.ctx, group).put(&state.key(), &state)?;
        self.ctx.publish(bundle_event(&state).with_group(group).forced(force))?;
        info!(group, bundle = %state.key(), status = %state.status, "cluster bundle updated");
        Ok(())
    }

    /// Installs a bundle on every node of a group.
    pub async fn install(
        &self,
        group: &str,
        symbolic_name: &str,
        version: &str,
        location: &str,
        force: bool,
    ) -> Result<()> {
        let state = BundleState::new(symbolic_name, version, location, BundleStatus::Installed);
        self.update(group, state, force).await
    }

    /// Uninstalls a bundle from every node of a group.
    pub async fn uninstall(
        &self,
        group: &str,
        symbolic_name: &str,
        version: &str,
        force: bool,
    ) -> Result<()> {
        let location = bundle_map(&self.ctx, group)
            .get(&format!("{}/{}", symbolic_name, version))?
            .map(|b| b.location)
            .ok_or_else(|| AdapterError::NotFound(format!("{}/{}", symbolic_name, version)))?;
        let state = BundleState::new(symbolic_name, version, location, BundleStatus::Uninstalled);
        self.update(group, state, force).await
    }

    /// Reports a local lifecycle change to every local group. Returns the
    /// groups notified.
    pub fn on_local_change(&self, state: &BundleState) -> Result<Vec<String>> {
        let mut notified = Vec::new();
        for group in self.ctx.local_groups() {
            if !self.ctx.support().is_sync_enabled(&group, Category::Bundle)
                || !self
                    .ctx
                    .is_allowed(&group, Category::Bundle, &state.location, Direction::Outbound)
            {
                continue;
            }
            let map = bundle_map(&self.ctx, &group);
            let key = state.key();
            if map.get(&key)?.map(|c| c.equivalent(state)).unwrap_or(false) {
                continue;
            }
            map.put(&key, state)?;
            self.ctx.publish(bundle_event(state).with_group(group.clone()))?;
            notified.push(group);
        }
        Ok(notified)
    }
}

/// Registers the bundle synchronizer and event handler on a node.
pub fn register(node: &CellarNode, service: Arc<dyn BundleService>) -> BundleSupport {
    let ctx = AdapterContext::new(node);
    node.register_synchronizer(Arc::new(BundleSynchronizer::new(ctx.clone(), service.clone())));
    node.register_event_handler(Arc::new(BundleEventHandler::new(ctx.clone(), service)));
    BundleSupport::new(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_core::configuration::DEFAULT_GROUP_NAME;
    use cellar_core::{CellarConfig, MemoryGrid};

    const LOCATION: &str = "mvn:org.example/shell/1.0";

    #[test]
    fn test_equivalent_ignores_resolved_vs_installed() {
        let a = BundleState::new("shell", "1.0", LOCATION, BundleStatus::Installed);
        let b = BundleState::new("shell", "1.0", LOCATION, BundleStatus::Resolved);
        let c = BundleState::new("shell", "1.0", LOCATION, BundleStatus::Active);
        assert!(a.equivalent(&b));
        assert!(!a.equivalent(&c));
        assert_eq!(a.key(), "shell/1.0");
    }

    #[tokio::test]
    async fn test_apply_bundle_lifecycle() {
        let service = MemoryBundleService::new();
        let active = BundleState::new("shell", "1.0", LOCATION, BundleStatus::Active);
        assert!(apply_bundle(&service, &active).await.unwrap());
        assert!(!apply_bundle(&service, &active).await.unwrap());
        assert_eq!(
            service.bundle("shell", "1.0").await.unwrap().unwrap().status,
            BundleStatus::Active
        );

        let stopped = BundleState::new("shell", "1.0", LOCATION, BundleStatus::Stopped);
        assert!(apply_bundle(&service, &stopped).await.unwrap());
        assert!(!apply_bundle(&service, &stopped).await.unwrap());

        let gone = BundleState::new("shell", "1.0", LOCATION, BundleStatus::Uninstalled);
        assert!(apply_bundle(&service, &gone).await.unwrap());
        assert!(service.bundle("shell", "1.0").await.unwrap().is_none());
        assert!(!apply_bundle(&service, &gone).await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_is_idempotent_and_skips_xml() {
        let grid = MemoryGrid::new();
        let node = CellarNode::open(CellarConfig::default(), Arc::new(grid.join("a", 5701))).unwrap();
        node.start().await.unwrap();
        let service = Arc::new(MemoryBundleService::new());
        service.install("shell", "1.0", LOCATION).await.unwrap();
        service.start("shell", "1.0").await.unwrap();
        service.install("routes", "1.0", "blueprint:file:/deploy/routes.xml").await.unwrap();

        let ctx = AdapterContext::new(&node);
        bundle_map(&ctx, DEFAULT_GROUP_NAME)
            .put("web/2.0", &BundleState::new("web", "2.0", "mvn:org.example/web/2.0", BundleStatus::Installed))
            .unwrap();

        let sync = BundleSynchronizer::new(ctx.clone(), service.clone());
        let first = sync.synchronize(DEFAULT_GROUP_NAME).await.unwrap();
        assert_eq!(first.pulled, 1);
        assert_eq!(first.pushed, 1);
        assert!(!bundle_map(&ctx, DEFAULT_GROUP_NAME).contains_key("routes/1.0").unwrap());

        let before = service.operations();
        let second = sync.synchronize(DEFAULT_GROUP_NAME).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(service.operations(), before);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_uninstall_unknown_bundle() {
        let grid = MemoryGrid::new();
        let node = CellarNode::open(CellarConfig::default(), Arc::new(grid.join("a", 5701))).unwrap();
        node.start().await.unwrap();
        let support = register(&node, Arc::new(MemoryBundleService::new()));
        assert!(matches!(
            support.uninstall(DEFAULT_GROUP_NAME, "ghost", "1.0", false).await,
            Err(AdapterError::NotFound(_))
        ));
        node.shutdown().await.unwrap();
    }
}
