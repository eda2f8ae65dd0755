//! Feature and feature-repository synchronization.
//!
//! Per group the cluster holds a map `name/version -> FeatureInfo` and a set of
//! repository urls. Pull installs what the cluster has installed and removes
//! what it has uninstalled; push writes the local install state back.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use cellar_core::collections::{DistributedMap, DistributedSet};
use cellar_core::configuration::{collection_name, Category, Direction};
use cellar_core::dispatcher::handler_switch;
use cellar_core::{
    CellarNode, Event, EventHandler, EventPayload, EventType, Switch, Synchronizer,
};

use crate::context::AdapterContext;
use crate::error::{AdapterError, Result};

/// Per-group map of features.
pub const FEATURES_MAP: &str = "org.apache.karaf.cellar.features.map";
/// Per-group set of repository urls.
pub const REPOSITORIES_SET: &str = "org.apache.karaf.cellar.repositories.list";

/// Install state of one feature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureInfo {
    /// Feature name.
    pub name: String,
    /// Feature version.
    pub version: String,
    /// Whether the feature is installed.
    pub installed: bool,
}

impl FeatureInfo {
    /// Describes a feature.
    pub fn new(name: impl Into<String>, version: impl Into<String>, installed: bool) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            installed,
        }
    }

    /// Map key: `name/version`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

/// Local feature runtime.
#[async_trait]
pub trait FeaturesService: Send + Sync {
    /// Every feature known locally with its install state.
    async fn list_features(&self) -> Result<Vec<FeatureInfo>>;

    /// Whether a feature is installed locally.
    async fn is_installed(&self, name: &str, version: &str) -> Result<bool>;

    /// Installs a feature.
    async fn install(&self, name: &str, version: &str) -> Result<()>;

    /// Uninstalls a feature. Unknown features are an error.
    async fn uninstall(&self, name: &str, version: &str) -> Result<()>;

    /// Repository urls registered locally.
    async fn list_repositories(&self) -> Result<BTreeSet<String>>;

    /// Registers a repository url.
    async fn add_repository(&self, url: &str) -> Result<()>;

    /// Unregisters a repository url.
    async fn remove_repository(&self, url: &str) -> Result<()>;
}

#[derive(Default)]
struct FeatureState {
    features: BTreeMap<String, FeatureInfo>,
    repositories: BTreeSet<String>,
    operations: usize,
}

/// In-memory feature runtime.
///
/// Installing an unknown feature registers it, so nodes need not share
/// repository contents.
#[derive(Default)]
pub struct MemoryFeaturesService {
    state: Mutex<FeatureState>,
}

impl MemoryFeaturesService {
    /// Empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a feature known without installing it.
    pub fn provide(&self, name: &str, version: &str) {
        let info = FeatureInfo::new(name, version, false);
        self.state
            .lock()
            .features
            .entry(info.key())
            .or_insert(info);
    }

    /// Number of install, uninstall and repository operations applied.
    pub fn operations(&self) -> usize {
        self.state.lock().operations
    }

    fn set_installed(&self, name: &str, version: &str, installed: bool) {
        let mut state = self.state.lock();
        let info = FeatureInfo::new(name, version, installed);
        state.features.insert(info.key(), info);
        state.operations += 1;
    }
}

#[async_trait]
impl FeaturesService for MemoryFeaturesService {
    async fn list_features(&self) -> Result<Vec<FeatureInfo>> {
        Ok(self.state.lock().features.values().cloned().collect())
    }

    async fn is_installed(&self, name: &str, version: &str) -> Result<bool> {
        let key = format!("{}/{}", name, version);
        Ok(self
            .state
            .lock()
            .features
            .get(&key)
            .map(|f| f.installed)
            .unwrap_or(false))
    }

    async fn install(&self, name: &str, version: &str) -> Result<()> {
        self.set_installed(name, version, true);
        Ok(())
    }

    async fn uninstall(&self, name: &str, version: &str) -> Result<()> {
        let key = format!("{}/{}", name, version);
        if !self.state.lock().features.contains_key(&key) {
            return Err(AdapterError::NotFound(key));
        }
        self.set_installed(name, version, false);
        Ok(())
    }

    async fn list_repositories(&self) -> Result<BTreeSet<String>> {
        Ok(self.state.lock().repositories.clone())
    }

    async fn add_repository(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.repositories.insert(url.to_string()) {
            state.operations += 1;
        }
        Ok(())
    }

    async fn remove_repository(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.repositories.remove(url) {
            state.operations += 1;
        }
        Ok(())
    }
}

fn features_map(ctx: &AdapterContext, group: &str) -> DistributedMap<FeatureInfo> {
    ctx.cluster().map(&collection_name(FEATURES_MAP, group))
}

fn repositories_set(ctx: &AdapterContext, group: &str) -> DistributedSet {
    ctx.cluster().set(&collection_name(REPOSITORIES_SET, group))
}

/// Brings the local install state of one feature in line with `target`.
/// Returns true when something changed.
async fn apply_feature(service: &dyn FeaturesService, target: &FeatureInfo) -> Result<bool> {
    let installed = service.is_installed(&target.name, &target.version).await?;
    match (target.installed, installed) {
        (true, false) => {
            service.install(&target.name, &target.version).await?;
            info!(feature = %target.key(), "feature installed from cluster");
            Ok(true)
        }
        (false, true) => {
            service.uninstall(&target.name, &target.version).await?;
            info!(feature = %target.key(), "feature uninstalled from cluster");
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Reconciles features and repositories of a group.
pub struct FeaturesSynchronizer {
    ctx: AdapterContext,
    service: Arc<dyn FeaturesService>,
}

impl FeaturesSynchronizer {
    /// Synchronizer over a local runtime.
    pub fn new(ctx: AdapterContext, service: Arc<dyn FeaturesService>) -> Self {
        Self { ctx, service }
    }

    async fn pull_repositories(&self, group: &str) -> Result<usize> {
        if !self.ctx.support().is_sync_enabled(group, Category::FeatureRepositories) {
            return Ok(0);
        }
        let local = self.service.list_repositories().await?;
        let mut changes = 0;
        for url in repositories_set(&self.ctx, group).members()? {
            if local.contains(&url)
                || !self
                    .ctx
                    .is_allowed(group, Category::FeatureRepositories, &url, Direction::Inbound)
            {
                continue;
            }
            match self.service.add_repository(&url).await {
                Ok(()) => changes += 1,
                Err(e) => warn!(group, url = %url, error = %e, "failed to add repository"),
            }
        }
        Ok(changes)
    }

    async fn pull_features(&self, group: &str) -> Result<usize> {
        let mut changes = 0;
        for (key, info) in features_map(&self.ctx, group).entries()? {
            if !self
                .ctx
                .is_allowed(group, Category::Features, &info.name, Direction::Inbound)
            {
                continue;
            }
            match apply_feature(self.service.as_ref(), &info).await {
                Ok(true) => changes += 1,
                Ok(false) => {}
                Err(e) => warn!(group, feature = %key, error = %e, "failed to apply feature"),
            }
        }
        Ok(changes)
    }

    async fn push_repositories(&self, group: &str) -> Result<usize> {
        if !self.ctx.support().is_sync_enabled(group, Category::FeatureRepositories) {
            return Ok(0);
        }
        let set = repositories_set(&self.ctx, group);
        let mut changes = 0;
        for url in self.service.list_repositories().await? {
            if self
                .ctx
                .is_allowed(group, Category::FeatureRepositories, &url, Direction::Outbound)
                && set.add(&url)?
            {
                changes += 1;
            }
        }
        Ok(changes)
    }

    async fn push_features(&self, group: &str) -> Result<usize> {
        let map = features_map(&self.ctx, group);
        let mut changes = 0;
        for info in self.service.list_features().await? {
            if !self
                .ctx
                .is_allowed(group, Category::Features, &info.name, Direction::Outbound)
            {
                continue;
            }
            let key = info.key();
            if map.get(&key)?.as_ref() != Some(&info) {
                map.put(&key, &info)?;
                changes += 1;
            }
        }
        Ok(changes)
    }
}

#[async_trait]
impl Synchronizer for FeaturesSynchronizer {
    fn name(&self) -> &str {
        "features"
    }

    fn is_sync_enabled(&self, group: &str) -> bool {
        self.ctx.support().is_sync_enabled(group, Category::Features)
    }

    async fn pull(&self, group: &str) -> cellar_core::Result<usize> {
        let repositories = self.pull_repositories(group).await?;
        let features = self.pull_features(group).await?;
        debug!(group, repositories, features, "features pulled");
        Ok(repositories + features)
    }

    async fn push(&self, group: &str) -> cellar_core::Result<usize> {
        if !self.ctx.push_enabled(self.name(), group) {
            return Ok(0);
        }
        let repositories = self.push_repositories(group).await?;
        let features = self.push_features(group).await?;
        debug!(group, repositories, features, "features pushed");
        Ok(repositories + features)
    }
}

/// Applies feature events from other nodes.
pub struct FeaturesEventHandler {
    ctx: AdapterContext,
    service: Arc<dyn FeaturesService>,
    switch: Switch,
}

impl FeaturesEventHandler {
    /// Handler applying cluster feature events.
    pub fn new(ctx: AdapterContext, service: Arc<dyn FeaturesService>) -> Self {
        let switch = handler_switch("features", ctx.store().clone());
        Self {
            ctx,
            service,
            switch,
        }
    }
}

#[async_trait]
impl EventHandler for FeaturesEventHandler {
    fn name(&self) -> &str {
        "features"
    }

    fn event_type(&self) -> EventType {
        EventType::Features
    }

    fn switch(&self) -> &Switch {
        &self.switch
    }

    async fn handle(&self, event: &Event) -> cellar_core::Result<()> {
        let EventPayload::Features {
            name,
            version,
            installed,
        } = &event.payload
        else {
            return Ok(());
        };
        if self
            .ctx
            .accepts(event, &self.switch, Category::Features, name)
            .is_none()
        {
            return Ok(());
        }
        let target = FeatureInfo::new(name.clone(), version.clone(), *installed);
        apply_feature(self.service.as_ref(), &target).await?;
        Ok(())
    }
}

/// Applies repository events from other nodes.
pub struct RepositoryEventHandler {
    ctx: AdapterContext,
    service: Arc<dyn FeaturesService>,
    switch: Switch,
}

impl RepositoryEventHandler {
    /// Handler applying cluster repository events.
    pub fn new(ctx: AdapterContext, service: Arc<dyn FeaturesService>) -> Self {
        let switch = handler_switch("features.repositories", ctx.store().clone());
        Self {
            ctx,
            service,
            switch,
        }
    }
}

#[async_trait]
impl EventHandler for RepositoryEventHandler {
    fn name(&self) -> &str {
        "features.repositories"
    }

    fn event_type(&self) -> EventType {
        EventType::FeatureRepository
    }

    fn switch(&self) -> &Switch {
        &self.switch
    }

    async fn handle(&self, event: &Event) -> cellar_core::Result<()> {
        let EventPayload::FeatureRepository { url, installed } = &event.payload else {
            return Ok(());
        };
        if self
            .ctx
            .accepts(event, &self.switch, Category::FeatureRepositories, url)
            .is_none()
        {
            return Ok(());
        }
        let present = self.service.list_repositories().await?.contains(url);
        if *installed && !present {
            self.service.add_repository(url).await?;
        } else if !*installed && present {
            self.service.remove_repository(url).await?;
        }
        Ok(())
    }
}

/// Cluster-wide feature operations and the local change listener.
pub struct FeaturesSupport {
    ctx: AdapterContext,
}

impl FeaturesSupport {
    /// Creates the entry point.
    pub fn new(ctx: AdapterContext) -> Self {
        Self { ctx }
    }

    /// Installs a feature on every node of a group.
    ///
    /// `force` skips the outbound policy here and the inbound policy and
    /// handler switches on receiving nodes.
    pub async fn install(&self, group: &str, name: &str, version: &str, force: bool) -> Result<()> {
        self.set_installed(group, FeatureInfo::new(name, version, true), force)
    }

    /// Uninstalls a feature on every node of a group.
    pub async fn uninstall(
        &self,
        group: &str,
        name: &str,
        version: &str,
        force: bool,
    ) -> Result<()> {
        self.set_installed(group, FeatureInfo::new(name, version, false), force)
    }

    fn set_installed(&self, group: &str, info: FeatureInfo, force: bool) -> Result<()> {
        self.ctx.check_can_publish(group)?;
        if !force {
            self.ctx
                .check_allowed(group, Category::Features, &info.name, Direction::Outbound)?;
        }
        features_map(&self.ctx, group).put(&info.key(), &info)?;
        let event = Event::new(EventPayload::Features {
            name: info.name.clone(),
            version: info.version.clone(),
            installed: info.installed,
        })
        .with_group(group)
        .forced(force);
        self.ctx.publish(event)?;
        info!(group, feature = %info.key(), installed = info.installed, "cluster feature updated");
        Ok(())
    }

    /// Adds a repository url to a group.
    pub async fn add_repository(&self, group: &str, url: &str) -> Result<()> {
        self.set_repository(group, url, true)
    }

    /// Removes a repository url from a group.
    pub async fn remove_repository(&self, group: &str, url: &str) -> Result<()> {
        self.set_repository(group, url, false)
    }

    fn set_repository(&self, group: &str, url: &str, installed: bool) -> Result<()> {
        self.ctx.check_can_publish(group)?;
        self.ctx
            .check_allowed(group, Category::FeatureRepositories, url, Direction::Outbound)?;
        let set = repositories_set(&self.ctx, group);
        if installed {
            set.add(url)?;
        } else {
            set.remove(url)?;
        }
        let event = Event::new(EventPayload::FeatureRepository {
            url: url.to_string(),
            installed,
        })
        .with_group(group);
        self.ctx.publish(event)?;
        Ok(())
    }

    /// Reports a local install or uninstall to every local group.
    ///
    /// Groups whose cluster state already matches are left alone, so changes
    /// applied from the cluster are not echoed back. Returns the groups
    /// notified.
    pub fn on_local_change(&self, info: &FeatureInfo) -> Result<Vec<String>> {
        let mut notified = Vec::new();
        for group in self.ctx.local_groups() {
            if !self.ctx.support().is_sync_enabled(&group, Category::Features)
                || !self
                    .ctx
                    .is_allowed(&group, Category::Features, &info.name, Direction::Outbound)
            {
                continue;
            }
            let map = features_map(&self.ctx, &group);
            let key = info.key();
            if map.get(&key)?.as_ref() == Some(info) {
                continue;
            }
            map.put(&key, info)?;
            let event = Event::new(EventPayload::Features {
                name: info.name.clone(),
                version: info.version.clone(),
                installed: info.installed,
            })
            .with_group(group.clone());
            self.ctx.publish(event)?;
            notified.push(group);
        }
        Ok(notified)
    }
}

/// Registers the feature synchronizer and event handlers on a node.
pub fn register(node: &CellarNode, service: Arc<dyn FeaturesService>) -> FeaturesSupport {
    let ctx = AdapterContext::new(node);
    node.register_synchronizer(Arc::new(FeaturesSynchronizer::new(ctx.clone(), service.clone())));
    node.register_event_handler(Arc::new(FeaturesEventHandler::new(ctx.clone(), service.clone())));
    node.register_event_handler(Arc::new(RepositoryEventHandler::new(ctx.clone(), service)));
    FeaturesSupport::new(ctx)
}
