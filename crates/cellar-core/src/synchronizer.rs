//! Pull/push reconciliation contract and the registry of domain synchronizers.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;

/// State changes applied by one synchronization pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Local changes applied from cluster state.
    pub pulled: usize,
    /// Cluster entries written from local state.
    pub pushed: usize,
}

impl SyncReport {
    /// Total number of changes.
    pub fn changes(&self) -> usize {
        self.pulled + self.pushed
    }

    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.changes() == 0
    }
}

impl AddAssign for SyncReport {
    fn add_assign(&mut self, other: Self) {
        self.pulled += other.pulled;
        self.pushed += other.pushed;
    }
}

/// Reconciles one domain's local state with its per-group cluster state.
///
/// Both directions consult policy independently and are safe to re-run: a
/// second pass over unchanged state reports no changes.
#[async_trait]
pub trait Synchronizer: Send + Sync {
    /// Domain name, used in logs.
    fn name(&self) -> &str;

    /// Whether the group's sync flag for this domain is set.
    fn is_sync_enabled(&self, group: &str) -> bool;

    /// Applies cluster state to the local node. Returns the number of changes.
    async fn pull(&self, group: &str) -> Result<usize>;

    /// Writes local state into the cluster. Returns the number of changes.
    async fn push(&self, group: &str) -> Result<usize>;

    /// Pull, then push.
    async fn synchronize(&self, group: &str) -> Result<SyncReport> {
        if !self.is_sync_enabled(group) {
            debug!(synchronizer = self.name(), group, "sync disabled, skipping");
            return Ok(SyncReport::default());
        }
        let pulled = self.pull(group).await?;
        let pushed = self.push(group).await?;
        Ok(SyncReport { pulled, pushed })
    }
}

/// Every synchronizer registered on the node.
#[derive(Default)]
pub struct SynchronizerRegistry {
    synchronizers: RwLock<Vec<Arc<dyn Synchronizer>>>,
}

impl SynchronizerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a synchronizer. A synchronizer with the same name is replaced.
    pub fn register(&self, synchronizer: Arc<dyn Synchronizer>) {
        let mut synchronizers = self.synchronizers.write();
        synchronizers.retain(|s| s.name() != synchronizer.name());
        info!(synchronizer = synchronizer.name(), "synchronizer registered");
        synchronizers.push(synchronizer);
    }

    /// Names of registered synchronizers, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.synchronizers
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Number of registered synchronizers.
    pub fn len(&self) -> usize {
        self.synchronizers.read().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every synchronizer for a group.
    ///
    /// A failing synchronizer is logged and does not stop the others.
    pub async fn synchronize(&self, group: &str) -> SyncReport {
        let synchronizers: Vec<Arc<dyn Synchronizer>> = self.synchronizers.read().clone();
        let mut total = SyncReport::default();
        for synchronizer in synchronizers {
            match synchronizer.synchronize(group).await {
                Ok(report) => {
                    debug!(
                        synchronizer = synchronizer.name(),
                        group,
                        pulled = report.pulled,
                        pushed = report.pushed,
                        "synchronized"
                    );
                    total += report;
                }
                Err(e) => {
                    warn!(synchronizer = synchronizer.name(), group, error = %e, "synchronization failed");
                }
            }
        }
        total
    }
}
