//! Clustering substrate abstraction.
//!
//! The core never talks to a specific data grid. It consumes this trait, which
//! provides membership, distributed maps with per-key locks, a broadcast topic,
//! a work queue and remote command execution. [`MemoryGrid`](crate::memory::MemoryGrid)
//! is the in-process implementation used by tests and the demo binary.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::event::{Command, CommandResult};
use crate::node::Node;

/// Membership change reported by the substrate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A process joined.
    MemberAdded(Node),
    /// A process left or was evicted.
    MemberRemoved(Node),
}

/// Kind of change applied to a distributed map entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MapEventKind {
    /// Entry created or replaced.
    Put,
    /// Entry removed.
    Removed,
}

/// Change notification for a distributed map.
#[derive(Clone, Debug)]
pub struct MapEvent {
    /// Map name.
    pub map: String,
    /// Entry key.
    pub key: String,
    /// What happened.
    pub kind: MapEventKind,
    /// Node that performed the write.
    pub origin: Node,
}

/// Scoped per-key lock on a distributed map entry.
///
/// The lock is released when the guard is dropped, on every exit path.
pub struct EntryLock {
    map: String,
    key: String,
    _release: Box<dyn Send + Sync>,
}

impl EntryLock {
    /// Wraps a substrate-specific guard whose drop releases the lock.
    pub fn new(map: impl Into<String>, key: impl Into<String>, release: Box<dyn Send + Sync>) -> Self {
        Self {
            map: map.into(),
            key: key.into(),
            _release: release,
        }
    }

    /// Locked map.
    pub fn map(&self) -> &str {
        &self.map
    }

    /// Locked key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Executes commands submitted to the local node.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs a command and produces the local node's result.
    async fn execute(&self, command: Command) -> Result<CommandResult>;
}

/// Distributed collections, messaging and execution for one joined process.
#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    /// Identity assigned to this process.
    fn local_node(&self) -> Node;

    /// Current members, including the local node.
    fn members(&self) -> Vec<Node>;

    /// Subscribes to membership changes.
    fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent>;

    /// Leaves the cluster gracefully.
    async fn leave(&self) -> Result<()>;

    /// Reads an entry.
    fn map_get(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes an entry, returning the previous value.
    fn map_put(&self, map: &str, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>>;

    /// Removes an entry, returning the previous value.
    fn map_remove(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Every entry of a map.
    fn map_entries(&self, map: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Subscribes to changes of one map.
    fn subscribe_map(&self, map: &str) -> broadcast::Receiver<MapEvent>;

    /// Acquires the cluster-wide lock on one map entry.
    async fn lock(&self, map: &str, key: &str) -> Result<EntryLock>;

    /// Publishes to every subscriber of a topic.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribes to a topic.
    fn subscribe_topic(&self, topic: &str) -> broadcast::Receiver<Vec<u8>>;

    /// Enqueues one item; exactly one consumer will take it.
    fn offer(&self, queue: &str, payload: Vec<u8>) -> Result<()>;

    /// Takes one item, waiting up to `timeout`.
    async fn poll(&self, queue: &str, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Registers the executor for commands addressed to this process.
    fn register_executor(&self, executor: Arc<dyn CommandExecutor>);

    /// Runs a command on `target` and returns its result.
    async fn submit(&self, target: &Node, command: Command) -> Result<CommandResult>;
}
