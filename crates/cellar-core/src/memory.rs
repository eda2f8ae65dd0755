//! In-process clustering substrate.
//!
//! A [`MemoryGrid`] holds the shared state of one simulated cluster; every
//! process that joins it gets a [`MemoryMember`] handle implementing
//! [`Substrate`]. Maps are last-writer-wins per key, topics fan out over
//! `broadcast` channels and queues hand each item to exactly one poller.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info};

use crate::error::{CellarError, Result};
use crate::event::{Command, CommandResult};
use crate::node::Node;
use crate::substrate::{
    CommandExecutor, EntryLock, MapEvent, MapEventKind, MembershipEvent, Substrate,
};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct MemoryQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

struct GridInner {
    members: RwLock<Vec<Node>>,
    membership_tx: broadcast::Sender<MembershipEvent>,
    maps: DashMap<String, HashMap<String, Vec<u8>>>,
    map_events: DashMap<String, broadcast::Sender<MapEvent>>,
    locks: DashMap<(String, String), Arc<tokio::sync::Mutex<()>>>,
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
    queues: DashMap<String, Arc<MemoryQueue>>,
    executors: DashMap<String, Arc<dyn CommandExecutor>>,
    unreachable: RwLock<HashSet<String>>,
}

impl GridInner {
    fn remove_member(&self, node: &Node) -> bool {
        let removed = {
            let mut members = self.members.write();
            let before = members.len();
            members.retain(|m| m != node);
            members.len() != before
        };
        if removed {
            self.executors.remove(node.id());
            let _ = self
                .membership_tx
                .send(MembershipEvent::MemberRemoved(node.clone()));
            info!(node = %node, "member removed");
        }
        removed
    }

    fn emit_map_event(&self, map: &str, key: &str, kind: MapEventKind, origin: &Node) {
        let sender = self.map_events.get(map).map(|s| s.clone());
        if let Some(sender) = sender {
            let _ = sender.send(MapEvent {
                map: map.to_string(),
                key: key.to_string(),
                kind,
                origin: origin.clone(),
            });
        }
    }
}

/// Shared state of one simulated cluster.
#[derive(Clone)]
pub struct MemoryGrid {
    inner: Arc<GridInner>,
}

impl MemoryGrid {
    /// Creates an empty cluster.
    pub fn new() -> Self {
        let (membership_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(GridInner {
                members: RwLock::new(Vec::new()),
                membership_tx,
                maps: DashMap::new(),
                map_events: DashMap::new(),
                locks: DashMap::new(),
                topics: DashMap::new(),
                queues: DashMap::new(),
                executors: DashMap::new(),
                unreachable: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// Joins a new process with a generated id.
    pub fn join(&self, host: &str, port: u16) -> MemoryMember {
        self.join_with_id(&uuid::Uuid::new_v4().to_string(), host, port)
    }

    /// Joins a new process with a fixed id.
    pub fn join_with_id(&self, id: &str, host: &str, port: u16) -> MemoryMember {
        let node = Node::new(id, host, port);
        {
            let mut members = self.inner.members.write();
            if !members.contains(&node) {
                members.push(node.clone());
            }
        }
        let _ = self
            .inner
            .membership_tx
            .send(MembershipEvent::MemberAdded(node.clone()));
        info!(node = %node, "member added");
        MemoryMember {
            grid: self.inner.clone(),
            local: node,
        }
    }

    /// Current members in join order.
    pub fn members(&self) -> Vec<Node> {
        self.inner.members.read().clone()
    }

    /// Evicts a member as a failure detector would.
    pub fn evict(&self, node: &Node) -> bool {
        self.inner.remove_member(node)
    }

    /// Makes command submission to a node fail, or restores it.
    pub fn set_unreachable(&self, node: &Node, unreachable: bool) {
        let mut set = self.inner.unreachable.write();
        if unreachable {
            set.insert(node.id().to_string());
        } else {
            set.remove(node.id());
        }
    }
}

impl Default for MemoryGrid {
    fn default() -> Self {
        Self::new()
    }
}

/// One process's handle on a [`MemoryGrid`].
#[derive(Clone)]
pub struct MemoryMember {
    grid: Arc<GridInner>,
    local: Node,
}

#[async_trait]
impl Substrate for MemoryMember {
    fn local_node(&self) -> Node {
        self.local.clone()
    }

    fn members(&self) -> Vec<Node> {
        self.grid.members.read().clone()
    }

    fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.grid.membership_tx.subscribe()
    }

    async fn leave(&self) -> Result<()> {
        self.grid.remove_member(&self.local);
        Ok(())
    }

    fn map_get(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.grid.maps.get(map).and_then(|m| m.get(key).cloned()))
    }

    fn map_put(&self, map: &str, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let previous = {
            let mut entries = self.grid.maps.entry(map.to_string()).or_default();
            entries.insert(key.to_string(), value)
        };
        self.grid
            .emit_map_event(map, key, MapEventKind::Put, &self.local);
        Ok(previous)
    }

    fn map_remove(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let previous = self
            .grid
            .maps
            .get_mut(map)
            .and_then(|mut m| m.remove(key));
        if previous.is_some() {
            self.grid
                .emit_map_event(map, key, MapEventKind::Removed, &self.local);
        }
        Ok(previous)
    }

    fn map_entries(&self, map: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries: Vec<(String, Vec<u8>)> = self
            .grid
            .maps
            .get(map)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn subscribe_map(&self, map: &str) -> broadcast::Receiver<MapEvent> {
        self.grid
            .map_events
            .entry(map.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    async fn lock(&self, map: &str, key: &str) -> Result<EntryLock> {
        let mutex = self
            .grid
            .locks
            .entry((map.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        debug!(map, key, node = %self.local.id(), "entry locked");
        Ok(EntryLock::new(map, key, Box::new(guard)))
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let sender = self
            .grid
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let _ = sender.send(payload);
        Ok(())
    }

    fn subscribe_topic(&self, topic: &str) -> broadcast::Receiver<Vec<u8>> {
        self.grid
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn offer(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        let queue = self.queue(queue);
        queue.items.lock().push_back(payload);
        queue.notify.notify_one();
        Ok(())
    }

    async fn poll(&self, queue: &str, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let queue = self.queue(queue);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = queue.notify.notified();
            if let Some(item) = queue.items.lock().pop_front() {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn register_executor(&self, executor: Arc<dyn CommandExecutor>) {
        self.grid
            .executors
            .insert(self.local.id().to_string(), executor);
    }

    async fn submit(&self, target: &Node, command: Command) -> Result<CommandResult> {
        let unreachable = || CellarError::NodeUnreachable {
            node: target.id().to_string(),
        };
        if self.grid.unreachable.read().contains(target.id()) {
            return Err(unreachable());
        }
        let executor = self
            .grid
            .executors
            .get(target.id())
            .map(|e| e.clone())
            .ok_or_else(unreachable)?;
        executor.execute(command).await
    }
}

impl MemoryMember {
    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.grid
            .queues
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Request, Response};

    struct EchoExecutor(Node);

    #[async_trait]
    impl CommandExecutor for EchoExecutor {
        async fn execute(&self, command: Command) -> Result<CommandResult> {
            Ok(CommandResult::success(
                command.header.id,
                self.0.clone(),
                Response::Empty,
            ))
        }
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let grid = MemoryGrid::new();
        let a = grid.join("10.0.0.1", 5701);
        let _b = grid.join("10.0.0.2", 5701);
        assert_eq!(a.members().len(), 2);

        let mut rx = a.subscribe_membership();
        a.leave().await.unwrap();
        assert_eq!(grid.members().len(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            MembershipEvent::MemberRemoved(n) if n == a.local_node()
        ));
    }

    #[tokio::test]
    async fn test_maps_are_shared() {
        let grid = MemoryGrid::new();
        let a = grid.join("a", 1);
        let b = grid.join("b", 1);
        a.map_put("m", "k", vec![1]).unwrap();
        assert_eq!(b.map_get("m", "k").unwrap(), Some(vec![1]));
        assert_eq!(b.map_remove("m", "k").unwrap(), Some(vec![1]));
        assert!(a.map_entries("m").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_map_events_carry_origin() {
        let grid = MemoryGrid::new();
        let a = grid.join("a", 1);
        let b = grid.join("b", 1);
        let mut rx = b.subscribe_map("m");
        a.map_put("m", "k", vec![1]).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, "k");
        assert_eq!(event.kind, MapEventKind::Put);
        assert_eq!(event.origin, a.local_node());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_per_key() {
        let grid = MemoryGrid::new();
        let a = grid.join("a", 1);
        let b = grid.join("b", 1);

        let guard = a.lock("m", "k").await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), b.lock("m", "k")).await;
        assert!(blocked.is_err());

        let other = tokio::time::timeout(Duration::from_millis(50), b.lock("m", "other")).await;
        assert!(other.is_ok());

        drop(guard);
        let relocked = tokio::time::timeout(Duration::from_millis(50), b.lock("m", "k")).await;
        assert!(relocked.is_ok());
    }

    #[tokio::test]
    async fn test_queue_item_taken_once() {
        let grid = MemoryGrid::new();
        let a = grid.join("a", 1);
        let b = grid.join("b", 1);
        a.offer("q", vec![7]).unwrap();

        let first = b.poll("q", Duration::from_millis(50)).await.unwrap();
        let second = a.poll("q", Duration::from_millis(50)).await.unwrap();
        assert_eq!(first, Some(vec![7]));
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_offer() {
        let grid = MemoryGrid::new();
        let a = grid.join("a", 1);
        let b = grid.join("b", 1);
        let poller = tokio::spawn(async move { b.poll("q", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.offer("q", vec![1, 2]).unwrap();
        assert_eq!(poller.await.unwrap().unwrap(), Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_submit_routes_to_target_executor() {
        let grid = MemoryGrid::new();
        let a = grid.join("a", 1);
        let b = grid.join("b", 1);
        b.register_executor(Arc::new(EchoExecutor(b.local_node())));

        let command = Command::new(Request::ProducerSwitch { status: None });
        let result = a.submit(&b.local_node(), command).await.unwrap();
        assert_eq!(result.source_node, b.local_node());
    }

    #[tokio::test]
    async fn test_submit_to_unreachable_node_fails() {
        let grid = MemoryGrid::new();
        let a = grid.join("a", 1);
        let b = grid.join("b", 1);
        b.register_executor(Arc::new(EchoExecutor(b.local_node())));
        grid.set_unreachable(&b.local_node(), true);

        let command = Command::new(Request::ProducerSwitch { status: None });
        let err = a.submit(&b.local_node(), command).await.unwrap_err();
        assert!(matches!(err, CellarError::NodeUnreachable { .. }));
    }
}
