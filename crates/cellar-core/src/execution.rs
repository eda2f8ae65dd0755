//! Request/response execution of commands on cluster nodes.
//!
//! Every destination runs in its own task bounded by the context timeout, so a
//! slow or failing node never affects the results of its siblings. A
//! timed-out command may still complete remotely; nothing cancels it there.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CellarError, Result};
use crate::event::{Command, CommandResult};
use crate::node::Node;
use crate::substrate::Substrate;

/// Default bound on one node's answer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Pending answer of one node.
pub type PendingResult = JoinHandle<Result<CommandResult>>;

/// Submits commands through the substrate and gathers per-node results.
#[derive(Clone)]
pub struct DistributedExecutionContext {
    substrate: Arc<dyn Substrate>,
    timeout: Duration,
}

impl DistributedExecutionContext {
    /// Creates a context with the default timeout.
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self::with_timeout(substrate, DEFAULT_TIMEOUT)
    }

    /// Creates a context with an explicit per-node timeout.
    pub fn with_timeout(substrate: Arc<dyn Substrate>, timeout: Duration) -> Self {
        Self { substrate, timeout }
    }

    /// Per-node timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolves the nodes a command goes to: its destinations, or every member.
    pub fn targets(&self, command: &Command) -> Vec<Node> {
        let mut targets: Vec<Node> = match &command.header.destinations {
            Some(destinations) => destinations.iter().cloned().collect(),
            None => self.substrate.members(),
        };
        targets.sort();
        targets
    }

    /// Starts the command on each target and returns one pending result per node.
    pub fn execute(&self, mut command: Command) -> HashMap<Node, PendingResult> {
        command.header.source_node = Some(self.substrate.local_node());
        let targets = self.targets(&command);
        debug!(
            id = %command.header.id,
            command_type = %command.command_type(),
            targets = targets.len(),
            "executing command"
        );
        targets
            .into_iter()
            .map(|node| {
                let handle = self.spawn(node.clone(), command.clone());
                (node, handle)
            })
            .collect()
    }

    /// Starts the command on the given nodes.
    pub fn execute_on_nodes(
        &self,
        command: Command,
        destinations: HashSet<Node>,
    ) -> HashMap<Node, PendingResult> {
        self.execute(command.with_destinations(destinations))
    }

    /// Starts the command on a single node.
    pub fn execute_on(&self, mut command: Command, destination: Node) -> PendingResult {
        command.header.source_node = Some(self.substrate.local_node());
        let command = command.with_destination(destination.clone());
        self.spawn(destination, command)
    }

    /// Runs the command everywhere it is addressed and waits for every answer.
    ///
    /// Never fails as a whole: a node that errors, is unreachable or times out
    /// gets a failed [`CommandResult`] and a warning naming it.
    pub async fn execute_and_wait(&self, command: Command) -> HashMap<Node, CommandResult> {
        let id = command.header.id.clone();
        let pending = self.execute(command);
        let mut results = HashMap::with_capacity(pending.len());
        for (node, handle) in pending {
            let result = Self::settle(&id, &node, handle).await;
            results.insert(node, result);
        }
        results
    }

    /// Runs the command on the given nodes and waits for every answer.
    pub async fn execute_and_wait_on_nodes(
        &self,
        command: Command,
        destinations: HashSet<Node>,
    ) -> HashMap<Node, CommandResult> {
        self.execute_and_wait(command.with_destinations(destinations))
            .await
    }

    /// Runs the command on a single node and waits for its answer.
    pub async fn execute_and_wait_on(&self, command: Command, destination: Node) -> CommandResult {
        let id = command.header.id.clone();
        let handle = self.execute_on(command, destination.clone());
        Self::settle(&id, &destination, handle).await
    }

    /// Runs the command in the background and hands the gathered results to
    /// `callback`. The caller never blocks.
    pub fn execute_async<F>(&self, command: Command, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(HashMap<Node, CommandResult>) + Send + 'static,
    {
        let context = self.clone();
        tokio::spawn(async move {
            let results = context.execute_and_wait(command).await;
            callback(results);
        })
    }

    fn spawn(&self, node: Node, command: Command) -> PendingResult {
        let substrate = self.substrate.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            let id = command.header.id.clone();
            match tokio::time::timeout(timeout, substrate.submit(&node, command)).await {
                Ok(result) => result,
                Err(_) => Err(CellarError::Timeout {
                    command_id: id,
                    node: node.id().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        })
    }

    async fn settle(id: &str, node: &Node, handle: PendingResult) -> CommandResult {
        match handle.await {
            Ok(Ok(result)) => {
                if !result.successful {
                    warn!(
                        id,
                        node = %node,
                        error = result.error.as_deref().unwrap_or(""),
                        "command failed on node"
                    );
                }
                result
            }
            Ok(Err(e)) => {
                warn!(id, node = %node, error = %e, "command did not complete on node");
                CommandResult::failure(id, node.clone(), e.to_string())
            }
            Err(e) => {
                warn!(id, node = %node, error = %e, "command task aborted");
                CommandResult::failure(id, node.clone(), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Request, Response};
    use crate::memory::MemoryGrid;
    use crate::substrate::CommandExecutor;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Answer {
        node: Node,
        delay: Duration,
    }

    #[async_trait]
    impl CommandExecutor for Answer {
        async fn execute(&self, command: Command) -> Result<CommandResult> {
            tokio::time::sleep(self.delay).await;
            Ok(CommandResult::success(
                command.header.id,
                self.node.clone(),
                Response::Empty,
            ))
        }
    }

    struct Boom;

    #[async_trait]
    impl CommandExecutor for Boom {
        async fn execute(&self, _command: Command) -> Result<CommandResult> {
            Err(CellarError::Handler("boom".to_string()))
        }
    }

    fn command() -> Command {
        Command::new(Request::ProducerSwitch { status: None })
    }

    fn answering(grid: &MemoryGrid, host: &str, delay: Duration) -> Node {
        let member = grid.join(host, 5701);
        let node = member.local_node();
        member.register_executor(Arc::new(Answer {
            node: node.clone(),
            delay,
        }));
        node
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member() {
        let grid = MemoryGrid::new();
        let a = grid.join("a", 5701);
        a.register_executor(Arc::new(Answer {
            node: a.local_node(),
            delay: Duration::ZERO,
        }));
        answering(&grid, "b", Duration::ZERO);

        let ctx = DistributedExecutionContext::new(Arc::new(a));
        let results = ctx.execute_and_wait(command()).await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.successful));
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_other_results() {
        let grid = MemoryGrid::new();
        let caller = grid.join("caller", 5701);
        let a = answering(&grid, "a", Duration::ZERO);
        let b_member = grid.join("b", 5701);
        b_member.register_executor(Arc::new(Boom));
        let b = b_member.local_node();
        let c = answering(&grid, "c", Duration::ZERO);

        let ctx = DistributedExecutionContext::new(Arc::new(caller));
        let destinations: HashSet<Node> = [a.clone(), b.clone(), c.clone()].into_iter().collect();
        let results = ctx.execute_and_wait_on_nodes(command(), destinations).await;

        assert_eq!(results.len(), 3);
        assert!(results[&a].successful);
        assert!(results[&c].successful);
        assert!(!results[&b].successful);
        assert!(results[&b].error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_unreachable_node_marked_failed() {
        let grid = MemoryGrid::new();
        let caller = grid.join("caller", 5701);
        let a = answering(&grid, "a", Duration::ZERO);
        grid.set_unreachable(&a, true);

        let ctx = DistributedExecutionContext::new(Arc::new(caller));
        let result = ctx.execute_and_wait_on(command(), a.clone()).await;
        assert!(!result.successful);
        assert_eq!(result.source_node, a);
    }

    #[tokio::test]
    async fn test_timeout_marked_failed() {
        let grid = MemoryGrid::new();
        let caller = grid.join("caller", 5701);
        let slow = answering(&grid, "slow", Duration::from_secs(5));
        let fast = answering(&grid, "fast", Duration::ZERO);

        let ctx =
            DistributedExecutionContext::with_timeout(Arc::new(caller), Duration::from_millis(50));
        let destinations: HashSet<Node> = [slow.clone(), fast.clone()].into_iter().collect();
        let results = ctx.execute_and_wait_on_nodes(command(), destinations).await;

        assert!(results[&fast].successful);
        assert!(!results[&slow].successful);
        assert!(results[&slow].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_execute_async_invokes_callback() {
        let grid = MemoryGrid::new();
        let caller = grid.join("caller", 5701);
        let a = answering(&grid, "a", Duration::from_millis(10));

        let ctx = DistributedExecutionContext::new(Arc::new(caller));
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let handle = ctx.execute_async(command().with_destination(a.clone()), move |results| {
            *sink.lock() = Some(results.len());
        });
        handle.await.unwrap();
        assert_eq!(*seen.lock(), Some(1));
    }

    #[tokio::test]
    async fn test_execute_returns_pending_per_node() {
        let grid = MemoryGrid::new();
        let caller = grid.join("caller", 5701);
        let a = answering(&grid, "a", Duration::ZERO);

        let ctx = DistributedExecutionContext::new(Arc::new(caller));
        let mut pending = ctx.execute(command().with_destination(a.clone()));
        let result = pending.remove(&a).unwrap().await.unwrap().unwrap();
        assert!(result.successful);
    }
}
