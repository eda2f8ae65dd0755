//! Routing of incoming events and commands to typed handlers.
//!
//! Handlers are keyed on [`EventType`] / [`CommandType`]; exactly one handler
//! serves each type. The event dispatcher always invokes the handler and
//! leaves it to the handler's own [`Switch`] to decide whether to act.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config_store::ConfigStore;
use crate::configuration::{handler_key, NODE_PID};
use crate::error::{CellarError, Result};
use crate::event::{Command, CommandResult, CommandType, Event, EventType, Response};
use crate::node::Node;
use crate::substrate::CommandExecutor;
use crate::switch::{Switch, SwitchStatus};

/// Builds the switch of an event handler, backed by `handler.<name>` in the
/// node PID and ON unless configured otherwise.
pub fn handler_switch(name: &str, store: Arc<ConfigStore>) -> Switch {
    Switch::backed_by(name, store, NODE_PID, handler_key(name), SwitchStatus::On)
}

/// Applies one type of cluster event locally.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name, also the suffix of its switch property.
    fn name(&self) -> &str;

    /// Event type this handler serves.
    fn event_type(&self) -> EventType;

    /// Gate consulted by the handler before acting.
    fn switch(&self) -> &Switch;

    /// Applies the event. Suppression via the switch happens here.
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Registry of event handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<EventType, Arc<dyn EventHandler>>>,
}

impl EventDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any handler of the same type.
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        let event_type = handler.event_type();
        debug!(handler = handler.name(), %event_type, "registering event handler");
        if let Some(previous) = self.handlers.write().insert(event_type, handler) {
            warn!(previous = previous.name(), %event_type, "event handler replaced");
        }
    }

    /// Removes the handler of a type.
    pub fn unregister(&self, event_type: EventType) -> Option<Arc<dyn EventHandler>> {
        self.handlers.write().remove(&event_type)
    }

    /// Finds a handler by name.
    pub fn handler(&self, name: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .values()
            .find(|h| h.name() == name)
            .cloned()
    }

    /// Every handler with its current switch status.
    pub fn handler_statuses(&self) -> BTreeMap<String, SwitchStatus> {
        self.handlers
            .read()
            .values()
            .map(|h| (h.name().to_string(), h.switch().status()))
            .collect()
    }

    /// Routes an event to its handler. Returns false when no handler matched.
    ///
    /// Handler failures are logged; fire-and-forget events have no reply path.
    pub async fn dispatch(&self, event: &Event) -> bool {
        let event_type = event.event_type();
        let handler = self.handlers.read().get(&event_type).cloned();
        let Some(handler) = handler else {
            warn!(%event_type, id = %event.header.id, "no handler for event, dropping");
            return false;
        };
        if let Err(e) = handler.handle(event).await {
            warn!(
                handler = handler.name(),
                id = %event.header.id,
                error = %e,
                "event handler failed"
            );
        }
        true
    }
}

/// Executes one type of command on the destination node.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Command type this handler serves.
    fn command_type(&self) -> CommandType;

    /// Runs the command and returns the response body.
    async fn execute(&self, command: &Command) -> Result<Response>;
}

/// Registry of command handlers; the local node's [`CommandExecutor`].
pub struct CommandDispatcher {
    local: Node,
    handlers: RwLock<HashMap<CommandType, Arc<dyn CommandHandler>>>,
}

impl CommandDispatcher {
    /// Creates an empty dispatcher answering as `local`.
    pub fn new(local: Node) -> Self {
        Self {
            local,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a handler, replacing any handler of the same type.
    pub fn register(&self, handler: Arc<dyn CommandHandler>) {
        let command_type = handler.command_type();
        debug!(%command_type, "registering command handler");
        self.handlers.write().insert(command_type, handler);
    }

    /// Command types with a registered handler, sorted.
    pub fn command_types(&self) -> Vec<CommandType> {
        let mut types: Vec<CommandType> = self.handlers.read().keys().copied().collect();
        types.sort();
        types
    }
}

#[async_trait]
impl CommandExecutor for CommandDispatcher {
    async fn execute(&self, command: Command) -> Result<CommandResult> {
        let command_type = command.command_type();
        let id = command.header.id.clone();
        let handler = self.handlers.read().get(&command_type).cloned();
        let Some(handler) = handler else {
            let err = CellarError::NoHandler(command_type.to_string());
            warn!(%command_type, id = %id, "no handler for command");
            return Ok(CommandResult::failure(id, self.local.clone(), err.to_string()));
        };
        match handler.execute(&command).await {
            Ok(response) => Ok(CommandResult::success(id, self.local.clone(), response)),
            Err(e) => {
                warn!(%command_type, id = %id, error = %e, "command failed");
                Ok(CommandResult::failure(id, self.local.clone(), e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, Request};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        switch: Switch,
        handled: AtomicUsize,
        applied: AtomicUsize,
    }

    impl CountingHandler {
        fn new(status: SwitchStatus) -> Self {
            Self {
                switch: Switch::new("counting", status),
                handled: AtomicUsize::new(0),
                applied: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        fn event_type(&self) -> EventType {
            EventType::FeatureRepository
        }

        fn switch(&self) -> &Switch {
            &self.switch
        }

        async fn handle(&self, _event: &Event) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.switch.is_on() {
                self.applied.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn repo_event() -> Event {
        Event::new(EventPayload::FeatureRepository {
            url: "mvn:repo".to_string(),
            installed: true,
        })
    }

    #[tokio::test]
    async fn test_dispatch_exact_type() {
        let dispatcher = EventDispatcher::new();
        let handler = Arc::new(CountingHandler::new(SwitchStatus::On));
        dispatcher.register(handler.clone());

        assert!(dispatcher.dispatch(&repo_event()).await);
        let other = Event::new(EventPayload::Features {
            name: "f".to_string(),
            version: "1".to_string(),
            installed: true,
        });
        assert!(!dispatcher.dispatch(&other).await);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_calls_handler_even_when_switched_off() {
        let dispatcher = EventDispatcher::new();
        let handler = Arc::new(CountingHandler::new(SwitchStatus::Off));
        dispatcher.register(handler.clone());

        dispatcher.dispatch(&repo_event()).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(handler.applied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_statuses() {
        let dispatcher = EventDispatcher::new();
        dispatcher.register(Arc::new(CountingHandler::new(SwitchStatus::Off)));
        let statuses = dispatcher.handler_statuses();
        assert_eq!(statuses.get("counting"), Some(&SwitchStatus::Off));
        assert!(dispatcher.handler("counting").is_some());
        assert!(dispatcher.unregister(EventType::FeatureRepository).is_some());
        assert!(dispatcher.handler("counting").is_none());
    }

    #[test]
    fn test_handler_switch_reads_node_pid() {
        let store = Arc::new(ConfigStore::in_memory());
        store
            .set_property(NODE_PID, "handler.features", "false")
            .unwrap();
        let switch = handler_switch("features", store);
        assert_eq!(switch.status(), SwitchStatus::Off);
    }

    struct FailingHandler;

    #[async_trait]
    impl CommandHandler for FailingHandler {
        fn command_type(&self) -> CommandType {
            CommandType::ProducerSwitch
        }

        async fn execute(&self, _command: &Command) -> Result<Response> {
            Err(CellarError::Handler("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_command_failure_becomes_failed_result() {
        let local = Node::new("n1", "127.0.0.1", 5701);
        let dispatcher = CommandDispatcher::new(local.clone());
        dispatcher.register(Arc::new(FailingHandler));

        let result = dispatcher
            .execute(Command::new(Request::ProducerSwitch { status: None }))
            .await
            .unwrap();
        assert!(!result.successful);
        assert_eq!(result.source_node, local);
        assert!(result.error.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_missing_command_handler() {
        let dispatcher = CommandDispatcher::new(Node::new("n1", "h", 1));
        let result = dispatcher
            .execute(Command::new(Request::ConsumerSwitch { status: None }))
            .await
            .unwrap();
        assert!(!result.successful);
        assert!(dispatcher.command_types().is_empty());
    }
}
