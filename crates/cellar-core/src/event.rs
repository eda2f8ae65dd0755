//! Cluster events and commands.
//!
//! Events are fire-and-forget state-change notifications carried by the
//! producer/consumer transports. Commands are requests executed on destination
//! nodes through the [`DistributedExecutionContext`](crate::execution::DistributedExecutionContext),
//! each node answering with a [`CommandResult`].
//!
//! Both are closed tagged unions: the dispatcher keys handlers on
//! [`EventType`] / [`CommandType`] derived from the payload variant.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::config_store::Properties;
use crate::error::Result;
use crate::group::Group;
use crate::node::Node;
use crate::switch::SwitchStatus;

/// Envelope fields shared by events and commands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Header {
    /// Unique message id.
    pub id: String,
    /// Sending node, stamped by the producer or execution context.
    pub source_node: Option<Node>,
    /// Group the message concerns; `None` for cluster-wide messages.
    pub source_group: Option<String>,
    /// Explicit recipients; `None` means every subscribed node.
    pub destinations: Option<HashSet<Node>>,
    /// Bypass the producer and consumer switches.
    pub force: bool,
    /// Deliver the message back to its publisher as well.
    pub post_publish: bool,
}

impl Header {
    fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_node: None,
            source_group: None,
            destinations: None,
            force: false,
            post_publish: false,
        }
    }

    /// Returns true if `node` should receive a message with this header.
    pub fn is_addressed_to(&self, node: &Node) -> bool {
        match &self.destinations {
            Some(destinations) => destinations.contains(node),
            None => true,
        }
    }
}

/// Change applied to a configuration PID.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationChange {
    /// Properties created or updated.
    Update,
    /// PID deleted.
    Delete,
}

/// Lifecycle status of a bundle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BundleStatus {
    /// Installed but not resolved.
    Installed,
    /// Resolved, not started.
    Resolved,
    /// Started.
    Active,
    /// Stopped after having been started.
    Stopped,
    /// Removed.
    Uninstalled,
}

impl fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundleStatus::Installed => "Installed",
            BundleStatus::Resolved => "Resolved",
            BundleStatus::Active => "Active",
            BundleStatus::Stopped => "Stopped",
            BundleStatus::Uninstalled => "Uninstalled",
        };
        f.write_str(s)
    }
}

/// Payload of a cluster event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    /// A configuration PID changed.
    Configuration {
        /// PID that changed.
        pid: String,
        /// New properties; `None` on delete.
        properties: Option<Properties>,
        /// Kind of change.
        change: ConfigurationChange,
    },
    /// A feature was installed or uninstalled.
    Features {
        /// Feature name.
        name: String,
        /// Feature version.
        version: String,
        /// Installed state after the change.
        installed: bool,
    },
    /// A feature repository was added or removed.
    FeatureRepository {
        /// Repository url.
        url: String,
        /// Present after the change.
        installed: bool,
    },
    /// A bundle changed lifecycle status.
    Bundle {
        /// Bundle symbolic name.
        symbolic_name: String,
        /// Bundle version.
        version: String,
        /// Install location.
        location: String,
        /// Status after the change.
        status: BundleStatus,
    },
}

/// Discriminant used to route events to handlers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// [`EventPayload::Configuration`].
    Configuration,
    /// [`EventPayload::Features`].
    Features,
    /// [`EventPayload::FeatureRepository`].
    FeatureRepository,
    /// [`EventPayload::Bundle`].
    Bundle,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A fire-and-forget cluster event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Envelope.
    pub header: Header,
    /// Typed payload.
    pub payload: EventPayload,
}

impl Event {
    /// Creates a broadcast event with a fresh id.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            header: Header::new(),
            payload,
        }
    }

    /// Scopes the event to a group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.header.source_group = Some(group.into());
        self
    }

    /// Restricts delivery to the given nodes.
    pub fn with_destinations(mut self, destinations: HashSet<Node>) -> Self {
        self.header.destinations = Some(destinations);
        self
    }

    /// Marks the event as bypassing switches.
    pub fn forced(mut self, force: bool) -> Self {
        self.header.force = force;
        self
    }

    /// Also delivers the event to the publishing node.
    pub fn post_publish(mut self) -> Self {
        self.header.post_publish = true;
        self
    }

    /// Routing key of the payload.
    pub fn event_type(&self) -> EventType {
        match self.payload {
            EventPayload::Configuration { .. } => EventType::Configuration,
            EventPayload::Features { .. } => EventType::Features,
            EventPayload::FeatureRepository { .. } => EventType::FeatureRepository,
            EventPayload::Bundle { .. } => EventType::Bundle,
        }
    }

    /// Encodes the event for a topic or queue.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes an event received from a topic or queue.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Action carried by a group management command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManageGroupAction {
    /// Join the named group.
    Join,
    /// Leave the named group.
    Quit,
    /// Leave every group except the default group.
    Purge,
    /// Leave every other non-default group, then join the named group.
    Set,
    /// Report groups only.
    List,
}

/// Action carried by a cluster management command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManageClusterAction {
    /// Join the named logical cluster.
    Join,
    /// Leave the named logical cluster.
    Leave,
    /// Leave every logical cluster.
    LeaveAll,
    /// Report clusters only.
    List,
}

/// Request carried by a command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Change or report group membership of the destination node.
    ManageGroup {
        /// Action to apply.
        action: ManageGroupAction,
        /// Target group for `Join`, `Quit` and `Set`.
        group: Option<String>,
    },
    /// Enable, disable or list event handlers.
    ManageHandlers {
        /// Handler to change; `None` lists every handler.
        handler: Option<String>,
        /// New state; `None` only reports.
        status: Option<SwitchStatus>,
    },
    /// Set or report the producer switch.
    ProducerSwitch {
        /// New state; `None` only reports.
        status: Option<SwitchStatus>,
    },
    /// Set or report the consumer switch.
    ConsumerSwitch {
        /// New state; `None` only reports.
        status: Option<SwitchStatus>,
    },
    /// Change or report the logical clusters joined by the destination node.
    ManageCluster {
        /// Action to apply.
        action: ManageClusterAction,
        /// Target cluster for `Join` and `Leave`.
        cluster: Option<String>,
    },
}

/// Discriminant used to route commands to handlers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandType {
    /// [`Request::ManageGroup`].
    ManageGroup,
    /// [`Request::ManageHandlers`].
    ManageHandlers,
    /// [`Request::ProducerSwitch`].
    ProducerSwitch,
    /// [`Request::ConsumerSwitch`].
    ConsumerSwitch,
    /// [`Request::ManageCluster`].
    ManageCluster,
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A request executed on one or many nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    /// Envelope.
    pub header: Header,
    /// Typed request.
    pub request: Request,
}

impl Command {
    /// Creates a command with a fresh id. Commands always bypass switches.
    pub fn new(request: Request) -> Self {
        let mut header = Header::new();
        header.force = true;
        Self { header, request }
    }

    /// Scopes the command to a group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.header.source_group = Some(group.into());
        self
    }

    /// Sets the destination nodes.
    pub fn with_destinations(mut self, destinations: HashSet<Node>) -> Self {
        self.header.destinations = Some(destinations);
        self
    }

    /// Sets a single destination node.
    pub fn with_destination(self, node: Node) -> Self {
        let mut destinations = HashSet::new();
        destinations.insert(node);
        self.with_destinations(destinations)
    }

    /// Routing key of the request.
    pub fn command_type(&self) -> CommandType {
        match self.request {
            Request::ManageGroup { .. } => CommandType::ManageGroup,
            Request::ManageHandlers { .. } => CommandType::ManageHandlers,
            Request::ProducerSwitch { .. } => CommandType::ProducerSwitch,
            Request::ConsumerSwitch { .. } => CommandType::ConsumerSwitch,
            Request::ManageCluster { .. } => CommandType::ManageCluster,
        }
    }
}

/// Typed body of a command result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// No body.
    Empty,
    /// Groups known to the answering node, by name.
    Groups(BTreeMap<String, Vec<Node>>),
    /// Event handler switches by handler name.
    Handlers(BTreeMap<String, SwitchStatus>),
    /// Switch state after the command.
    Switch(SwitchStatus),
    /// Logical clusters joined by the answering node.
    Clusters(Vec<String>),
}

impl Response {
    /// Builds a groups body from group values.
    pub fn from_groups<'a>(groups: impl IntoIterator<Item = &'a Group>) -> Self {
        Response::Groups(
            groups
                .into_iter()
                .map(|g| (g.name().to_string(), g.sorted_nodes()))
                .collect(),
        )
    }
}

/// Outcome of a command on one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Id of the command answered.
    pub id: String,
    /// Node that produced this result.
    pub source_node: Node,
    /// False when the command failed, timed out or the node was unreachable.
    pub successful: bool,
    /// Failure description.
    pub error: Option<String>,
    /// Typed body.
    pub response: Response,
}

impl CommandResult {
    /// Successful result.
    pub fn success(id: impl Into<String>, node: Node, response: Response) -> Self {
        Self {
            id: id.into(),
            source_node: node,
            successful: true,
            error: None,
            response,
        }
    }

    /// Failed result.
    pub fn failure(id: impl Into<String>, node: Node, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_node: node,
            successful: false,
            error: Some(error.into()),
            response: Response::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        Node::new(id, "127.0.0.1", 5701)
    }

    #[test]
    fn test_event_type_follows_payload() {
        let event = Event::new(EventPayload::Features {
            name: "eventadmin".to_string(),
            version: "1.0".to_string(),
            installed: true,
        });
        assert_eq!(event.event_type(), EventType::Features);
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = Event::new(EventPayload::FeatureRepository {
            url: "mvn:a".to_string(),
            installed: true,
        });
        let b = Event::new(EventPayload::FeatureRepository {
            url: "mvn:a".to_string(),
            installed: true,
        });
        assert_ne!(a.header.id, b.header.id);
    }

    #[test]
    fn test_broadcast_header_addresses_everyone() {
        let event = Event::new(EventPayload::Configuration {
            pid: "p".to_string(),
            properties: None,
            change: ConfigurationChange::Delete,
        });
        assert!(event.header.is_addressed_to(&node("any")));
    }

    #[test]
    fn test_destinations_restrict_delivery() {
        let mut set = HashSet::new();
        set.insert(node("n1"));
        let event = Event::new(EventPayload::FeatureRepository {
            url: "u".to_string(),
            installed: false,
        })
        .with_destinations(set);
        assert!(event.header.is_addressed_to(&node("n1")));
        assert!(!event.header.is_addressed_to(&node("n2")));
    }

    #[test]
    fn test_encode_decode_keeps_envelope() {
        let event = Event::new(EventPayload::Bundle {
            symbolic_name: "org.example".to_string(),
            version: "2.0.0".to_string(),
            location: "mvn:org.example/example/2.0.0".to_string(),
            status: BundleStatus::Active,
        })
        .with_group("default")
        .forced(true);

        let decoded = Event::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.id, event.header.id);
        assert_eq!(decoded.header.source_group.as_deref(), Some("default"));
        assert!(decoded.header.force);
        assert_eq!(decoded.payload, event.payload);
    }

    #[test]
    fn test_commands_are_forced() {
        let command = Command::new(Request::ProducerSwitch { status: None });
        assert!(command.header.force);
        assert_eq!(command.command_type(), CommandType::ProducerSwitch);
    }

    #[test]
    fn test_with_destination() {
        let command = Command::new(Request::ConsumerSwitch { status: None })
            .with_destination(node("n1"));
        assert_eq!(command.header.destinations.as_ref().map(|d| d.len()), Some(1));
    }

    #[test]
    fn test_failure_result() {
        let result = CommandResult::failure("c1", node("n1"), "boom");
        assert!(!result.successful);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(result.response, Response::Empty);
    }
}
