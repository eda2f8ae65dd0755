//! Error types for the cellar core.

use thiserror::Error;

/// Errors that can occur in the cellar core.
#[derive(Debug, Error)]
pub enum CellarError {
    /// The named cluster group does not exist.
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// The default group cannot be deleted or left.
    #[error("operation '{op}' refused on the default group")]
    DefaultGroupProtected {
        /// The refused operation.
        op: String,
    },

    /// No cluster member has the given id or name.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// The default logical cluster cannot be left.
    #[error("the default cluster cannot be left")]
    DefaultClusterProtected,

    /// The local process has not joined the named cluster.
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// A target node did not accept the submitted command.
    #[error("node {node} is unreachable")]
    NodeUnreachable {
        /// Id of the unreachable node.
        node: String,
    },

    /// A remote execution did not complete in time.
    #[error("command {command_id} timed out on node {node} after {timeout_ms}ms")]
    Timeout {
        /// Id of the command.
        command_id: String,
        /// Id of the node that did not answer.
        node: String,
        /// Timeout applied.
        timeout_ms: u64,
    },

    /// No handler is registered for the message type.
    #[error("no handler registered for {0}")]
    NoHandler(String),

    /// A handler failed while applying a message.
    #[error("handler error: {0}")]
    Handler(String),

    /// A synchronizer failed during pull or push.
    #[error("synchronizer {synchronizer} failed: {msg}")]
    Sync {
        /// Name of the synchronizer.
        synchronizer: String,
        /// Failure description.
        msg: String,
    },

    /// The substrate rejected an operation.
    #[error("substrate error: {0}")]
    Substrate(String),

    /// Configuration could not be read or written.
    #[error("configuration error: {0}")]
    Config(String),

    /// A whitelist or blacklist pattern is not valid.
    #[error("invalid pattern")]
    Pattern(#[from] regex::Error),

    /// Binary encoding of a message or map value failed.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// JSON encoding of persisted configuration failed.
    #[error("json error")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for the cellar core.
pub type Result<T> = std::result::Result<T, CellarError>;
