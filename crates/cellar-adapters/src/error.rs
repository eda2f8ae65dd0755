//! Error types for the domain adapters.

use cellar_core::CellarError;
use thiserror::Error;

/// Errors raised by adapters and the local services they drive.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// A core operation failed.
    #[error(transparent)]
    Core(#[from] CellarError),

    /// The local service does not know the resource.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The resource is denied by the group's policy.
    #[error("{resource} is blocked {direction} for group {group}")]
    Blocked {
        /// Resource id.
        resource: String,
        /// Group whose policy denied it.
        group: String,
        /// `inbound` or `outbound`.
        direction: String,
    },

    /// The local event producer is switched off.
    #[error("cluster event producer is OFF")]
    ProducerOff,

    /// The local service rejected the operation.
    #[error("service error: {0}")]
    Service(String),
}

/// Result alias for the adapters.
pub type Result<T> = std::result::Result<T, AdapterError>;

impl From<AdapterError> for CellarError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Core(e) => e,
            other => CellarError::Handler(other.to_string()),
        }
    }
}
