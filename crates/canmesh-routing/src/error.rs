//! Error types for the routing layer.

use thiserror::Error;

/// Errors surfaced by routing operations.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// A message payload was empty.
    #[error("empty message payload")]
    EmptyMessage,

    /// A message payload exceeded the mesh MTU.
    #[error("message payload of {0} bytes exceeds the {max} byte limit", max = crate::layer::MAX_MESSAGE_BYTES)]
    MessageTooLarge(usize),

    /// A node identifier exceeded the table field width.
    #[error("node id '{0}' is too long")]
    IdTooLong(String),

    /// Insertion would duplicate an existing destination.
    #[error("route for destination '{0}' already exists")]
    DuplicateRoute(String),

    /// The routing table is full.
    #[error("routing table full")]
    TableFull,

    /// No entry exists for the destination.
    #[error("no route for destination '{0}'")]
    RouteMissing(String),

    /// A mesh event the layer does not handle.
    #[error("unhandled mesh event {0}")]
    UnhandledEvent(u8),

    /// A worker queue is gone.
    #[error("routing queue closed")]
    QueueClosed,

    /// Persisting the routing configuration failed.
    #[error(transparent)]
    Persist(#[from] canmesh_config::ConfigError),
}

/// A specialized `Result` type for routing operations.
pub type RoutingResult<T> = std::result::Result<T, RoutingError>;
