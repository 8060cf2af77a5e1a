//! Error types for a3s-stream

use thiserror::Error;

/// Boxed error returned by job handlers and other pluggable callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the streaming core
#[derive(Debug, Error)]
pub enum StreamError {
    /// Broker connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure
    #[error("Failed to publish to channel '{channel}': {reason}")]
    Publish {
        channel: String,
        reason: String,
    },

    /// Subscribe failure
    #[error("Failed to subscribe to pattern '{pattern}': {reason}")]
    Subscribe {
        pattern: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A write or probe on a single connection failed
    #[error("Transport error on connection '{connection_id}': {reason}")]
    Transport {
        connection_id: String,
        reason: String,
    },

    /// No pub/sub broker is attached or it dropped its connection
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A session with this id is already streaming
    #[error("Session already active: {0}")]
    SessionAlreadyActive(String),

    /// Session, connection, or job not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable store failure (job snapshots)
    #[error("Store error: {0}")]
    Store(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The process is shutting down and no longer accepts new work
    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

/// Result type alias for streaming operations
pub type Result<T> = std::result::Result<T, StreamError>;
