//! Error types for the jamcore runtime
//!
//! Each subsystem has its own `thiserror` enum and result alias. Semantic
//! rejections reported by remote peers (negative condition, parameter error,
//! partial failure) are activity states, not errors.

use thiserror::Error;

use super::activity::ActivityId;
use super::condition::Tier;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Activity table errors
    #[error("Activity error: {0}")]
    Activity(#[from] ActivityError),

    /// Command construction or decoding errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Run table errors
    #[error("Run table error: {0}")]
    RunTable(#[from] RunTableError),

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Initialization errors
    #[error("Initialization failed: {0}")]
    Init(String),
}

/// Activity table and lifecycle errors
#[derive(Debug, Error)]
pub enum ActivityError {
    /// No template registered under this name
    #[error("Activity '{0}' is not registered")]
    NotFound(String),

    /// A template with this name already exists
    #[error("Activity '{0}' is already registered")]
    AlreadyRegistered(String),

    /// All activity slots are in use
    #[error("Activity table full ({capacity} slots)")]
    CapacityExceeded {
        /// Fixed table capacity
        capacity: usize,
    },

    /// A live instance already uses this id
    #[error("Activity instance {0} is already live")]
    DuplicateInstance(ActivityId),

    /// Arguments do not match the registered signature
    #[error("Invalid parameters for '{name}': {detail}")]
    ParameterError {
        /// Activity name
        name: String,
        /// What did not match
        detail: String,
    },
}

/// Convenience result alias for activity operations
pub type ActivityResult<T> = std::result::Result<T, ActivityError>;

/// Command protocol errors
#[derive(Debug, Error)]
pub enum CommandError {
    /// Payload could not be decoded
    #[error("Malformed command: {0}")]
    Malformed(String),

    /// Kind string is not part of the protocol
    #[error("Unknown command kind '{0}'")]
    UnknownKind(String),

    /// Signature contains an unsupported type tag
    #[error("Invalid signature '{signature}': unknown tag '{tag}'")]
    InvalidSignature {
        /// Full signature text
        signature: String,
        /// Offending character
        tag: char,
    },

    /// Argument list does not match a signature
    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    /// Encoding failed
    #[error("Command encoding failed: {0}")]
    Encoding(String),
}

/// Convenience result alias for command operations
pub type CommandResult<T> = std::result::Result<T, CommandError>;

/// Queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// Ring is at capacity
    #[error("Queue full ({capacity} slots)")]
    Full {
        /// Ring capacity
        capacity: usize,
    },

    /// Queue was closed by its owner
    #[error("Queue closed")]
    Closed,
}

/// Convenience result alias for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Run table errors
#[derive(Debug, Error)]
pub enum RunTableError {
    /// An entry for this activity already exists
    #[error("Run table already tracks activity {0}")]
    DuplicateEntry(ActivityId),
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// No link to the requested tier
    #[error("Tier {0} is not reachable")]
    Unreachable(Tier),

    /// The receiving side has gone away
    #[error("Transport closed: {0}")]
    Closed(String),
}

/// Convenience result alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
