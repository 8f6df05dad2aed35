//! Error types for checkpoint operations

use crate::stub::FunctionStub;
use crate::value::Handle;
use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur while capturing, storing or resuming a checkpoint
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The checkpoint bytes are malformed (bad header, truncated payload,
    /// trailing garbage, size limit exceeded)
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// A stub in the checkpoint could not be reattached to a live object
    #[error("Unresolved stub {stub}: {reason}")]
    UnresolvedStub { stub: String, reason: String },

    /// A function stub names a position no loaded script occupies
    #[error("Function {0} not found")]
    UnresolvedFunction(FunctionStub),

    /// A function on the checkpoint's stack has been modified since the
    /// checkpoint was taken
    #[error("The function {function} in script {source_name} has changed")]
    FingerprintMismatch {
        function: String,
        source_name: String,
    },

    /// The current stack depth differs from the one recorded in the checkpoint
    #[error("Stack depth changed: checkpoint has {expected} frames, current stack has {actual}")]
    FrameCountMismatch { expected: usize, actual: usize },

    /// A named component no longer exists
    #[error("No component with name [{0}] found")]
    BrokenReference(String),

    /// A reference to an object that is neither a named component, a tracked
    /// function, nor known to a stub provider
    #[error("Reference to {0} cannot be stubbed")]
    Unstubbable(Handle),

    /// The object graph nests lists and objects deeper than a checkpoint
    /// may hold
    #[error("Object graph nests deeper than {0} levels")]
    NestingTooDeep(usize),

    /// The serialized checkpoint is larger than the configured limit
    #[error("Checkpoint of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    /// An integrity transform rejected the data
    #[error("Integrity check failed")]
    IntegrityViolation,

    /// A content-derived key collided with an existing entry and the store
    /// is configured to reject collisions
    #[error("Duplicate checkpoint key: {0}")]
    DuplicateKey(String),

    /// A byte transform failed
    #[error("Transform error: {0}")]
    Transform(String),

    /// The engine collaborator failed
    #[error("Engine error: {0}")]
    Engine(String),

    /// A script could not be loaded or compiled
    #[error("Script {path}: {message}")]
    Script { path: String, message: String },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable store error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Whether the error means the stored checkpoint itself is unusable
    /// (tampered, stale or damaged), as opposed to a missing checkpoint or a
    /// fault in the server.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            CheckpointError::CorruptCheckpoint(_)
                | CheckpointError::UnresolvedStub { .. }
                | CheckpointError::UnresolvedFunction(_)
                | CheckpointError::FingerprintMismatch { .. }
                | CheckpointError::FrameCountMismatch { .. }
                | CheckpointError::BrokenReference(_)
                | CheckpointError::IntegrityViolation
        )
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        CheckpointError::CorruptCheckpoint(message.into())
    }

    /// Transform failures while decoding are a property of the stored bytes
    pub(crate) fn into_decode_failure(self) -> Self {
        match self {
            CheckpointError::Transform(message) => CheckpointError::CorruptCheckpoint(message),
            other => other,
        }
    }

    pub(crate) fn unresolved(stub: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        CheckpointError::UnresolvedStub {
            stub: stub.to_string(),
            reason: reason.into(),
        }
    }
}
