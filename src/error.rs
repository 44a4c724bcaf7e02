//! Error types for tessera-llm.

use thiserror::Error;

/// Result type alias for tessera-llm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tessera-llm.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    #[error("out of memory blocks")]
    OutOfBlocks,

    /// Contiguous allocation failed - remaining budget too small.
    #[error("contiguous memory exhausted: requested {requested} bytes, {remaining} remaining")]
    OutOfContiguousMemory { requested: usize, remaining: usize },

    /// Block id is not currently allocated (double-free or unknown id).
    #[error("unknown block {0}")]
    UnknownBlock(u64),

    /// Memory address is not tracked by the backend.
    #[error("unknown memory address {0:#x}")]
    UnknownAddress(usize),

    /// Model name is not registered with the batch manager.
    #[error("model '{0}' not registered")]
    ModelNotFound(String),

    /// Request id is unknown or already reclaimed.
    #[error("request {0} not found")]
    RequestNotFound(u64),

    /// Input token sequence is empty.
    #[error("empty input token sequence")]
    EmptyInput,

    /// Malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine is shutting down.
    #[error("terminated")]
    Terminated,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Model execution failed.
    #[error("model execution failed: {0}")]
    Execution(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse error classification, used for logging and by callers that only
/// care about the category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: empty sequence, unknown id, double-free.
    InvalidArgument,
    /// No free blocks or contiguous budget left.
    ResourceExhausted,
    /// Unregistered model or unknown request.
    NotFound,
    /// Engine shutting down.
    Terminated,
    /// Everything else.
    Internal,
}

impl Error {
    /// Classify this error into the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfBlocks | Error::OutOfContiguousMemory { .. } => ErrorKind::ResourceExhausted,
            Error::UnknownBlock(_)
            | Error::UnknownAddress(_)
            | Error::EmptyInput
            | Error::InvalidArgument(_)
            | Error::Config(_)
            | Error::Json(_) => ErrorKind::InvalidArgument,
            Error::ModelNotFound(_) | Error::RequestNotFound(_) => ErrorKind::NotFound,
            Error::Terminated => ErrorKind::Terminated,
            Error::Execution(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }
}
