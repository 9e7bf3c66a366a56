//! Error taxonomy for the embedding daemon.
//!
//! Every public boundary returns `Result<T, EmbedError>`. The variant family
//! a given error belongs to ([`EmbedError::kind`]) drives the wire-level
//! policy directly: transient-resource errors spill to overflow when
//! possible, retryable-operational errors are retried locally before they
//! ever reach here, client-caused errors are reported and the connection is
//! closed, fatal errors abort startup, and connection-level errors are
//! swallowed by the caller without reaching a `stats` counter at all.

use thiserror::Error;

/// Coarse error family, matching the propagation policy each kind gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientResource,
    RetryableOperational,
    ClientCaused,
    Fatal,
    ConnectionLevel,
}

#[derive(Error, Debug)]
pub enum EmbedError {
    // --- transient resource ---
    #[error("CPU above reject threshold and overflow disabled")]
    Overloaded,

    #[error("in-memory queue saturated and overflow disabled")]
    QueueSaturated,

    // --- retryable operational ---
    #[error("encoder load failed: {0}")]
    EncoderLoad(String),

    #[error("encoder inference failed: {0}")]
    EncoderInference(String),

    #[error("cache write failed: {0}")]
    CacheWrite(String),

    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    // --- client-caused ---
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("dims must be a positive integer, got {0}")]
    InvalidDims(i64),

    // --- fatal ---
    #[error("failed to bind socket at {path}: {source}")]
    SocketBind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create cache directory {path}: {source}")]
    CacheDirCreate {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("model artifact missing: {0}")]
    ModelArtifactMissing(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    // --- connection-level ---
    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("read/write timeout")]
    Timeout,

    // --- encoding ---
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("projection (de)serialization error: {0}")]
    Encode(String),

    #[error("{0}")]
    Other(String),
}

impl EmbedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmbedError::Overloaded | EmbedError::QueueSaturated => ErrorKind::TransientResource,
            EmbedError::EncoderLoad(_)
            | EmbedError::EncoderInference(_)
            | EmbedError::CacheWrite(_)
            | EmbedError::Io(_)
            | EmbedError::Database(_)
            | EmbedError::Encode(_) => ErrorKind::RetryableOperational,
            EmbedError::MalformedRequest(_)
            | EmbedError::UnknownRequestType(_)
            | EmbedError::InvalidDims(_)
            | EmbedError::Json(_) => ErrorKind::ClientCaused,
            EmbedError::SocketBind { .. }
            | EmbedError::CacheDirCreate { .. }
            | EmbedError::ModelArtifactMissing(_)
            | EmbedError::Configuration(_) => ErrorKind::Fatal,
            EmbedError::ConnectionReset | EmbedError::Timeout => ErrorKind::ConnectionLevel,
            EmbedError::Other(_) => ErrorKind::RetryableOperational,
        }
    }

    /// Whether the scheduler should retry an operation that failed with
    /// this error (FIFO+ACK mode NACKs on `true`).
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::RetryableOperational | ErrorKind::TransientResource)
    }
}

pub type Result<T> = std::result::Result<T, EmbedError>;
