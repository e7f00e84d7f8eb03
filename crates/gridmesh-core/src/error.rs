//! Error types shared across gridmesh crates.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while encoding/decoding workloads or loading config.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to encode workload {workload}: {message}")]
    Encode { workload: String, message: String },

    #[error("failed to decode workload {workload}: {message}")]
    Decode { workload: String, message: String },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by external clients (node RPC, chain, discovery).
///
/// The transports themselves live outside this workspace; they map their
/// failures onto these variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}
