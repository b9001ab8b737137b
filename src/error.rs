//! Error types for the fetch pipeline.

use thiserror::Error;

/// Result type alias using FetchError
pub type Result<T> = std::result::Result<T, FetchError>;

/// Errors surfaced to callers of the fetch engine.
///
/// Peer-level failures are never surfaced directly: a peer that refuses or
/// times out is skipped, and only the terminal outcome of the outermost
/// fetch reaches the caller.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Neither a peer nor the origin could produce the content.
    #[error("content not found: {0}")]
    NotFound(String),

    /// The origin returned a non-success after the retry budget ran out.
    #[error("origin fetch failed: {0}")]
    OriginFailure(String),

    /// Local disk error during a chunk write or bitmap persistence.
    /// The affected slot is degraded; persisted chunks stay readable.
    #[error("cache I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed request: negative range, empty key, missing origin, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
