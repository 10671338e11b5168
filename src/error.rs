//! Error types for shard-batcher
//!
//! This module defines the error hierarchy for the batching engine:
//! - Transport errors surfaced by the document store
//! - Configuration and lifecycle misuse errors
//! - Identifier-source errors from the iterating variant
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Errors should be actionable - include the shard or host involved
//! - A failed page fetch reaches the caller exactly once: through the
//!   failure listeners on the normal path, or from `retry` on the retry path

use thiserror::Error;

/// Top-level error type for the batching engine
#[derive(Error, Debug, Clone)]
pub enum BatcherError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport errors from the document store
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Worker pool errors
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// Operation requires a started job
    #[error("job not started - call start() first")]
    NotStarted,

    /// Configuration cannot change once the job is running
    #[error("configuration cannot be changed after the job has started")]
    AlreadyStarted,

    /// Retry target is missing from the current shard directory
    #[error("shard '{shard}' is not in the current forest configuration")]
    ShardNotInConfiguration { shard: String },

    /// Retry was handed an event that carries no shard
    #[error("failure event carries no shard and cannot be retried")]
    InvalidRetryEvent,

    /// The caller-supplied identifier sequence failed to produce an item
    #[error("identifier source error: {0}")]
    Source(String),
}

/// Errors surfaced by the transport facade
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The store has no (more) results for this shard.
    /// Raised when the previous page was exactly full and nothing remains.
    #[error("no results found on shard '{shard}'")]
    NotFound { shard: String },

    /// The shard's preferred host could not be reached
    #[error("host '{host}' unavailable: {reason}")]
    HostUnavailable { host: String, reason: String },

    /// The store rejected or failed the query
    #[error("query failed on shard '{shard}': {reason}")]
    QueryFailed { shard: String, reason: String },

    /// Protocol-level error with a store error code
    #[error("protocol error {code}: {message}")]
    Protocol { code: i32, message: String },
}

impl TransportError {
    /// Check whether this error is the terminal "nothing left" signal.
    /// A not-found response ends pagination for the shard without
    /// invoking failure listeners.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound { .. })
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid thread count
    #[error("invalid thread count {count}: must be 1 or greater")]
    InvalidThreadCount { count: usize },

    /// The shard directory listed no shards
    #[error("shard directory is empty")]
    EmptyDirectory,

    /// A shard arrived without a preferred host
    #[error("shard '{shard}' has no preferred host")]
    MissingHost { shard: String },
}

/// Worker pool errors
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    /// Failed to spawn a worker thread
    #[error("failed to spawn worker {id}: {reason}")]
    SpawnFailed { id: usize, reason: String },
}

/// Result type alias for BatcherError
pub type Result<T> = std::result::Result<T, BatcherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let not_found = TransportError::NotFound {
            shard: "docs-1".into(),
        };
        assert!(not_found.is_not_found());

        let unavailable = TransportError::HostUnavailable {
            host: "node1".into(),
            reason: "connection refused".into(),
        };
        assert!(!unavailable.is_not_found());
    }

    #[test]
    fn test_error_conversion() {
        let transport = TransportError::QueryFailed {
            shard: "docs-1".into(),
            reason: "timeout".into(),
        };
        let err: BatcherError = transport.into();
        assert!(matches!(err, BatcherError::Transport(_)));

        let config = ConfigError::InvalidThreadCount { count: 0 };
        let err: BatcherError = config.into();
        assert!(matches!(err, BatcherError::Config(_)));
    }
}
