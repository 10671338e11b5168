//! Transport facade for the document store
//!
//! The engine talks to the store through exactly one operation: "list the
//! identifiers matching query Q on shard F, starting at offset S, up to N
//! results, optionally pinned to server timestamp T". Everything else
//! (wire format, authentication, connection pooling) lives behind the
//! [`Transport`] trait.
//!
//! Clients are per-host. The engine resolves a client from a shard's
//! *current* preferred host through [`ClientFactory`] on every page fetch,
//! so directory updates redirect in-flight pagination without touching
//! queued work.

use std::sync::Arc;

use crate::error::TransportError;

/// A query against the document store, opaque to the engine
#[derive(Debug, Clone)]
pub struct Query {
    text: String,
}

impl Query {
    /// Create a query from its serialized text
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Serialized query text
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// One page of matching identifiers from one shard
#[derive(Debug, Clone)]
pub struct UrisPage {
    /// Matching identifiers, in shard order
    pub uris: Vec<String>,

    /// Server timestamp the page was read at (positive)
    pub server_timestamp: u64,
}

/// Per-host client for the store's identifier-listing endpoint
pub trait Transport: Send + Sync {
    /// Host this client talks to
    fn host(&self) -> &str;

    /// Fetch one page of identifiers matching `query` on `shard_name`,
    /// starting at 1-based offset `start`, at most `page_length` results.
    /// When `timestamp` is set the read is pinned to that server timestamp.
    fn uris(
        &self,
        query: &Query,
        shard_name: &str,
        start: u64,
        page_length: u64,
        timestamp: Option<u64>,
    ) -> Result<UrisPage, TransportError>;
}

/// Produces the client for a given host.
///
/// Called each time a task resolves a shard's current preferred host and
/// when the round-robin client list is rebuilt after a directory update;
/// implementations are expected to cache per-host clients internally.
pub trait ClientFactory: Send + Sync {
    /// Client for `host`
    fn client_for_host(&self, host: &str) -> Arc<dyn Transport>;
}
