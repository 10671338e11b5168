//! Batch values handed to listeners
//!
//! A [`QueryBatch`] is the immutable per-invocation snapshot a listener
//! receives: the identifiers of one page plus enough bookkeeping (batch
//! numbers, results-so-far, shard, transport handle, timestamps, job
//! ticket) to process or retry it without touching engine internals.
//!
//! Batches are assembled through [`QueryBatchBuilder`] on the hot path and
//! frozen by `build`; nothing mutates a batch after that.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::BatcherError;
use crate::shard::Shard;
use crate::transport::Transport;

/// Opaque identifier for one job run, fixed at start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTicket {
    id: String,
}

impl JobTicket {
    /// Create a ticket with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Ticket id
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// One batch of identifiers as delivered to listeners
#[derive(Clone)]
pub struct QueryBatch {
    items: Vec<String>,
    job_batch_number: u64,
    shard_batch_number: u64,
    job_results_so_far: u64,
    shard_results_so_far: u64,
    shard: Option<Shard>,
    client: Option<Arc<dyn Transport>>,
    server_timestamp: Option<u64>,
    timestamp: DateTime<Utc>,
    job_ticket: Option<JobTicket>,
}

impl QueryBatch {
    /// Start building a batch
    pub fn builder() -> QueryBatchBuilder {
        QueryBatchBuilder::default()
    }

    /// Identifiers in this batch (possibly empty)
    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// Job-wide batch number
    pub fn job_batch_number(&self) -> u64 {
        self.job_batch_number
    }

    /// Batch number within the originating shard (0 for iterating jobs)
    pub fn shard_batch_number(&self) -> u64 {
        self.shard_batch_number
    }

    /// Results delivered job-wide up to and including this batch
    pub fn job_results_so_far(&self) -> u64 {
        self.job_results_so_far
    }

    /// Results delivered from this shard up to and including this batch
    pub fn shard_results_so_far(&self) -> u64 {
        self.shard_results_so_far
    }

    /// Shard this batch came from (absent for iterating jobs)
    pub fn shard(&self) -> Option<&Shard> {
        self.shard.as_ref()
    }

    /// Transport handle for the host this batch was fetched from
    pub fn client(&self) -> Option<&Arc<dyn Transport>> {
        self.client.as_ref()
    }

    /// Pinned server timestamp, set in consistent-snapshot mode
    pub fn server_timestamp(&self) -> Option<u64> {
        self.server_timestamp
    }

    /// Wall-clock time the page fetch began
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Ticket of the job this batch belongs to
    pub fn job_ticket(&self) -> Option<&JobTicket> {
        self.job_ticket.as_ref()
    }
}

impl fmt::Debug for QueryBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBatch")
            .field("items", &self.items.len())
            .field("job_batch_number", &self.job_batch_number)
            .field("shard_batch_number", &self.shard_batch_number)
            .field("job_results_so_far", &self.job_results_so_far)
            .field("shard_results_so_far", &self.shard_results_so_far)
            .field("shard", &self.shard.as_ref().map(Shard::name))
            .field("host", &self.client.as_ref().map(|c| c.host().to_string()))
            .field("server_timestamp", &self.server_timestamp)
            .finish()
    }
}

/// Builder for [`QueryBatch`]
#[derive(Default)]
pub struct QueryBatchBuilder {
    items: Vec<String>,
    job_batch_number: u64,
    shard_batch_number: u64,
    job_results_so_far: u64,
    shard_results_so_far: u64,
    shard: Option<Shard>,
    client: Option<Arc<dyn Transport>>,
    server_timestamp: Option<u64>,
    timestamp: Option<DateTime<Utc>>,
    job_ticket: Option<JobTicket>,
}

impl QueryBatchBuilder {
    /// Set the identifier list
    pub fn items(mut self, items: Vec<String>) -> Self {
        self.items = items;
        self
    }

    /// Set the job-wide batch number
    pub fn job_batch_number(mut self, n: u64) -> Self {
        self.job_batch_number = n;
        self
    }

    /// Set the per-shard batch number
    pub fn shard_batch_number(mut self, n: u64) -> Self {
        self.shard_batch_number = n;
        self
    }

    /// Set job-wide results-so-far
    pub fn job_results_so_far(mut self, n: u64) -> Self {
        self.job_results_so_far = n;
        self
    }

    /// Set per-shard results-so-far
    pub fn shard_results_so_far(mut self, n: u64) -> Self {
        self.shard_results_so_far = n;
        self
    }

    /// Set the originating shard
    pub fn shard(mut self, shard: Shard) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Attach the transport handle the page was fetched with
    pub fn client(mut self, client: Arc<dyn Transport>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the pinned server timestamp
    pub fn server_timestamp(mut self, timestamp: Option<u64>) -> Self {
        self.server_timestamp = timestamp;
        self
    }

    /// Set the wall-clock timestamp
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach the job ticket
    pub fn job_ticket(mut self, ticket: Option<JobTicket>) -> Self {
        self.job_ticket = ticket;
        self
    }

    /// Freeze into an immutable batch
    pub fn build(self) -> QueryBatch {
        QueryBatch {
            items: self.items,
            job_batch_number: self.job_batch_number,
            shard_batch_number: self.shard_batch_number,
            job_results_so_far: self.job_results_so_far,
            shard_results_so_far: self.shard_results_so_far,
            shard: self.shard,
            client: self.client,
            server_timestamp: self.server_timestamp,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            job_ticket: self.job_ticket,
        }
    }
}

/// A failed page fetch as delivered to failure listeners.
///
/// Carries the batch as it stood when the fetch failed (empty item list,
/// counters read at failure time) and the underlying cause. The event is
/// everything `retry` needs to re-enter the pipeline at the failed offset.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    batch: QueryBatch,
    cause: BatcherError,
}

impl FailureEvent {
    pub(crate) fn new(batch: QueryBatch, cause: BatcherError) -> Self {
        Self { batch, cause }
    }

    /// The batch at the time of failure
    pub fn batch(&self) -> &QueryBatch {
        &self.batch
    }

    /// Underlying cause of the failure
    pub fn cause(&self) -> &BatcherError {
        &self.cause
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let batch = QueryBatch::builder().build();
        assert!(batch.items().is_empty());
        assert_eq!(batch.job_batch_number(), 0);
        assert!(batch.shard().is_none());
        assert!(batch.server_timestamp().is_none());
        assert!(batch.job_ticket().is_none());
    }

    #[test]
    fn test_builder_roundtrip() {
        let shard = Shard::new(3, "docs-3", "node2", "docs");
        let batch = QueryBatch::builder()
            .items(vec!["a".into(), "b".into()])
            .job_batch_number(5)
            .shard_batch_number(2)
            .job_results_so_far(12)
            .shard_results_so_far(4)
            .shard(shard.clone())
            .server_timestamp(Some(100))
            .job_ticket(Some(JobTicket::new("job-1")))
            .build();

        assert_eq!(batch.items(), ["a", "b"]);
        assert_eq!(batch.job_batch_number(), 5);
        assert_eq!(batch.shard_batch_number(), 2);
        assert_eq!(batch.job_results_so_far(), 12);
        assert_eq!(batch.shard_results_so_far(), 4);
        assert_eq!(batch.shard(), Some(&shard));
        assert_eq!(batch.server_timestamp(), Some(100));
        assert_eq!(batch.job_ticket().map(JobTicket::id), Some("job-1"));
    }
}
