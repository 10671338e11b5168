//! shard-batcher - Parallel Query Batcher for Sharded Document Stores
//!
//! A client-side engine that drives a large document-query workload
//! against a forest-sharded document store: it fans page fetches across
//! the shards, streams matching identifiers back through user-supplied
//! listeners in fixed-size batches, and adapts online to cluster topology
//! changes (hosts going offline, shards appearing, failed batches being
//! retried).
//!
//! # Features
//!
//! - **Parallel pagination**: one page fetch per shard in flight at a
//!   time, shards fetched concurrently up to the thread count, in-shard
//!   delivery in ascending offset order.
//!
//! - **Bounded memory**: a fixed worker pool over a bounded queue with
//!   caller-runs backpressure keeps task production in check.
//!
//! - **Consistent snapshots**: optionally pin every page of every shard
//!   to the server timestamp of the first page, for a point-in-time view.
//!
//! - **Live reconfiguration**: push a new shard directory mid-job; work
//!   for vanished shards is quarantined and resumes, at its original
//!   offset, when the shard returns.
//!
//! - **Listener-driven retry**: a failure listener can re-issue the exact
//!   failed page (same offset, same job batch number) on its own thread.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Document store cluster                       │
//! │        shard F1 @ host A    shard F2 @ host B    ...             │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ uris(query, shard, start, n, ts?)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Worker Threads                            │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐         ┌─────────┐     │
//! │  │Worker 1 │  │Worker 2 │  │Worker 3 │  ...    │Worker N │     │
//! │  └────┬────┘  └────┬────┘  └────┬────┘         └────┬────┘     │
//! │       │            │            │                    │          │
//! │       └────────────┴─────┬──────┴────────────────────┘          │
//! │                          ▼                                      │
//! │            ┌──────────────────────────┐                         │
//! │            │       Task Queue         │  each page task queues   │
//! │            │   (crossbeam bounded,    │  its shard's next page   │
//! │            │  caller-runs overflow)   │  at the tail of its own  │
//! │            └──────────────────────────┘  success path            │
//! │                          │                                      │
//! │                          ▼                                      │
//! │            ┌──────────────────────────┐                         │
//! │            │   Batch / failure        │                         │
//! │            │   listeners (in order)   │                         │
//! │            └──────────────────────────┘                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shard_batcher::{ClientFactory, JobTicket, Query, QueryBatcher, Shard};
//!
//! # fn factory() -> Arc<dyn ClientFactory> { unimplemented!() }
//! let directory = vec![
//!     Shard::new(1, "docs-1", "node1.cluster", "docs"),
//!     Shard::new(2, "docs-2", "node2.cluster", "docs"),
//! ];
//!
//! let batcher = QueryBatcher::for_query(
//!     Query::new("category:report"),
//!     factory(),
//!     &directory,
//! ).unwrap();
//! batcher
//!     .with_page_size(500).unwrap()
//!     .with_consistent_snapshot().unwrap()
//!     .on_batch(|batch: &shard_batcher::QueryBatch| {
//!         for uri in batch.items() {
//!             println!("{}", uri);
//!         }
//!     }).unwrap();
//!
//! batcher.start(JobTicket::new("report-sweep")).unwrap();
//! batcher.await_completion().unwrap();
//! ```

pub mod batch;
pub mod batcher;
pub mod error;
pub mod listener;
pub mod pool;
pub mod shard;
pub mod transport;

pub use batch::{FailureEvent, JobTicket, QueryBatch, QueryBatchBuilder};
pub use batcher::{QueryBatcher, SourceError};
pub use error::{BatcherError, ConfigError, PoolError, Result, TransportError};
pub use listener::{BatchListener, FailureListener};
pub use shard::{preferred_hosts, Shard, ShardDirectory};
pub use transport::{ClientFactory, Query, Transport, UrisPage};
