//! The batching engine
//!
//! This module implements the two job variants over a shared worker pool:
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────────┐
//!                  │        QueryBatcher          │
//!                  │  - config surface (pre-start)│
//!                  │  - start / stop / retry      │
//!                  │  - directory update deltas   │
//!                  └──────────────┬───────────────┘
//!                                 │ seeds one page task per shard
//!                                 ▼
//!                  ┌──────────────────────────────┐
//!                  │        WorkerPool            │
//!                  │  (crossbeam bounded queue,   │
//!                  │   caller-runs backpressure)  │
//!                  └──────┬───────────────┬───────┘
//!                         │               │
//!                   ┌─────▼─────┐   ┌─────▼─────┐
//!                   │ PageTask  │   │ PageTask  │   one in flight per shard;
//!                   │ shard F1  │   │ shard F2  │   each task enqueues its
//!                   └─────┬─────┘   └─────┬─────┘   own successor
//!                         │               │
//!                         ▼               ▼
//!                  success / failure listeners
//! ```
//!
//! The iterating variant replaces the per-shard page tasks with one driver
//! task that buffers a caller-supplied identifier sequence into page-sized
//! batches and round-robins them across hosts (see [`iterating`]).

mod engine;
mod iterating;
mod task;

pub use engine::{QueryBatcher, SourceError};
