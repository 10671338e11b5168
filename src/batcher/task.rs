//! Page-fetch tasks
//!
//! One [`PageTask`] fetches one page of identifiers from one shard. In-shard
//! ordering needs no locking because the successor task is only created at
//! the tail of the current task's success path: each shard has at most one
//! page fetch in flight at any time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, trace, warn};

use crate::batch::{FailureEvent, QueryBatch};
use crate::error::Result;
use crate::shard::Shard;

use super::engine::BatcherCore;
use super::iterating::{self, DispatchTask};

/// A unit of work for the pool
pub(crate) enum QueryJob {
    /// Fetch one page from one shard
    Page(PageTask),

    /// Pump the caller-supplied identifier sequence (iterating jobs)
    Drive,

    /// Deliver one frozen identifier batch (iterating jobs)
    Dispatch(DispatchTask),
}

/// Run one pool job, logging errors that have nowhere else to go
pub(crate) fn run_job(core: &Arc<BatcherCore>, job: QueryJob) {
    match job {
        QueryJob::Page(task) => {
            // only the retry path returns an error, and retries never go
            // through the pool; anything surfacing here is logged
            if let Err(e) = task.run(core) {
                error!(error = %e, "page fetch task failed");
            }
        }
        QueryJob::Drive => iterating::drive(core),
        QueryJob::Dispatch(task) => task.run(core),
    }
}

/// Fetch one page from one shard, starting at one offset
pub(crate) struct PageTask {
    /// Target shard; the preferred host is re-resolved at run time
    pub shard: Shard,

    /// 1-based starting offset
    pub start: u64,

    /// Batch number within the shard
    pub shard_batch_number: u64,

    /// Job batch number to reuse instead of drawing a fresh one (retries)
    pub retry_batch_number: Option<u64>,

    /// Whether a fetch error goes to the failure listeners (normal path)
    /// or back to the caller (retry path)
    pub call_failure_listeners: bool,
}

impl PageTask {
    /// The seed task for a shard: offset 1, batch 1
    pub(crate) fn first_page(shard: Shard) -> Self {
        Self {
            shard,
            start: 1,
            shard_batch_number: 1,
            retry_batch_number: None,
            call_failure_listeners: true,
        }
    }

    /// Execute the page fetch protocol
    pub(crate) fn run(&self, core: &Arc<BatcherCore>) -> Result<()> {
        let Some((is_done, shard_results)) = core.shard_flags(self.shard.id()) else {
            error!(
                shard = %self.shard.name(),
                "no pagination state for shard - dropping task"
            );
            return Ok(());
        };
        if is_done.load(Ordering::SeqCst) {
            error!(
                shard = %self.shard.name(),
                shard_batch = self.shard_batch_number,
                start = self.start,
                "attempt to query shard after its last batch was already retrieved"
            );
            return Ok(());
        }
        if core.stop_requested() {
            warn!(
                shard = %self.shard.name(),
                shard_batch = self.shard_batch_number,
                start = self.start,
                "cancelling page fetch - the job is stopped"
            );
            return Ok(());
        }

        // the directory may have moved this shard to another host since
        // the task was queued
        let shard = core
            .current_shard(self.shard.id())
            .unwrap_or_else(|| self.shard.clone());
        let client = core.client_for(&shard);
        let page_size = core.page_size();
        let job_batch_number = match self.retry_batch_number {
            Some(n) => n,
            None => core.next_job_batch_number(),
        };
        let builder = QueryBatch::builder()
            .client(Arc::clone(&client))
            .timestamp(Utc::now())
            .job_ticket(core.job_ticket())
            .shard(shard.clone())
            .shard_batch_number(self.shard_batch_number)
            .job_batch_number(job_batch_number);

        let snapshot = core.snapshot_enabled();
        let pinned = if snapshot { core.snapshot_timestamp() } else { None };
        let query = match core.query() {
            Some(query) => query,
            None => {
                error!(shard = %shard.name(), "page fetch without a query - dropping task");
                return Ok(());
            }
        };

        match client.uris(query, shard.name(), self.start, page_size, pinned) {
            Ok(page) => {
                if snapshot && core.snapshot_timestamp().is_none() {
                    core.pin_snapshot(page.server_timestamp);
                }
                let uris = page.uris;
                if uris.len() as u64 == page_size {
                    // a full page - there may be more
                    self.launch_next(core, &is_done, &shard, page_size);
                } else {
                    // a partial page is always the last
                    is_done.store(true, Ordering::SeqCst);
                    core.shutdown_if_all_shards_done();
                }
                let count = uris.len() as u64;
                let batch = builder
                    .server_timestamp(core.snapshot_timestamp())
                    .job_results_so_far(core.add_job_results(count))
                    .shard_results_so_far(shard_results.fetch_add(count, Ordering::SeqCst) + count)
                    .items(uris)
                    .build();
                trace!(
                    size = count,
                    job_batch = batch.job_batch_number(),
                    job_results = batch.job_results_so_far(),
                    shard = %shard.name(),
                    "delivering batch"
                );
                core.notify_success(&batch);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                // the previous page was exactly full and nothing remains
                is_done.store(true, Ordering::SeqCst);
                core.shutdown_if_all_shards_done();
                Ok(())
            }
            Err(e) => {
                // any fetch error halts pagination for this shard until a
                // listener retries it
                is_done.store(true, Ordering::SeqCst);
                if self.call_failure_listeners {
                    let batch = builder
                        .server_timestamp(core.snapshot_timestamp())
                        .job_results_so_far(core.job_results_so_far())
                        .shard_results_so_far(shard_results.load(Ordering::SeqCst))
                        .items(Vec::new())
                        .build();
                    core.notify_failure(&FailureEvent::new(batch, e.into()));
                    core.shutdown_if_all_shards_done();
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Enqueue the fetch for the next page of this shard
    fn launch_next(
        &self,
        core: &Arc<BatcherCore>,
        is_done: &Arc<AtomicBool>,
        shard: &Shard,
        page_size: u64,
    ) {
        if core.stop_requested() {
            return;
        }
        if is_done.load(Ordering::SeqCst) {
            return;
        }
        core.submit(QueryJob::Page(PageTask {
            shard: shard.clone(),
            start: self.start + page_size,
            shard_batch_number: self.shard_batch_number + 1,
            retry_batch_number: None,
            call_failure_listeners: true,
        }));
    }
}
