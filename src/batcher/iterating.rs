//! Identifier-sequence driver
//!
//! The alternate input mode: instead of querying the store, the caller
//! hands over a lazy identifier sequence. One long-lived driver task pumps
//! it, buffering identifiers until the buffer reaches the page size or the
//! sequence is exhausted, then freezes the buffer into an immutable batch
//! and queues a dispatch task for it. Dispatch assigns the job batch
//! number and picks a transport client round-robin by
//! `batch_number mod host_count`, spreading listener work (which talks to
//! the store through `QueryBatch::client`) across the cluster.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{trace, warn};

use crate::batch::{FailureEvent, QueryBatch};
use crate::error::BatcherError;

use super::engine::{panic_message, BatcherCore, IdSource};
use super::task::QueryJob;

/// Deliver one frozen identifier batch to the success listeners
pub(crate) struct DispatchTask {
    /// The frozen buffer
    pub uris: Vec<String>,

    /// Job batch counter, shared across this job's dispatch tasks
    pub batch_counter: Arc<AtomicU64>,

    /// Job results counter, shared across this job's dispatch tasks
    pub results_counter: Arc<AtomicU64>,
}

impl DispatchTask {
    pub(crate) fn run(&self, core: &Arc<BatcherCore>) {
        let batch_number = self.batch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let clients = core.clients_snapshot();
        if clients.is_empty() {
            warn!(job_batch = batch_number, "no hosts configured - dropping batch");
            return;
        }
        // round-robin from client 0 to (host count - 1)
        let index = (batch_number % clients.len() as u64) as usize;
        let client = Arc::clone(&clients[index]);
        let count = self.uris.len() as u64;
        let batch = QueryBatch::builder()
            .client(client)
            .timestamp(Utc::now())
            .job_ticket(core.job_ticket())
            .job_batch_number(batch_number)
            .job_results_so_far(self.results_counter.fetch_add(count, Ordering::SeqCst) + count)
            .items(self.uris.clone())
            .build();
        trace!(
            size = count,
            job_batch = batch_number,
            "dispatching identifier batch"
        );
        core.notify_success(&batch);
    }
}

/// The driver task: pump the sequence until it is drained, then shut the
/// pool down. A panic from the sequence is the fatal path: reported once
/// to the failure listeners, then the job winds down.
pub(crate) fn drive(core: &Arc<BatcherCore>) {
    let Some(source) = core.take_source() else {
        warn!("identifier source already consumed - ignoring duplicate driver");
        return;
    };
    let batch_counter = Arc::new(AtomicU64::new(0));
    let results_counter = Arc::new(AtomicU64::new(0));

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        pump(core, source, &batch_counter, &results_counter)
    }));
    match outcome {
        Ok(true) => core.mark_source_drained(),
        Ok(false) => {}
        Err(payload) => {
            let message = panic_message(payload.as_ref()).to_string();
            warn!(panic = %message, "identifier source panicked while iterating");
            report_source_failure(core, BatcherError::Source(message));
        }
    }
    if let Some(pool) = core.pool_handle() {
        pool.shutdown();
    }
}

/// Returns true when the sequence was fully drained, false on early exit
fn pump(
    core: &Arc<BatcherCore>,
    source: IdSource,
    batch_counter: &Arc<AtomicU64>,
    results_counter: &Arc<AtomicU64>,
) -> bool {
    let page_size = core.page_size().max(1) as usize;
    let mut source = source.peekable();
    let mut buffer: Vec<String> = Vec::with_capacity(page_size);

    while let Some(item) = source.next() {
        if core.stop_requested() {
            return false;
        }
        match item {
            Ok(uri) => buffer.push(uri),
            Err(e) => {
                // a bad pull is non-fatal: report it and keep iterating
                warn!(error = %e, "error pulling from identifier source");
                report_source_failure(core, BatcherError::Source(e.to_string()));
                continue;
            }
        }
        if buffer.len() == page_size || source.peek().is_none() {
            freeze(core, &mut buffer, page_size, batch_counter, results_counter);
        }
    }
    // a trailing partial buffer still ships, even when the last pull errored
    if !buffer.is_empty() {
        freeze(core, &mut buffer, page_size, batch_counter, results_counter);
    }
    true
}

/// Swap the buffer out and queue a dispatch task for it
fn freeze(
    core: &Arc<BatcherCore>,
    buffer: &mut Vec<String>,
    page_size: usize,
    batch_counter: &Arc<AtomicU64>,
    results_counter: &Arc<AtomicU64>,
) {
    let uris = std::mem::replace(buffer, Vec::with_capacity(page_size));
    core.submit(QueryJob::Dispatch(DispatchTask {
        uris,
        batch_counter: Arc::clone(batch_counter),
        results_counter: Arc::clone(results_counter),
    }));
}

/// Report a sequence error through the failure listeners with an
/// empty-item batch
fn report_source_failure(core: &Arc<BatcherCore>, cause: BatcherError) {
    let clients = core.clients_snapshot();
    let mut builder = QueryBatch::builder()
        .items(Vec::new())
        .timestamp(Utc::now())
        .job_ticket(core.job_ticket())
        .job_results_so_far(0);
    if let Some(client) = clients.first() {
        builder = builder.client(Arc::clone(client));
    }
    core.notify_failure(&FailureEvent::new(builder.build(), cause));
}
