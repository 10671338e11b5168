//! Query batching engine
//!
//! Owns the job lifecycle: configuration before start, seeding one page
//! task per shard at start, live reconfiguration of the shard directory
//! mid-job (with quarantine for tasks whose shard disappeared), listener
//! retry of failed batches, and termination detection.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, trace, warn};

use crate::batch::{FailureEvent, JobTicket, QueryBatch};
use crate::error::{BatcherError, ConfigError, Result};
use crate::listener::{BatchListener, FailureListener};
use crate::pool::WorkerPool;
use crate::shard::{self, Shard, ShardDirectory};
use crate::transport::{ClientFactory, Query, Transport};

use super::task::{run_job, PageTask, QueryJob};

/// Error produced by a caller-supplied identifier sequence
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) type IdSource = Box<dyn Iterator<Item = std::result::Result<String, SourceError>> + Send>;

/// Parallel query batcher over a forest-sharded document store.
///
/// Built for either a server query (pages fetched per shard) or a
/// caller-supplied identifier sequence (batched and round-robined across
/// hosts). Configuration happens before [`start`](Self::start); the
/// control surface ([`with_forest_config`](Self::with_forest_config),
/// [`retry`](Self::retry), [`stop`](Self::stop),
/// [`await_completion`](Self::await_completion)) works any time after.
pub struct QueryBatcher {
    core: Arc<BatcherCore>,
}

impl std::fmt::Debug for QueryBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBatcher").finish_non_exhaustive()
    }
}

pub(crate) struct BatcherCore {
    query: Option<Query>,
    source: Mutex<Option<IdSource>>,
    factory: Arc<dyn ClientFactory>,

    job_name: Mutex<Option<String>>,
    page_size: AtomicU64,
    thread_count: AtomicUsize,
    consistent_snapshot: AtomicBool,
    listeners: RwLock<ListenerSet>,

    started: AtomicBool,
    job_ticket: Mutex<Option<JobTicket>>,
    pool: RwLock<Option<Arc<WorkerPool<QueryJob>>>>,

    job_batch_counter: AtomicU64,
    job_results: AtomicU64,
    /// Pinned snapshot timestamp, 0 while unset (server timestamps are positive)
    snapshot_timestamp: AtomicU64,
    stopped: AtomicBool,
    source_drained: AtomicBool,

    /// The engine monitor: directory snapshot, per-shard state, quarantine
    state: Mutex<EngineState>,
    /// Round-robin client list, replaced wholesale on reconfiguration
    clients: RwLock<Arc<Vec<Arc<dyn Transport>>>>,
}

#[derive(Default)]
struct ListenerSet {
    success: Vec<Arc<dyn BatchListener>>,
    failure: Vec<Arc<dyn FailureListener>>,
}

#[derive(Default)]
struct EngineState {
    /// Shards from the most recent directory update
    directory: Vec<Shard>,

    /// Results delivered per shard, keyed by shard id.
    /// Entries are retained when a shard leaves the directory so
    /// quarantined tasks can resume with their counters.
    shard_results: HashMap<u64, Arc<AtomicU64>>,

    /// Whether pagination has finished per shard, keyed by shard id
    shard_done: HashMap<u64, Arc<AtomicBool>>,

    /// Tasks whose shard disappeared from the directory, pending return
    quarantine: HashMap<u64, Vec<PageTask>>,
}

impl QueryBatcher {
    /// Create a batcher that runs `query` against every shard in `directory`
    pub fn for_query(
        query: Query,
        factory: Arc<dyn ClientFactory>,
        directory: &dyn ShardDirectory,
    ) -> Result<Self> {
        Self::build(Some(query), None, factory, directory)
    }

    /// Create a batcher over a caller-supplied fallible identifier sequence
    pub fn for_iterator<I>(
        source: I,
        factory: Arc<dyn ClientFactory>,
        directory: &dyn ShardDirectory,
    ) -> Result<Self>
    where
        I: Iterator<Item = std::result::Result<String, SourceError>> + Send + 'static,
    {
        Self::build(None, Some(Box::new(source)), factory, directory)
    }

    /// Create a batcher over an infallible identifier sequence
    pub fn for_uris<I>(
        source: I,
        factory: Arc<dyn ClientFactory>,
        directory: &dyn ShardDirectory,
    ) -> Result<Self>
    where
        I: Iterator<Item = String> + Send + 'static,
    {
        Self::for_iterator(source.map(Ok), factory, directory)
    }

    fn build(
        query: Option<Query>,
        source: Option<IdSource>,
        factory: Arc<dyn ClientFactory>,
        directory: &dyn ShardDirectory,
    ) -> Result<Self> {
        let core = Arc::new(BatcherCore {
            query,
            source: Mutex::new(source),
            factory,
            job_name: Mutex::new(None),
            page_size: AtomicU64::new(1000),
            thread_count: AtomicUsize::new(0),
            consistent_snapshot: AtomicBool::new(false),
            listeners: RwLock::new(ListenerSet::default()),
            started: AtomicBool::new(false),
            job_ticket: Mutex::new(None),
            pool: RwLock::new(None),
            job_batch_counter: AtomicU64::new(0),
            job_results: AtomicU64::new(0),
            snapshot_timestamp: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            source_drained: AtomicBool::new(false),
            state: Mutex::new(EngineState::default()),
            clients: RwLock::new(Arc::new(Vec::new())),
        });
        apply_forest_config(&core, directory)?;
        Ok(Self { core })
    }

    // ---- configuration (rejected once the job has started) ----

    /// Name this job for log correlation
    pub fn with_job_name(&self, name: impl Into<String>) -> Result<&Self> {
        self.require_not_started()?;
        *self.core.job_name.lock() = Some(name.into());
        Ok(self)
    }

    /// Current job name
    pub fn job_name(&self) -> Option<String> {
        self.core.job_name.lock().clone()
    }

    /// Set the page size (identifiers per batch). A zero value is coerced
    /// to 1 at start with a warning.
    pub fn with_page_size(&self, page_size: u64) -> Result<&Self> {
        self.require_not_started()?;
        self.core.page_size.store(page_size, Ordering::SeqCst);
        Ok(self)
    }

    /// Current page size
    pub fn page_size(&self) -> u64 {
        self.core.page_size.load(Ordering::SeqCst)
    }

    /// Set the worker thread count. Unset, it defaults at start to the
    /// number of shards (query jobs) or hosts (iterating jobs).
    pub fn with_thread_count(&self, thread_count: usize) -> Result<&Self> {
        self.require_not_started()?;
        if thread_count < 1 {
            return Err(ConfigError::InvalidThreadCount {
                count: thread_count,
            }
            .into());
        }
        self.core.thread_count.store(thread_count, Ordering::SeqCst);
        Ok(self)
    }

    /// Current thread count (0 while unset)
    pub fn thread_count(&self) -> usize {
        self.core.thread_count.load(Ordering::SeqCst)
    }

    /// Pin every page of every shard to the server timestamp of the first
    /// successful page, so the union of results reflects one point in time
    pub fn with_consistent_snapshot(&self) -> Result<&Self> {
        self.require_not_started()?;
        self.core.consistent_snapshot.store(true, Ordering::SeqCst);
        Ok(self)
    }

    /// Register a success listener, invoked for each batch in order
    pub fn on_batch(&self, listener: impl BatchListener + 'static) -> Result<&Self> {
        self.require_not_started()?;
        self.core.listeners.write().success.push(Arc::new(listener));
        Ok(self)
    }

    /// Register a failure listener, invoked for each failed fetch in order
    pub fn on_failure(&self, listener: impl FailureListener + 'static) -> Result<&Self> {
        self.require_not_started()?;
        self.core.listeners.write().failure.push(Arc::new(listener));
        Ok(self)
    }

    /// Replace the success listener list
    pub fn set_batch_listeners(&self, listeners: Vec<Arc<dyn BatchListener>>) -> Result<&Self> {
        self.require_not_started()?;
        self.core.listeners.write().success = listeners;
        Ok(self)
    }

    /// Replace the failure listener list
    pub fn set_failure_listeners(&self, listeners: Vec<Arc<dyn FailureListener>>) -> Result<&Self> {
        self.require_not_started()?;
        self.core.listeners.write().failure = listeners;
        Ok(self)
    }

    /// Registered success listeners
    pub fn batch_listeners(&self) -> Vec<Arc<dyn BatchListener>> {
        self.core.listeners.read().success.clone()
    }

    /// Registered failure listeners
    pub fn failure_listeners(&self) -> Vec<Arc<dyn FailureListener>> {
        self.core.listeners.read().failure.clone()
    }

    fn require_not_started(&self) -> Result<()> {
        if self.core.started.load(Ordering::SeqCst) {
            return Err(BatcherError::AlreadyStarted);
        }
        Ok(())
    }

    // ---- control surface ----

    /// Start the job under `ticket`.
    ///
    /// Resolves defaults, spins up the worker pool, and seeds one page
    /// task per shard (query jobs) or the sequence driver (iterating
    /// jobs). In consistent-snapshot mode the first page task runs on the
    /// calling thread so the snapshot timestamp is pinned before parallel
    /// fetches begin.
    pub fn start(&self, ticket: JobTicket) -> Result<()> {
        if self.core.started.swap(true, Ordering::SeqCst) {
            warn!("start called more than once");
            return Err(BatcherError::AlreadyStarted);
        }
        if self.core.page_size.load(Ordering::SeqCst) == 0 {
            warn!("page size should be 1 or greater - setting page size to 1");
            self.core.page_size.store(1, Ordering::SeqCst);
        }
        *self.core.job_ticket.lock() = Some(ticket);

        let mut threads = self.core.thread_count.load(Ordering::SeqCst);
        if threads == 0 {
            if self.core.query.is_some() {
                threads = self.core.state.lock().directory.len();
                warn!(threads, "thread count not set - defaulting to number of shards");
            } else {
                threads = self.core.clients.read().len();
                warn!(threads, "thread count not set - defaulting to number of hosts");
            }
            self.core.thread_count.store(threads, Ordering::SeqCst);
        }

        {
            let listeners = self.core.listeners.read();
            info!(
                job = %self.job_name().unwrap_or_default(),
                page_size = self.core.page_size.load(Ordering::SeqCst),
                threads,
                batch_listeners = listeners.success.len(),
                failure_listeners = listeners.failure.len(),
                "starting job"
            );
        }

        let runner_core = Arc::downgrade(&self.core);
        let terminated_core = Arc::downgrade(&self.core);
        let pool = Arc::new(WorkerPool::new(
            threads,
            move |job: QueryJob| {
                if let Some(core) = runner_core.upgrade() {
                    run_job(&core, job);
                }
            },
            move || {
                if let Some(core) = terminated_core.upgrade() {
                    info!(
                        job_batches = core.job_batch_counter.load(Ordering::SeqCst),
                        job_results = core.job_results.load(Ordering::SeqCst),
                        "job complete"
                    );
                }
            },
        )?);
        *self.core.pool.write() = Some(Arc::clone(&pool));

        if self.core.query.is_some() {
            let shards = self.core.state.lock().directory.clone();
            let snapshot = self.core.consistent_snapshot.load(Ordering::SeqCst);
            let mut snapshot_pinned = false;
            for shard in shards {
                let task = PageTask::first_page(shard);
                if snapshot && !snapshot_pinned {
                    // run inline so the timestamp is pinned before the
                    // parallel fetches start
                    run_job(&self.core, QueryJob::Page(task));
                    snapshot_pinned = true;
                } else {
                    pool.submit(QueryJob::Page(task));
                }
            }
        } else {
            pool.submit(QueryJob::Drive);
        }
        Ok(())
    }

    /// Push a new shard directory snapshot into a running (or not yet
    /// started) job.
    ///
    /// Shards added since the last snapshot get a page task seeded at
    /// offset 1. Queued tasks for shards that disappeared are moved to the
    /// quarantine, keyed by shard, and re-queued with their original
    /// offsets the first time their shard reappears. Tasks already mid
    /// fetch are not cancelled.
    pub fn with_forest_config(&self, directory: &dyn ShardDirectory) -> Result<&Self> {
        apply_forest_config(&self.core, directory)?;
        Ok(self)
    }

    /// Retry a failed batch on the calling thread.
    ///
    /// Re-resolves the event's shard against the current directory (the
    /// directory may have moved it to a healthy host), clears the shard's
    /// done flag, and re-issues the page fetch at the offset where it
    /// failed, carrying the original job batch number. On success the
    /// shard resumes normal pagination; on failure the error returns to
    /// the caller and failure listeners are not re-entered.
    pub fn retry(&self, event: &FailureEvent) -> Result<()> {
        let failed_shard = event
            .batch()
            .shard()
            .ok_or(BatcherError::InvalidRetryEvent)?;
        let current = {
            let state = self.core.state.lock();
            state
                .directory
                .iter()
                .find(|s| s.id() == failed_shard.id())
                .cloned()
        };
        let Some(shard) = current else {
            return Err(BatcherError::ShardNotInConfiguration {
                shard: failed_shard.name().to_string(),
            });
        };
        // obviously not done with this shard after all
        if let Some((is_done, _)) = self.core.shard_flags(shard.id()) {
            is_done.store(false, Ordering::SeqCst);
        }
        let start = event.batch().shard_results_so_far() + 1;
        trace!(
            shard = %shard.name(),
            host = %shard.preferred_host(),
            start,
            "retrying failed batch"
        );
        let task = PageTask {
            shard,
            start,
            shard_batch_number: event.batch().shard_batch_number(),
            retry_batch_number: Some(event.batch().job_batch_number()),
            call_failure_listeners: false,
        };
        task.run(&self.core)
    }

    /// Stop the job: no further page fetches run, queued tasks are
    /// discarded, in-flight fetches finish
    pub fn stop(&self) {
        self.core.stopped.store(true, Ordering::SeqCst);
        if let Some(pool) = self.core.pool_handle() {
            pool.shutdown_now();
        }
        if self.core.query.is_some() {
            let state = self.core.state.lock();
            let unfinished = state.directory.iter().any(|s| {
                state
                    .shard_done
                    .get(&s.id())
                    .map(|done| !done.load(Ordering::SeqCst))
                    .unwrap_or(true)
            });
            if unfinished {
                warn!(
                    job = %self.job_name().unwrap_or_default(),
                    "job stopped before all results were retrieved"
                );
            }
        } else if !self.core.source_drained.load(Ordering::SeqCst) {
            warn!(
                job = %self.job_name().unwrap_or_default(),
                "job stopped before the identifier sequence was exhausted"
            );
        }
    }

    /// Wait until the job has fully terminated
    pub fn await_completion(&self) -> Result<bool> {
        self.await_pool(None)
    }

    /// Wait up to `timeout` for the job to terminate; false on timeout
    pub fn await_completion_for(&self, timeout: Duration) -> Result<bool> {
        self.await_pool(Some(timeout))
    }

    fn await_pool(&self, timeout: Option<Duration>) -> Result<bool> {
        let pool = self.core.pool_handle().ok_or(BatcherError::NotStarted)?;
        Ok(pool.await_termination(timeout))
    }

    /// True once the worker pool has fully terminated
    pub fn is_stopped(&self) -> bool {
        self.core
            .pool_handle()
            .map(|pool| pool.is_terminated())
            .unwrap_or(false)
    }

    /// Ticket this job was started under
    pub fn job_ticket(&self) -> Result<JobTicket> {
        self.core
            .job_ticket
            .lock()
            .clone()
            .ok_or(BatcherError::NotStarted)
    }
}

impl BatcherCore {
    pub(crate) fn query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.page_size.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot_enabled(&self) -> bool {
        self.consistent_snapshot.load(Ordering::SeqCst)
    }

    /// Pinned snapshot timestamp, if any
    pub(crate) fn snapshot_timestamp(&self) -> Option<u64> {
        match self.snapshot_timestamp.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Pin the snapshot timestamp; only the first writer wins
    pub(crate) fn pin_snapshot(&self, timestamp: u64) {
        if self
            .snapshot_timestamp
            .compare_exchange(0, timestamp, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(timestamp, "pinned consistent snapshot timestamp");
        }
    }

    pub(crate) fn next_job_batch_number(&self) -> u64 {
        self.job_batch_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn add_job_results(&self, count: u64) -> u64 {
        self.job_results.fetch_add(count, Ordering::SeqCst) + count
    }

    pub(crate) fn job_results_so_far(&self) -> u64 {
        self.job_results.load(Ordering::SeqCst)
    }

    pub(crate) fn job_ticket(&self) -> Option<JobTicket> {
        self.job_ticket.lock().clone()
    }

    pub(crate) fn client_for(&self, shard: &Shard) -> Arc<dyn Transport> {
        self.factory.client_for_host(shard.preferred_host())
    }

    pub(crate) fn clients_snapshot(&self) -> Arc<Vec<Arc<dyn Transport>>> {
        Arc::clone(&self.clients.read())
    }

    pub(crate) fn pool_handle(&self) -> Option<Arc<WorkerPool<QueryJob>>> {
        self.pool.read().clone()
    }

    /// Submit a job to the pool if one exists
    pub(crate) fn submit(&self, job: QueryJob) {
        if let Some(pool) = self.pool_handle() {
            pool.submit(job);
        }
    }

    /// Done flag and results counter for a shard, by id
    pub(crate) fn shard_flags(&self, shard_id: u64) -> Option<(Arc<AtomicBool>, Arc<AtomicU64>)> {
        let state = self.state.lock();
        let done = state.shard_done.get(&shard_id)?;
        let results = state.shard_results.get(&shard_id)?;
        Some((Arc::clone(done), Arc::clone(results)))
    }

    /// The shard as the current directory knows it (fresh preferred host)
    pub(crate) fn current_shard(&self, shard_id: u64) -> Option<Shard> {
        let state = self.state.lock();
        state.directory.iter().find(|s| s.id() == shard_id).cloned()
    }

    /// Shut the pool down once every shard in the current directory is done
    pub(crate) fn shutdown_if_all_shards_done(&self) {
        let all_done = {
            let state = self.state.lock();
            state.directory.iter().all(|s| {
                state
                    .shard_done
                    .get(&s.id())
                    .map(|done| done.load(Ordering::SeqCst))
                    .unwrap_or(false)
            })
        };
        if all_done {
            if let Some(pool) = self.pool_handle() {
                pool.shutdown();
            }
        }
    }

    pub(crate) fn take_source(&self) -> Option<IdSource> {
        self.source.lock().take()
    }

    pub(crate) fn mark_source_drained(&self) {
        self.source_drained.store(true, Ordering::SeqCst);
    }

    /// Deliver a batch to every success listener, in order. A panicking
    /// listener is logged and does not stop the rest.
    pub(crate) fn notify_success(&self, batch: &QueryBatch) {
        let listeners = self.listeners.read().success.clone();
        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener.on_batch(batch))) {
                error!(panic = %panic_message(payload.as_ref()), "batch listener panicked");
            }
        }
    }

    /// Deliver a failure event to every failure listener, in order
    pub(crate) fn notify_failure(&self, event: &FailureEvent) {
        let listeners = self.listeners.read().failure.clone();
        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener.on_failure(event))) {
                error!(panic = %panic_message(payload.as_ref()), "failure listener panicked");
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "(non-string panic payload)"
    }
}

/// Install a directory snapshot: validate it, ensure per-shard state,
/// rebuild the client list, and - when the job is running - reconcile
/// queued work against the added/removed/restarted shard sets.
fn apply_forest_config(core: &Arc<BatcherCore>, directory: &dyn ShardDirectory) -> Result<()> {
    let shards = directory.list_shards();
    if shards.is_empty() {
        return Err(ConfigError::EmptyDirectory.into());
    }
    for shard in &shards {
        if shard.preferred_host().is_empty() {
            return Err(ConfigError::MissingHost {
                shard: shard.name().to_string(),
            }
            .into());
        }
    }

    let hosts = shard::preferred_hosts(&shards);
    let clients: Vec<Arc<dyn Transport>> = hosts
        .iter()
        .map(|host| core.factory.client_for_host(host))
        .collect();

    let mut to_submit: Vec<QueryJob> = Vec::new();
    {
        let mut state = core.state.lock();
        let old_ids: HashSet<u64> = state.shard_results.keys().copied().collect();
        for shard in &shards {
            state
                .shard_results
                .entry(shard.id())
                .or_insert_with(|| Arc::new(AtomicU64::new(0)));
            state
                .shard_done
                .entry(shard.id())
                .or_insert_with(|| Arc::new(AtomicBool::new(false)));
        }
        *core.clients.write() = Arc::new(clients);
        info!(hosts = ?hosts, database = %shards[0].database(), "using forest configuration");

        let started = core.started.load(Ordering::SeqCst);
        if started && core.query.is_some() && !old_ids.is_empty() {
            let new_ids: HashSet<u64> = shards.iter().map(Shard::id).collect();
            let added: Vec<Shard> = shards
                .iter()
                .filter(|s| !old_ids.contains(&s.id()))
                .cloned()
                .collect();
            let black_listed: HashSet<u64> = old_ids.difference(&new_ids).copied().collect();
            let restarted: Vec<Shard> = shards
                .iter()
                .filter(|s| {
                    state
                        .quarantine
                        .get(&s.id())
                        .map(|tasks| !tasks.is_empty())
                        .unwrap_or(false)
                })
                .cloned()
                .collect();

            if let Some(pool) = core.pool_handle() {
                if !black_listed.is_empty() {
                    let removed: Vec<&str> = state
                        .directory
                        .iter()
                        .filter(|s| black_listed.contains(&s.id()))
                        .map(Shard::name)
                        .collect();
                    warn!(
                        shards = ?removed,
                        "quarantining queued page fetches for shards no longer in the configuration"
                    );
                    for job in pool.drain_queued() {
                        match job {
                            QueryJob::Page(task) if black_listed.contains(&task.shard.id()) => {
                                state
                                    .quarantine
                                    .entry(task.shard.id())
                                    .or_default()
                                    .push(task);
                            }
                            other => to_submit.push(other),
                        }
                    }
                }
                if !added.is_empty() {
                    let names: Vec<&str> = added.iter().map(Shard::name).collect();
                    warn!(shards = ?names, "seeding page fetches for shards added to the configuration");
                }
                for shard in added {
                    to_submit.push(QueryJob::Page(PageTask::first_page(shard)));
                }
                if !restarted.is_empty() {
                    let names: Vec<&str> = restarted.iter().map(Shard::name).collect();
                    warn!(
                        shards = ?names,
                        "re-queueing quarantined page fetches for shards back in the configuration"
                    );
                }
                for shard in &restarted {
                    if let Some(tasks) = state.quarantine.remove(&shard.id()) {
                        to_submit.extend(tasks.into_iter().map(QueryJob::Page));
                    }
                }
            }
        }
        state.directory = shards;
    }

    // enqueue outside the monitor: caller-runs overflow may execute a task
    // right here, and that task (or its listeners) takes the monitor too
    if let Some(pool) = core.pool_handle() {
        for job in to_submit {
            pool.submit(job);
        }
        if core.started.load(Ordering::SeqCst) && core.query.is_some() {
            core.shutdown_if_all_shards_done();
        }
    }
    Ok(())
}
