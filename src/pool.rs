//! Bounded worker pool with caller-runs backpressure
//!
//! The pool runs a fixed number of worker threads over one bounded FIFO
//! queue of capacity `5 x thread_count`. When the queue is full, the
//! submitting thread runs the task itself rather than blocking or growing
//! memory - the backpressure that keeps task-producing tasks in check.
//!
//! Shutdown comes in two flavors:
//! - [`WorkerPool::shutdown`] stops accepting work; workers drain the
//!   queue, finish in-flight tasks, and exit.
//! - [`WorkerPool::shutdown_now`] additionally discards queued tasks.
//!
//! The last worker to exit marks the pool terminated, wakes every
//! [`WorkerPool::await_termination`] waiter, and fires the terminal
//! callback exactly once.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::PoolError;

/// Queue capacity per worker thread
const QUEUE_FACTOR: usize = 5;

/// How long an idle worker waits before re-checking shutdown flags
const IDLE_TICK: Duration = Duration::from_millis(10);

/// Fixed-size worker pool over a bounded task queue
pub struct WorkerPool<T: Send + 'static> {
    /// Sender side of the task queue
    tx: Sender<T>,

    /// Receiver side, kept for draining and capacity checks
    rx: Receiver<T>,

    /// Task body, shared with workers for caller-runs execution
    runner: Arc<dyn Fn(T) + Send + Sync>,

    /// Shared lifecycle state
    state: Arc<PoolState>,

    /// Number of worker threads
    thread_count: usize,

    /// Queue capacity
    capacity: usize,
}

struct PoolState {
    /// No new submissions; workers drain the queue and exit
    draining: AtomicBool,

    /// Workers exit at the next tick without draining
    halted: AtomicBool,

    /// Live-worker count and terminated flag
    lifecycle: Mutex<Lifecycle>,

    /// Signaled when the last worker exits
    terminated: Condvar,
}

struct Lifecycle {
    live_workers: usize,
    terminated: bool,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn a pool of `thread_count` workers running `runner` for each
    /// task. `on_terminated` fires once, from the last worker to exit.
    pub fn new(
        thread_count: usize,
        runner: impl Fn(T) + Send + Sync + 'static,
        on_terminated: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self, PoolError> {
        let capacity = thread_count * QUEUE_FACTOR;
        let (tx, rx) = bounded(capacity);
        let runner: Arc<dyn Fn(T) + Send + Sync> = Arc::new(runner);
        let on_terminated: Arc<dyn Fn() + Send + Sync> = Arc::new(on_terminated);
        let state = Arc::new(PoolState {
            draining: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                live_workers: thread_count,
                terminated: false,
            }),
            terminated: Condvar::new(),
        });

        for id in 0..thread_count {
            let rx = rx.clone();
            let runner = Arc::clone(&runner);
            let state = Arc::clone(&state);
            let on_terminated = Arc::clone(&on_terminated);

            thread::Builder::new()
                .name(format!("batcher-{}", id))
                .spawn(move || {
                    worker_loop(&rx, runner.as_ref(), &state);

                    let last = {
                        let mut lifecycle = state.lifecycle.lock();
                        lifecycle.live_workers -= 1;
                        if lifecycle.live_workers == 0 {
                            lifecycle.terminated = true;
                            state.terminated.notify_all();
                            true
                        } else {
                            false
                        }
                    };
                    if last {
                        on_terminated();
                    }
                })
                .map_err(|e| PoolError::SpawnFailed {
                    id,
                    reason: e.to_string(),
                })?;
        }

        Ok(Self {
            tx,
            rx,
            runner,
            state,
            thread_count,
            capacity,
        })
    }

    /// Submit a task.
    ///
    /// If the queue is full the task runs on the calling thread. Returns
    /// false if the pool is shutting down (the task is dropped).
    pub fn submit(&self, task: T) -> bool {
        if self.state.draining.load(Ordering::Acquire) || self.state.halted.load(Ordering::Acquire)
        {
            debug!("task submitted after shutdown - dropping");
            return false;
        }
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) => {
                // queue is full - the submitter pays for it
                (self.runner)(task);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Remove every queued task without running it
    pub fn drain_queued(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    /// Current queue length
    pub fn queued_len(&self) -> usize {
        self.rx.len()
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of worker threads
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Orderly shutdown: stop accepting tasks, drain the queue, exit
    pub fn shutdown(&self) {
        self.state.draining.store(true, Ordering::Release);
    }

    /// Immediate shutdown: discard queued tasks and exit at the next tick.
    /// In-flight tasks still run to completion.
    pub fn shutdown_now(&self) {
        self.state.draining.store(true, Ordering::Release);
        self.state.halted.store(true, Ordering::Release);
        let dropped = self.drain_queued().len();
        if dropped > 0 {
            debug!(dropped, "discarded queued tasks on immediate shutdown");
        }
    }

    /// True once every worker has exited
    pub fn is_terminated(&self) -> bool {
        self.state.lifecycle.lock().terminated
    }

    /// Wait for the pool to terminate.
    ///
    /// With a timeout, returns false if the pool is still running when it
    /// elapses. Without one, blocks until termination. A pool that is
    /// never shut down never terminates.
    pub fn await_termination(&self, timeout: Option<Duration>) -> bool {
        let mut lifecycle = self.state.lifecycle.lock();
        match timeout {
            None => {
                while !lifecycle.terminated {
                    self.state.terminated.wait(&mut lifecycle);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !lifecycle.terminated {
                    if self
                        .state
                        .terminated
                        .wait_until(&mut lifecycle, deadline)
                        .timed_out()
                    {
                        return lifecycle.terminated;
                    }
                }
                true
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        // let workers exit at their next tick; the queue drops with us
        self.state.draining.store(true, Ordering::Release);
        self.state.halted.store(true, Ordering::Release);
    }
}

fn worker_loop<T>(rx: &Receiver<T>, runner: &(dyn Fn(T) + Send + Sync), state: &PoolState) {
    loop {
        if state.halted.load(Ordering::Acquire) {
            break;
        }
        if state.draining.load(Ordering::Acquire) && rx.is_empty() {
            break;
        }
        match rx.recv_timeout(IDLE_TICK) {
            Ok(task) => runner(task),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_caller_runs_when_queue_full() {
        let (started_tx, started_rx) = unbounded::<()>();
        let (release_tx, release_rx) = unbounded::<()>();
        let executed: Arc<Mutex<Vec<(u32, thread::ThreadId)>>> = Arc::new(Mutex::new(Vec::new()));

        let runner = {
            let executed = Arc::clone(&executed);
            move |task: u32| {
                if task == 0 {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                }
                executed.lock().push((task, thread::current().id()));
            }
        };
        let pool = WorkerPool::new(2, runner, || {}).unwrap();

        // park both workers
        assert!(pool.submit(0));
        assert!(pool.submit(0));
        started_rx.recv().unwrap();
        started_rx.recv().unwrap();

        // fill the queue (capacity 10)
        for i in 1..=10 {
            assert!(pool.submit(i));
        }
        assert_eq!(pool.queued_len(), pool.capacity());

        // the overflow task runs on this thread, not a worker
        assert!(pool.submit(99));
        let main_id = thread::current().id();
        assert!(executed.lock().iter().any(|(t, id)| *t == 99 && *id == main_id));

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        pool.shutdown();
        assert!(pool.await_termination(Some(Duration::from_secs(5))));
        assert_eq!(executed.lock().len(), 13);
    }

    #[test]
    fn test_shutdown_now_discards_queue() {
        let (started_tx, started_rx) = unbounded::<()>();
        let (release_tx, release_rx) = unbounded::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        let runner = {
            let ran = Arc::clone(&ran);
            move |task: u32| {
                if task == 0 {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                }
                ran.fetch_add(1, Ordering::SeqCst);
            }
        };
        let pool = WorkerPool::new(1, runner, || {}).unwrap();

        assert!(pool.submit(0));
        started_rx.recv().unwrap();
        for i in 1..=3 {
            assert!(pool.submit(i));
        }

        pool.shutdown_now();
        assert_eq!(pool.queued_len(), 0);
        release_tx.send(()).unwrap();

        assert!(pool.await_termination(Some(Duration::from_secs(5))));
        // only the parked task ran; the queued three were discarded
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_rejected_after_shutdown() {
        let pool = WorkerPool::new(1, |_task: u32| {}, || {}).unwrap();
        pool.shutdown();
        assert!(!pool.submit(1));
        assert!(pool.await_termination(Some(Duration::from_secs(5))));
    }

    #[test]
    fn test_await_termination_times_out_while_running() {
        let pool = WorkerPool::new(1, |_task: u32| {}, || {}).unwrap();
        assert!(!pool.await_termination(Some(Duration::from_millis(50))));
        assert!(!pool.is_terminated());
        pool.shutdown();
        assert!(pool.await_termination(Some(Duration::from_secs(5))));
        assert!(pool.is_terminated());
    }

    #[test]
    fn test_terminal_callback_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let pool = {
            let fired = Arc::clone(&fired);
            WorkerPool::new(4, |_task: u32| {}, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        pool.shutdown();
        assert!(pool.await_termination(Some(Duration::from_secs(5))));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
