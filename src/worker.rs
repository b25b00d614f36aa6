//! Serial task queue bound to a dedicated thread
//!
//! A [`Worker`] runs posted callables one at a time, in FIFO order, on its own
//! OS thread. It is the dispatch target for asynchronous and blocking slots.
//!
//! # Example
//!
//! ```no_run
//! use igtcom::worker::Worker;
//!
//! let worker = Worker::spawn("tracking")?;
//!
//! // Fire and forget
//! worker.post(|| {
//!     println!("running on the tracking thread");
//!     Ok(())
//! })?;
//!
//! // Post and wait for the result
//! let answer = worker.post_and_wait(|| Ok(40 + 2))?;
//! assert_eq!(answer, 42);
//!
//! worker.stop();
//! # Ok::<(), igtcom::ComError>(())
//! ```

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::com::connection;
use crate::error::{ComError, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// What happens to queued tasks when a worker stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopPolicy {
    /// Run every task already queued, then exit
    Drain,
    /// Drop every task not yet started
    Discard,
}

/// Configuration for worker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Thread name, also used in logs and errors
    pub name: String,
    /// Policy applied by [`Worker::stop`] and when the last handle is dropped
    pub stop_policy: StopPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            stop_policy: StopPolicy::Drain,
        }
    }
}

impl WorkerConfig {
    /// Create a draining worker configuration with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the stop policy
    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }
}

/// Statistics for a worker
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total tasks accepted by `post`/`post_and_wait`
    pub posted: u64,
    /// Tasks that ran and succeeded
    pub completed: u64,
    /// Tasks that ran and returned an error or panicked
    pub failed: u64,
    /// Tasks dropped by a `Discard` shutdown
    pub discarded: u64,
}

/// State shared between worker handles and the worker thread
struct Shared {
    name: String,
    discard: AtomicBool,
    stats: Mutex<WorkerStats>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn record<R>(&self, result: &Result<R>) {
        let mut stats = self.stats.lock();
        match result {
            Ok(_) => stats.completed += 1,
            Err(e) => {
                stats.failed += 1;
                drop(stats);
                *self.last_error.lock() = Some(e.to_string());
            }
        }
    }

    fn run<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R>,
    {
        let result = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => Err(ComError::TaskPanicked {
                worker: self.name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        };
        self.record(&result);
        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct WorkerInner {
    shared: Arc<Shared>,
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    config: WorkerConfig,
}

impl WorkerInner {
    fn shutdown(&self, policy: StopPolicy) {
        // Raised before the sender is taken so nothing queued can slip through
        if policy == StopPolicy::Discard {
            self.shared.discard.store(true, Ordering::Release);
        }

        // Closing the channel lets the thread exit once the queue is empty
        let was_open = self.tx.lock().take().is_some();

        // Another stopper may be joining this very thread
        if thread::current().id() == self.thread_id {
            if was_open {
                debug!(worker = %self.shared.name, "Stop requested from the worker thread, not joining");
            }
            return;
        }

        let handle = self.thread.lock().take();
        let Some(handle) = handle else {
            return;
        };
        if handle.join().is_err() {
            warn!(worker = %self.shared.name, "Worker thread terminated abnormally");
        }

        let stats = self.shared.stats.lock().clone();
        info!(
            worker = %self.shared.name,
            policy = ?policy,
            completed = stats.completed,
            failed = stats.failed,
            discarded = stats.discarded,
            "Worker stopped"
        );
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        self.shutdown(self.config.stop_policy);
    }
}

/// Handle to a serial execution context
///
/// Cloning a `Worker` yields another handle to the same thread and queue.
/// The thread is stopped with the configured [`StopPolicy`] when the last
/// handle is dropped, or explicitly with [`Worker::stop`].
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.inner.shared.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Worker {
    /// Spawn a draining worker with the given name
    ///
    /// # Errors
    ///
    /// - [`ComError::Io`] - The OS refused to create the thread
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        Self::with_config(WorkerConfig::named(name))
    }

    /// Spawn a worker with a custom configuration
    pub fn with_config(config: WorkerConfig) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            discard: AtomicBool::new(false),
            stats: Mutex::new(WorkerStats::default()),
            last_error: Mutex::new(None),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                debug!(worker = %thread_shared.name, "Worker thread started");
                while let Some(task) = rx.blocking_recv() {
                    if thread_shared.discard.load(Ordering::Acquire) {
                        thread_shared.stats.lock().discarded += 1;
                        continue;
                    }
                    task();
                }
                debug!(worker = %thread_shared.name, "Worker thread exiting");
            })?;

        let thread_id = handle.thread().id();
        info!(worker = %config.name, "Worker started");

        Ok(Worker {
            inner: Arc::new(WorkerInner {
                shared,
                tx: Mutex::new(Some(tx)),
                thread: Mutex::new(Some(handle)),
                thread_id,
                config,
            }),
        })
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    /// Whether the worker still accepts tasks
    pub fn is_running(&self) -> bool {
        self.inner.tx.lock().is_some()
    }

    /// Whether the calling thread is this worker's thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Get worker statistics
    pub fn stats(&self) -> WorkerStats {
        self.inner.shared.stats.lock().clone()
    }

    /// Last failure reported by a task nobody waited on
    pub fn last_error(&self) -> Option<String> {
        self.inner.shared.last_error.lock().clone()
    }

    /// Whether two handles refer to the same worker
    pub fn same_worker(&self, other: &Worker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn enqueue(&self, task: Task) -> Result<()> {
        let guard = self.inner.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(self.stopped());
        };
        // Counted before sending so a task never completes before it is posted
        self.inner.shared.stats.lock().posted += 1;
        if tx.send(task).is_err() {
            self.inner.shared.stats.lock().posted -= 1;
            return Err(self.stopped());
        }
        drop(guard);

        trace!(worker = %self.name(), "Task posted");
        Ok(())
    }

    fn stopped(&self) -> ComError {
        ComError::WorkerStopped {
            worker: self.name().to_string(),
        }
    }

    pub(crate) fn unavailable(&self) -> ComError {
        ComError::WorkerUnavailable {
            worker: self.name().to_string(),
        }
    }

    /// Enqueue a callable and return immediately
    ///
    /// A failure or panic inside the callable is logged and stored as the
    /// worker's [last error](Worker::last_error); it never reaches the caller.
    ///
    /// # Errors
    ///
    /// - [`ComError::WorkerStopped`] - The worker has been stopped
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let shared = self.inner.shared.clone();
        self.enqueue(Box::new(move || {
            if let Err(e) = shared.run(f) {
                warn!(worker = %shared.name, error = %e, "Posted task failed");
            }
        }))
    }

    /// Enqueue a callable and return a handle to its pending result
    ///
    /// # Errors
    ///
    /// - [`ComError::WorkerStopped`] - The worker has been stopped
    pub fn submit<R, F>(&self, f: F) -> Result<Pending<R>>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let shared = self.inner.shared.clone();
        self.enqueue(Box::new(move || {
            // Receiver may be gone if the caller stopped waiting
            let _ = tx.send(shared.run(f));
        }))?;

        Ok(Pending {
            rx,
            worker: self.name().to_string(),
        })
    }

    /// Enqueue a callable and block until it has run
    ///
    /// The callable's failure is returned unchanged. Called from the worker's
    /// own thread, the callable runs inline instead of deadlocking. Called
    /// from inside a direct slot, the callable may disconnect that slot's
    /// connection without waiting on the invocation it was called from.
    ///
    /// Must not be called from within an async runtime; use
    /// [`post_and_wait_async`](Worker::post_and_wait_async) there.
    ///
    /// # Errors
    ///
    /// - [`ComError::WorkerStopped`] - The worker has been stopped
    /// - [`ComError::WorkerUnavailable`] - The task was discarded before running
    /// - [`ComError::TaskPanicked`] - The callable panicked
    /// - Any error returned by the callable
    pub fn post_and_wait<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        if self.is_current() {
            return self.inner.shared.run(f);
        }
        // The caller is parked until `f` returns, so `f` acts on behalf of
        // any slot invocation the caller is in
        let invoking = connection::current_invocations();
        self.submit(move || {
            let _inherited = connection::inherit(invoking);
            f()
        })?
        .wait()
    }

    /// Async variant of [`post_and_wait`](Worker::post_and_wait)
    pub async fn post_and_wait_async<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        self.submit(f)?.recv().await
    }

    /// Stop the worker using its configured policy
    ///
    /// Further posts fail with [`ComError::WorkerStopped`]. Blocks until the
    /// thread has exited, unless called from the worker thread itself.
    pub fn stop(&self) {
        self.inner.shutdown(self.inner.config.stop_policy);
    }

    /// Stop the worker with an explicit policy
    pub fn stop_with(&self, policy: StopPolicy) {
        self.inner.shutdown(policy);
    }
}

/// Result of a task that has been posted but may not have run yet
#[derive(Debug)]
pub struct Pending<R> {
    rx: oneshot::Receiver<Result<R>>,
    worker: String,
}

impl<R> Pending<R> {
    fn unavailable(&self) -> ComError {
        ComError::WorkerUnavailable {
            worker: self.worker.clone(),
        }
    }

    /// Block until the task has run
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> Result<R> {
        let worker = self.worker;
        self.rx
            .blocking_recv()
            .map_err(|_| ComError::WorkerUnavailable { worker })?
    }

    /// Wait asynchronously until the task has run
    pub async fn recv(self) -> Result<R> {
        let worker = self.worker;
        self.rx
            .await
            .map_err(|_| ComError::WorkerUnavailable { worker })?
    }

    /// Take the result if the task has already run
    ///
    /// Returns `None` while the task is still queued or running.
    pub fn try_take(&mut self) -> Option<Result<R>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(self.unavailable())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let worker = Worker::spawn("fifo").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = seen.clone();
            worker
                .post(move || {
                    seen.lock().push(i);
                    Ok(())
                })
                .unwrap();
        }
        worker.stop();

        let seen = seen.lock();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_post_and_wait_returns_value() {
        let worker = Worker::spawn("answer").unwrap();
        let value = worker.post_and_wait(|| Ok(21 * 2)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_post_and_wait_runs_on_worker_thread() {
        let worker = Worker::spawn("thread-check").unwrap();
        let name = worker
            .post_and_wait(|| Ok(thread::current().name().map(str::to_string)))
            .unwrap();
        assert_eq!(name.as_deref(), Some("thread-check"));
    }

    #[test]
    fn test_post_and_wait_surfaces_failure() {
        let worker = Worker::spawn("failing").unwrap();
        let result: Result<()> = worker.post_and_wait(|| Err(ComError::callable("tracker lost")));
        assert!(matches!(result, Err(ComError::Callable(ref m)) if m == "tracker lost"));
        assert_eq!(worker.stats().failed, 1);
    }

    #[test]
    fn test_post_only_logs_failure() {
        let worker = Worker::spawn("logging").unwrap();
        let result = worker.post(|| Err(ComError::callable("tracker lost")));
        assert!(result.is_ok());

        // Barrier: FIFO guarantees the failing task has run
        worker.post_and_wait(|| Ok(())).unwrap();
        assert_eq!(worker.last_error().as_deref(), Some("Callable failed: tracker lost"));
        assert_eq!(worker.stats().failed, 1);
    }

    #[test]
    fn test_panic_is_caught() {
        let worker = Worker::spawn("panicky").unwrap();
        let result: Result<()> = worker.post_and_wait(|| panic!("boom"));
        assert!(matches!(result, Err(ComError::TaskPanicked { ref message, .. }) if message == "boom"));

        // Worker survives the panic
        assert_eq!(worker.post_and_wait(|| Ok(1)).unwrap(), 1);
    }

    #[test]
    fn test_post_after_stop_fails() {
        let worker = Worker::spawn("stopped").unwrap();
        worker.stop();
        assert!(!worker.is_running());

        let result = worker.post(|| Ok(()));
        assert!(matches!(result, Err(ComError::WorkerStopped { .. })));

        let result = worker.post_and_wait(|| Ok(()));
        assert!(matches!(result, Err(ComError::WorkerStopped { .. })));
    }

    #[test]
    fn test_stop_drain_runs_queue() {
        let worker = Worker::with_config(WorkerConfig::named("drain")).unwrap();
        let count = Arc::new(Mutex::new(0));

        for _ in 0..20 {
            let count = count.clone();
            worker
                .post(move || {
                    thread::sleep(Duration::from_millis(1));
                    *count.lock() += 1;
                    Ok(())
                })
                .unwrap();
        }
        worker.stop_with(StopPolicy::Drain);
        assert_eq!(*count.lock(), 20);
    }

    #[test]
    fn test_stop_discard_drops_queue() {
        let worker = Worker::spawn("discard").unwrap();
        let (started_tx, started_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();

        worker
            .post(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(())
            })
            .unwrap();
        started_rx.recv().unwrap();

        let pending = worker.submit(|| Ok(7)).unwrap();
        for _ in 0..5 {
            worker.post(|| Ok(())).unwrap();
        }

        let stopper = {
            let worker = worker.clone();
            thread::spawn(move || worker.stop_with(StopPolicy::Discard))
        };
        // Give the stopper time to raise the discard flag before releasing
        while worker.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        release_tx.send(()).unwrap();
        stopper.join().unwrap();

        assert!(matches!(pending.wait(), Err(ComError::WorkerUnavailable { .. })));
        assert_eq!(worker.stats().discarded, 6);
    }

    #[test]
    fn test_post_and_wait_inline_on_worker_thread() {
        let worker = Worker::spawn("reentrant").unwrap();
        let inner = worker.clone();
        let value = worker
            .post_and_wait(move || inner.post_and_wait(|| Ok(5)))
            .unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn test_stop_from_own_task_while_stopping_elsewhere() {
        let worker = Worker::spawn("self-stop").unwrap();
        let inner = worker.clone();
        worker
            .post(move || {
                thread::sleep(Duration::from_millis(200));
                inner.stop();
                Ok(())
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        let (done_tx, done_rx) = std_mpsc::channel();
        let stopper = worker.clone();
        thread::spawn(move || {
            stopper.stop();
            let _ = done_tx.send(());
        });

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(!worker.is_running());
    }

    #[test]
    fn test_task_sees_itself_posted() {
        let worker = Worker::spawn("stats").unwrap();
        for round in 1..=50u64 {
            let observer = worker.clone();
            let stats = worker.post_and_wait(move || Ok(observer.stats())).unwrap();
            // The running task is already counted, earlier ones completed
            assert_eq!(stats.posted, round);
            assert_eq!(stats.completed, round - 1);
        }
    }

    #[test]
    fn test_try_take() {
        let worker = Worker::spawn("try-take").unwrap();
        let mut pending = worker.submit(|| Ok("done")).unwrap();
        worker.post_and_wait(|| Ok(())).unwrap();
        assert_eq!(pending.try_take().unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_post_and_wait_async() {
        let worker = Worker::spawn("async").unwrap();
        let value = worker.post_and_wait_async(|| Ok(3 + 4)).await.unwrap();
        assert_eq!(value, 7);

        // Stop from a blocking context so the join does not stall the runtime
        tokio::task::spawn_blocking(move || worker.stop())
            .await
            .unwrap();
    }
}
