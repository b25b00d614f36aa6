//! Slots: typed callable endpoints
//!
//! A [`Slot`] wraps a closure taking an argument tuple. It can be called
//! directly, posted to its bound [`Worker`], or connected to any number of
//! signals. The [`SlotBase`] trait is its type-erased face, used by the
//! capability tables and by the connect-time signature check.
//!
//! # Example
//!
//! ```no_run
//! use igtcom::com::Slot;
//! use igtcom::worker::Worker;
//!
//! let render = Worker::spawn("render")?;
//! let slot = Slot::named("update_pose", |(tool, x): (String, f32)| {
//!     println!("{tool} moved to {x}");
//! })
//! .with_worker(render);
//!
//! slot.call(("needle".to_string(), 12.5))?;
//! slot.async_run(("needle".to_string(), 13.0))?;
//! # Ok::<(), igtcom::ComError>(())
//! ```

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::com::connection::SlotLinks;
use crate::com::signature::{Args, Signature};
use crate::error::{ComError, Result};
use crate::worker::{Pending, Worker};

/// Type-erased callable stored in signal connections
pub(crate) type RunFn<A> = Arc<dyn Fn(A) -> Result<()> + Send + Sync>;

type SlotFn<A, R> = Arc<dyn Fn(A) -> Result<R> + Send + Sync>;

/// Type-erased view of a [`Slot`]
pub trait SlotBase: Send + Sync + 'static {
    /// Debug name
    fn name(&self) -> &str;

    /// Argument and return types
    fn signature(&self) -> &Signature;

    /// Worker used for asynchronous and blocking dispatch
    fn worker(&self) -> Option<Worker>;

    /// Number of live connections targeting this slot
    fn connection_count(&self) -> usize;

    /// Disconnect every signal connected to this slot
    fn disconnect_all(&self);

    /// Identity shared by every clone of the same slot
    fn identity(&self) -> usize;

    /// Downcast support for typed table lookups
    fn as_any(&self) -> &dyn Any;

    /// Boxed [`RunFn`] for the slot's own argument tuple
    #[doc(hidden)]
    fn runner(&self) -> Box<dyn Any + Send>;

    #[doc(hidden)]
    fn links(&self) -> &SlotLinks;
}

struct SlotInner<A, R> {
    name: String,
    signature: Signature,
    func: SlotFn<A, R>,
    worker: RwLock<Option<Worker>>,
    links: SlotLinks,
}

/// Callable endpoint with a fixed signature
///
/// `A` is the argument tuple, `R` the return type. Cloning yields another
/// handle to the same slot; connections made through one handle are visible
/// through all of them.
pub struct Slot<A: Args, R = ()> {
    inner: Arc<SlotInner<A, R>>,
}

impl<A: Args, R> Clone for Slot<A, R> {
    fn clone(&self) -> Self {
        Slot {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Args, R> std::fmt::Debug for Slot<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("name", &self.inner.name)
            .field("signature", &self.inner.signature.to_string())
            .finish()
    }
}

impl<A: Args, R: Send + 'static> Slot<A, R> {
    /// Wrap an infallible closure
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Self::named("slot", f)
    }

    /// Wrap an infallible closure under a debug name
    pub fn named<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Self::from_fn(name.into(), Arc::new(move |args| Ok(f(args))))
    }

    /// Wrap a closure that can fail
    ///
    /// Failures propagate to the emitter for direct and blocking dispatch and
    /// are logged on the worker for asynchronous dispatch.
    pub fn fallible<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        Self::from_fn(name.into(), Arc::new(f))
    }

    fn from_fn(name: String, func: SlotFn<A, R>) -> Self {
        Slot {
            inner: Arc::new(SlotInner {
                name,
                signature: Signature::of::<A, R>(),
                func,
                worker: RwLock::new(None),
                links: SlotLinks::default(),
            }),
        }
    }

    /// Bind to a worker, builder style
    pub fn with_worker(self, worker: Worker) -> Self {
        self.set_worker(Some(worker));
        self
    }

    /// Bind to (or unbind from) a worker
    ///
    /// Takes effect for the next dispatch, including through existing
    /// connections.
    pub fn set_worker(&self, worker: Option<Worker>) {
        *self.inner.worker.write() = worker;
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Argument and return types
    pub fn signature(&self) -> &Signature {
        &self.inner.signature
    }

    /// Bound worker
    pub fn worker(&self) -> Option<Worker> {
        self.inner.worker.read().clone()
    }

    fn require_worker(&self) -> Result<Worker> {
        self.worker().ok_or_else(|| ComError::NoWorker {
            slot: self.inner.name.clone(),
        })
    }

    /// Number of live connections targeting this slot
    pub fn connection_count(&self) -> usize {
        self.inner.links.count()
    }

    /// Disconnect every signal connected to this slot
    pub fn disconnect_all(&self) {
        self.inner.links.disconnect_all();
    }

    /// Invoke synchronously on the calling thread
    pub fn call(&self, args: A) -> Result<R> {
        (self.inner.func)(args)
    }

    /// Post to the bound worker without waiting
    ///
    /// # Errors
    ///
    /// - [`ComError::NoWorker`] - No worker is bound
    /// - [`ComError::WorkerUnavailable`] - The worker has been stopped
    pub fn async_run(&self, args: A) -> Result<()> {
        let worker = self.require_worker()?;
        let func = self.inner.func.clone();
        worker
            .post(move || func(args).map(|_| ()))
            .map_err(|_| worker.unavailable())
    }

    /// Post to the bound worker and return the pending result
    pub fn async_call(&self, args: A) -> Result<Pending<R>> {
        let worker = self.require_worker()?;
        let func = self.inner.func.clone();
        worker
            .submit(move || func(args))
            .map_err(|_| worker.unavailable())
    }

    /// Post to the bound worker and block until the result is available
    ///
    /// Runs inline when called from the worker's own thread.
    pub fn blocking_call(&self, args: A) -> Result<R> {
        let worker = self.require_worker()?;
        let func = self.inner.func.clone();
        worker
            .post_and_wait(move || func(args))
            .map_err(|e| match e {
                ComError::WorkerStopped { worker } => ComError::WorkerUnavailable { worker },
                other => other,
            })
    }
}

impl<A: Args, R: Send + 'static> SlotBase for Slot<A, R> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn signature(&self) -> &Signature {
        &self.inner.signature
    }

    fn worker(&self) -> Option<Worker> {
        Slot::worker(self)
    }

    fn connection_count(&self) -> usize {
        Slot::connection_count(self)
    }

    fn disconnect_all(&self) {
        Slot::disconnect_all(self)
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn runner(&self) -> Box<dyn Any + Send> {
        let func = self.inner.func.clone();
        let run: RunFn<A> = Arc::new(move |args| func(args).map(|_| ()));
        Box::new(run)
    }

    fn links(&self) -> &SlotLinks {
        &self.inner.links
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_call() {
        let slot = Slot::new(|(a, b): (i32, i32)| a + b);
        assert_eq!(slot.call((2, 3)).unwrap(), 5);
        assert_eq!(slot.signature().to_string(), "fn(i32, i32) -> i32");
    }

    #[test]
    fn test_fallible_call() {
        let slot: Slot<(u8,), u8> = Slot::fallible("checked", |(v,): (u8,)| {
            v.checked_mul(2).ok_or_else(|| ComError::callable("overflow"))
        });
        assert_eq!(slot.call((4,)).unwrap(), 8);
        assert!(matches!(slot.call((200,)), Err(ComError::Callable(_))));
    }

    #[test]
    fn test_async_requires_worker() {
        let slot = Slot::named("lonely", |(): ()| ());
        assert!(matches!(slot.async_run(()), Err(ComError::NoWorker { ref slot }) if slot == "lonely"));
        assert!(matches!(slot.blocking_call(()), Err(ComError::NoWorker { .. })));
    }

    #[test]
    fn test_blocking_call_on_worker() {
        let worker = Worker::spawn("slot-worker").unwrap();
        let slot = Slot::new(|(): ()| std::thread::current().name().map(str::to_string))
            .with_worker(worker.clone());
        assert_eq!(slot.blocking_call(()).unwrap().as_deref(), Some("slot-worker"));

        let pending = slot.async_call(()).unwrap();
        assert_eq!(pending.wait().unwrap().as_deref(), Some("slot-worker"));
    }

    #[test]
    fn test_stopped_worker_is_unavailable() {
        let worker = Worker::spawn("gone").unwrap();
        let slot = Slot::new(|(): ()| ()).with_worker(worker.clone());
        worker.stop();

        assert!(matches!(slot.async_run(()), Err(ComError::WorkerUnavailable { .. })));
        assert!(matches!(slot.blocking_call(()), Err(ComError::WorkerUnavailable { .. })));
    }

    #[test]
    fn test_clones_share_identity() {
        let slot = Slot::new(|(): ()| ());
        let other = slot.clone();
        assert_eq!(SlotBase::identity(&slot), SlotBase::identity(&other));
        assert_ne!(
            SlotBase::identity(&slot),
            SlotBase::identity(&Slot::new(|(): ()| ()))
        );
    }
}
