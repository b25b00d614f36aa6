//! Signals: typed broadcast points
//!
//! A [`Signal`] holds an ordered list of connections. [`Signal::emit`]
//! dispatches the arguments to every connected, unblocked slot according to
//! the [`DispatchMode`] chosen for that connection.
//!
//! # Example
//!
//! ```no_run
//! use igtcom::com::{Signal, Slot};
//!
//! let moved: Signal<(String, f32)> = Signal::named("tool_moved");
//!
//! // A slot may take a prefix of the signal's arguments
//! let log = Slot::new(|(tool,): (String,)| println!("{tool} moved"));
//! let connection = moved.connect(&log)?;
//!
//! moved.emit(("needle".to_string(), 4.2))?;
//! connection.disconnect();
//! # Ok::<(), igtcom::ComError>(())
//! ```

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::com::connection::{Connection, ConnectionCore, ConnectionHost};
use crate::com::signature::{Args, Signature};
use crate::com::slot::{RunFn, SlotBase};
use crate::error::{ComError, Result};
use crate::worker::Pending;

/// How an emission reaches a connected slot
///
/// Chosen per connection, not per slot: the same slot can be connected
/// directly to one signal and asynchronously to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchMode {
    /// Run on the emitting thread; failures propagate to the emitter
    Direct,
    /// Post to the slot's worker and return immediately; failures are logged
    Asynchronous,
    /// Post to the slot's worker and wait; failures propagate to the emitter
    Blocking,
}

struct Entry<A> {
    core: Arc<ConnectionCore>,
    run: RunFn<A>,
    mode: DispatchMode,
    slot: Arc<dyn SlotBase>,
}

struct SignalInner<A> {
    name: String,
    signature: Signature,
    entries: RwLock<Vec<Arc<Entry<A>>>>,
    next_id: AtomicU64,
}

impl<A: Args> ConnectionHost for SignalInner<A> {
    fn detach(&self, id: u64) {
        self.entries.write().retain(|entry| entry.core.id() != id);
    }
}

/// Adapt a slot runner to the signal's argument tuple
///
/// Exact match is a plain downcast; a narrower slot is reached by dropping
/// trailing arguments one at a time.
fn bind<A: Args>(runner: Box<dyn Any + Send>, slot_arity: usize) -> Option<RunFn<A>> {
    if slot_arity > A::ARITY {
        return None;
    }
    if slot_arity == A::ARITY {
        return runner.downcast::<RunFn<A>>().ok().map(|run| *run);
    }
    let narrower = bind::<A::Prefix>(runner, slot_arity)?;
    Some(Arc::new(move |args: A| narrower(args.prefix())))
}

/// Type-erased view of a [`Signal`]
pub trait SignalBase: Send + Sync + 'static {
    /// Debug name
    fn name(&self) -> &str;

    /// Argument types carried by the signal
    fn signature(&self) -> &Signature;

    /// Number of live connections
    fn connection_count(&self) -> usize;

    /// Connect a type-erased slot, checking signatures at runtime
    fn connect_dyn(&self, slot: Arc<dyn SlotBase>, mode: Option<DispatchMode>)
        -> Result<Connection>;

    /// Disconnect every slot
    fn disconnect_all(&self);

    /// Downcast support for typed table lookups
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Broadcast point with a fixed argument tuple `A`
///
/// Dropping the signal disconnects every outstanding connection before the
/// drop completes.
pub struct Signal<A: Args> {
    inner: Arc<SignalInner<A>>,
}

impl<A: Args> std::fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.inner.name)
            .field("signature", &self.inner.signature.to_string())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl<A: Args> Default for Signal<A> {
    fn default() -> Self {
        Self::named("signal")
    }
}

impl<A: Args> Signal<A> {
    /// Create a signal with a default debug name
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a signal under a debug name
    pub fn named(name: impl Into<String>) -> Self {
        Signal {
            inner: Arc::new(SignalInner {
                name: name.into(),
                signature: Signature::of::<A, ()>(),
                entries: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Argument types carried by the signal
    pub fn signature(&self) -> &Signature {
        &self.inner.signature
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Connect a slot with the default dispatch mode
    ///
    /// The mode is [`DispatchMode::Asynchronous`] when the slot is bound to a
    /// worker at connect time, [`DispatchMode::Direct`] otherwise. Connecting
    /// the same slot twice creates two independent connections.
    ///
    /// # Errors
    ///
    /// - [`ComError::SignatureMismatch`] - The slot's arguments are not a
    ///   prefix of the signal's
    pub fn connect<S>(&self, slot: &S) -> Result<Connection>
    where
        S: SlotBase + Clone,
    {
        self.connect_dyn(Arc::new(slot.clone()), None)
    }

    /// Connect a slot with an explicit dispatch mode
    pub fn connect_with<S>(&self, slot: &S, mode: DispatchMode) -> Result<Connection>
    where
        S: SlotBase + Clone,
    {
        self.connect_dyn(Arc::new(slot.clone()), Some(mode))
    }

    /// Connect a type-erased slot
    pub fn connect_dyn(
        &self,
        slot: Arc<dyn SlotBase>,
        mode: Option<DispatchMode>,
    ) -> Result<Connection> {
        let mismatch = || ComError::SignatureMismatch {
            expected: self.inner.signature.to_string(),
            actual: slot.signature().to_string(),
        };
        if !slot.signature().accepts(&self.inner.signature) {
            return Err(mismatch());
        }
        let run = bind::<A>(slot.runner(), slot.signature().arity()).ok_or_else(mismatch)?;

        let mode = mode.unwrap_or(if slot.worker().is_some() {
            DispatchMode::Asynchronous
        } else {
            DispatchMode::Direct
        });

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let label = format!("{}#{} -> {}", self.inner.name, id, slot.name());
        let host: Weak<dyn ConnectionHost> = Arc::downgrade(&self.inner) as Weak<dyn ConnectionHost>;
        let core = Arc::new(ConnectionCore::new(id, host, label));

        {
            // Attach and publish under the write lock so emit never sees a
            // half-connected slot
            let mut entries = self.inner.entries.write();
            slot.links().attach(&core);
            entries.push(Arc::new(Entry {
                core: core.clone(),
                run,
                mode,
                slot: slot.clone(),
            }));
        }

        debug!(
            signal = %self.inner.name,
            slot = %slot.name(),
            mode = ?mode,
            "Slot connected"
        );
        Ok(Connection::new(core))
    }

    /// Disconnect every connection to `slot`; returns how many were removed
    pub fn disconnect_slot(&self, slot: &dyn SlotBase) -> usize {
        let identity = slot.identity();
        let matching: Vec<_> = self
            .inner
            .entries
            .read()
            .iter()
            .filter(|entry| entry.slot.identity() == identity)
            .cloned()
            .collect();

        matching
            .iter()
            .filter(|entry| entry.core.disconnect())
            .count()
    }

    /// Disconnect every slot
    pub fn disconnect_all(&self) {
        let entries = std::mem::take(&mut *self.inner.entries.write());
        for entry in &entries {
            entry.core.sever();
        }
        if !entries.is_empty() {
            debug!(signal = %self.inner.name, count = entries.len(), "All slots disconnected");
        }
    }

    fn snapshot(&self) -> Vec<Arc<Entry<A>>> {
        self.inner.entries.read().clone()
    }

    /// Dispatch `args` to every connected, unblocked slot in connection order
    ///
    /// Every slot is dispatched even if an earlier one fails; the first
    /// failure is returned.
    ///
    /// Blocking connections wait on the slot's worker, so do not emit a
    /// signal with blocking connections from inside an async runtime.
    ///
    /// # Errors
    ///
    /// - Any error returned by a direct or blocking slot
    /// - [`ComError::WorkerUnavailable`] / [`ComError::NoWorker`] - A blocking
    ///   connection's worker is gone or missing
    pub fn emit(&self, args: A) -> Result<()> {
        trace!(signal = %self.inner.name, "Emit");
        let mut first_error = None;
        for entry in self.snapshot() {
            if let Err(e) = self.dispatch(&entry, args.clone(), entry.mode) {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!(signal = %self.inner.name, slot = %entry.slot.name(), error = %e, "Slot failed");
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Post `args` to every connected slot's worker without waiting
    ///
    /// Connections whose slot has no worker are skipped with a diagnostic.
    pub fn async_emit(&self, args: A) {
        trace!(signal = %self.inner.name, "Async emit");
        for entry in self.snapshot() {
            // Asynchronous dispatch never reports errors to the emitter
            let _ = self.dispatch(&entry, args.clone(), DispatchMode::Asynchronous);
        }
    }

    fn dispatch(&self, entry: &Entry<A>, args: A, mode: DispatchMode) -> Result<()> {
        match mode {
            DispatchMode::Direct => entry.core.invoke(|| (entry.run)(args)).unwrap_or(Ok(())),
            DispatchMode::Asynchronous => {
                let posted = entry.core.invoke(|| -> Result<()> {
                    let worker = self.worker_of(entry)?;
                    let run = entry.run.clone();
                    worker
                        .post(move || run(args))
                        .map_err(|_| worker.unavailable())
                });
                if let Some(Err(e)) = posted {
                    warn!(
                        signal = %self.inner.name,
                        slot = %entry.slot.name(),
                        error = %e,
                        "Asynchronous dispatch dropped"
                    );
                }
                Ok(())
            }
            DispatchMode::Blocking => {
                // Only the post happens under the connection gate; waiting
                // there would deadlock a slot that disconnects itself
                let posted = entry.core.invoke(|| -> Result<Option<Pending<()>>> {
                    let worker = self.worker_of(entry)?;
                    if worker.is_current() {
                        (entry.run)(args)?;
                        return Ok(None);
                    }
                    let run = entry.run.clone();
                    worker
                        .submit(move || run(args))
                        .map(Some)
                        .map_err(|_| worker.unavailable())
                });
                match posted {
                    None | Some(Ok(None)) => Ok(()),
                    Some(Ok(Some(pending))) => pending.wait(),
                    Some(Err(e)) => Err(e),
                }
            }
        }
    }

    fn worker_of(&self, entry: &Entry<A>) -> Result<crate::worker::Worker> {
        entry.slot.worker().ok_or_else(|| ComError::NoWorker {
            slot: entry.slot.name().to_string(),
        })
    }
}

impl<A: Args> Drop for Signal<A> {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

impl<A: Args> SignalBase for Signal<A> {
    fn name(&self) -> &str {
        Signal::name(self)
    }

    fn signature(&self) -> &Signature {
        Signal::signature(self)
    }

    fn connection_count(&self) -> usize {
        Signal::connection_count(self)
    }

    fn connect_dyn(
        &self,
        slot: Arc<dyn SlotBase>,
        mode: Option<DispatchMode>,
    ) -> Result<Connection> {
        Signal::connect_dyn(self, slot, mode)
    }

    fn disconnect_all(&self) {
        Signal::disconnect_all(self)
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::Slot;
    use crate::worker::Worker;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, Slot<(u32,)>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let slot = Slot::new(move |(_,): (u32,)| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, slot)
    }

    #[test]
    fn test_emit_invokes_once_per_connection() {
        let signal: Signal<(u32,)> = Signal::new();
        let (count, slot) = counter();

        signal.connect(&slot).unwrap();
        signal.emit((1,)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Same pair twice: two independent connections
        signal.connect(&slot).unwrap();
        signal.emit((2,)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(slot.connection_count(), 2);
    }

    #[test]
    fn test_emission_follows_connection_order() {
        let signal: Signal<()> = Signal::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            let slot = Slot::new(move |(): ()| order.lock().push(i));
            signal.connect(&slot).unwrap();
        }
        signal.emit(()).unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_signature_mismatch() {
        let signal: Signal<(u32, String)> = Signal::named("typed");
        let wrong = Slot::new(|(_,): (String,)| ());
        let too_wide = Slot::new(|(_, _, _): (u32, String, bool)| ());

        assert!(matches!(signal.connect(&wrong), Err(ComError::SignatureMismatch { .. })));
        assert!(matches!(signal.connect(&too_wide), Err(ComError::SignatureMismatch { .. })));
        assert_eq!(signal.connection_count(), 0);
    }

    #[test]
    fn test_prefix_slot_receives_leading_arguments() {
        let signal: Signal<(u32, String, bool)> = Signal::new();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let slot = Slot::new(move |(n,): (u32,)| *s.lock() = Some(n));
        signal.connect(&slot).unwrap();

        signal.emit((9, "ignored".to_string(), true)).unwrap();
        assert_eq!(*seen.lock(), Some(9));
    }

    #[test]
    fn test_block_and_disconnect() {
        let signal: Signal<(u32,)> = Signal::new();
        let (count, slot) = counter();
        let connection = signal.connect(&slot).unwrap();

        connection.block();
        signal.emit((1,)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        connection.unblock();
        signal.emit((1,)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        connection.disconnect();
        signal.emit((1,)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.connection_count(), 0);
        assert_eq!(slot.connection_count(), 0);
    }

    #[test]
    fn test_direct_failure_propagates_after_all_slots() {
        let signal: Signal<()> = Signal::new();
        let failing = Slot::<()>::fallible("failing", |(): ()| Err(ComError::callable("no pose")));
        let (count, counting) = counter();
        let counting = Slot::new(move |(): ()| counting.call((0,)).unwrap());

        signal.connect(&failing).unwrap();
        signal.connect(&counting).unwrap();

        let result = signal.emit(());
        assert!(matches!(result, Err(ComError::Callable(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_self_disconnect() {
        let signal: Signal<()> = Signal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let connection: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));

        let c = calls.clone();
        let conn = connection.clone();
        let slot = Slot::new(move |(): ()| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(conn) = conn.lock().as_ref() {
                conn.disconnect();
            }
        });
        *connection.lock() = Some(signal.connect(&slot).unwrap());

        signal.emit(()).unwrap();
        signal.emit(()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_self_disconnect_through_worker() {
        let worker = Worker::spawn("disconnector").unwrap();
        let signal = Arc::new(Signal::<()>::named("handoff"));
        let calls = Arc::new(AtomicUsize::new(0));
        let connection: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));

        let c = calls.clone();
        let conn = connection.clone();
        let w = worker.clone();
        let slot = Slot::fallible("handoff", move |(): ()| {
            c.fetch_add(1, Ordering::SeqCst);
            let Some(conn) = conn.lock().clone() else {
                return Ok(());
            };
            w.post_and_wait(move || {
                conn.disconnect();
                Ok(())
            })
        });
        *connection.lock() = Some(signal.connect(&slot).unwrap());

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let emitter = signal.clone();
        thread::spawn(move || {
            let _ = done_tx.send(emitter.emit(()));
        });
        let result = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.is_ok());

        signal.emit(()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(signal.connection_count(), 0);
        assert_eq!(slot.connection_count(), 0);
    }

    #[test]
    fn test_asynchronous_dispatch_on_worker() {
        let worker = Worker::spawn("async-slot").unwrap();
        let signal: Signal<(u32,)> = Signal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let slot = Slot::new(move |(n,): (u32,)| {
            s.lock().push((n, thread::current().name().map(str::to_string)));
        })
        .with_worker(worker.clone());

        signal.connect(&slot).unwrap();
        for n in 0..10 {
            signal.emit((n,)).unwrap();
        }
        worker.post_and_wait(|| Ok(())).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 10);
        assert!(seen.iter().map(|(n, _)| *n).eq(0..10));
        assert!(seen.iter().all(|(_, name)| name.as_deref() == Some("async-slot")));
    }

    #[test]
    fn test_asynchronous_failure_is_not_surfaced() {
        let worker = Worker::spawn("async-fail").unwrap();
        let signal: Signal<()> = Signal::new();
        let slot = Slot::<()>::fallible("bad", |(): ()| Err(ComError::callable("dropped frame")))
            .with_worker(worker.clone());
        signal.connect(&slot).unwrap();

        assert!(signal.emit(()).is_ok());
        worker.post_and_wait(|| Ok(())).unwrap();
        assert_eq!(worker.last_error().as_deref(), Some("Callable failed: dropped frame"));
    }

    #[test]
    fn test_blocking_dispatch_propagates() {
        let worker = Worker::spawn("blocking").unwrap();
        let signal: Signal<(u32,)> = Signal::new();
        let slot = Slot::fallible("guard", |(n,): (u32,)| {
            if n > 10 {
                Err(ComError::callable("out of range"))
            } else {
                Ok(())
            }
        })
        .with_worker(worker.clone());
        signal
            .connect_with(&slot, DispatchMode::Blocking)
            .unwrap();

        assert!(signal.emit((3,)).is_ok());
        assert!(matches!(signal.emit((42,)), Err(ComError::Callable(_))));

        worker.stop();
        assert!(matches!(signal.emit((1,)), Err(ComError::WorkerUnavailable { .. })));
    }

    #[test]
    fn test_async_emit_skips_slots_without_worker() {
        let signal: Signal<(u32,)> = Signal::new();
        let (count, slot) = counter();
        signal.connect(&slot).unwrap();
        signal.async_emit((1,));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_disconnects() {
        let (_, slot) = counter();
        let connection = {
            let signal: Signal<(u32,)> = Signal::new();
            signal.connect(&slot).unwrap()
        };
        assert!(!connection.is_connected());
        assert_eq!(slot.connection_count(), 0);
    }

    #[test]
    fn test_disconnect_slot() {
        let signal: Signal<(u32,)> = Signal::new();
        let (count, slot) = counter();
        let (_, other) = counter();
        signal.connect(&slot).unwrap();
        signal.connect(&slot).unwrap();
        signal.connect(&other).unwrap();

        assert_eq!(signal.disconnect_slot(&slot), 2);
        assert_eq!(signal.connection_count(), 1);
        signal.emit((0,)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disconnect_races_with_emit() {
        let signal = Arc::new(Signal::<(u32,)>::new());
        let after_disconnect = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let flag = disconnected.clone();
        let late = after_disconnect.clone();
        let slot = Slot::new(move |(_,): (u32,)| {
            if flag.load(Ordering::SeqCst) {
                late.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(50));
        });
        let connection = signal.connect(&slot).unwrap();

        let emitters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                thread::spawn(move || {
                    for n in 0..200 {
                        signal.emit((n,)).unwrap();
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(2));
        connection.disconnect();
        disconnected.store(true, Ordering::SeqCst);

        for emitter in emitters {
            emitter.join().unwrap();
        }
        assert_eq!(after_disconnect.load(Ordering::SeqCst), 0);
    }
}
