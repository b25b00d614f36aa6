//! Connection handles and their state machine
//!
//! A [`Connection`] ties one signal to one slot. It holds no strong reference
//! to either endpoint: the signal is reached through a weak link when the
//! connection is removed, and the slot keeps only weak references back to its
//! connections.
//!
//! # State machine
//!
//! ```text
//! Connected <-> Blocked
//!     \           /
//!      Disconnected   (terminal)
//! ```

use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

const CONNECTED: u8 = 0;
const BLOCKED: u8 = 1;
const DISCONNECTED: u8 = 2;

/// Observable state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Emissions reach the slot
    Connected,
    /// Emissions skip the slot until unblocked
    Blocked,
    /// Terminal; the slot is never invoked again through this connection
    Disconnected,
}

impl ConnectionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            CONNECTED => ConnectionState::Connected,
            BLOCKED => ConnectionState::Blocked,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Owner of a connection list, notified when a connection goes away
pub(crate) trait ConnectionHost: Send + Sync {
    fn detach(&self, id: u64);
}

thread_local! {
    // Connections whose slot is currently running on this thread
    static INVOKING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct InvokingGuard(usize);

impl InvokingGuard {
    fn enter(key: usize) -> Self {
        INVOKING.with(|active| active.borrow_mut().push(key));
        InvokingGuard(key)
    }

    fn is_active(key: usize) -> bool {
        INVOKING.with(|active| active.borrow().contains(&key))
    }
}

/// Invocations running on the calling thread
pub(crate) fn current_invocations() -> Vec<usize> {
    INVOKING.with(|active| active.borrow().clone())
}

/// Invocations another thread is parked in while this one works for it
pub(crate) struct InheritedInvocations {
    _guards: Vec<InvokingGuard>,
}

/// Treat `keys` as running on this thread until the guard drops
///
/// A thread doing work that a parked slot invocation waits on may then
/// disconnect that invocation's connection without waiting for it.
pub(crate) fn inherit(keys: Vec<usize>) -> InheritedInvocations {
    InheritedInvocations {
        _guards: keys.into_iter().map(InvokingGuard::enter).collect(),
    }
}

impl Drop for InvokingGuard {
    fn drop(&mut self) {
        INVOKING.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|k| *k == self.0) {
                active.remove(pos);
            }
        });
    }
}

/// Shared bookkeeping behind every [`Connection`] handle
pub(crate) struct ConnectionCore {
    id: u64,
    state: AtomicU8,
    // Shared while the slot is being dispatched, exclusive while disconnecting
    gate: RwLock<()>,
    host: Weak<dyn ConnectionHost>,
    label: String,
}

impl ConnectionCore {
    pub(crate) fn new(id: u64, host: Weak<dyn ConnectionHost>, label: String) -> Self {
        ConnectionCore {
            id,
            state: AtomicU8::new(CONNECTED),
            gate: RwLock::new(()),
            host,
            label,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn key(&self) -> usize {
        self as *const ConnectionCore as usize
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_raw(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == DISCONNECTED
    }

    /// Run `f` if the connection is `Connected`, atomically with respect to
    /// `disconnect`.
    pub(crate) fn invoke<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        // Recursive read so a slot re-emitting its own signal cannot stall
        // behind a pending disconnect
        let _gate = self.gate.read_recursive();
        if self.state.load(Ordering::SeqCst) != CONNECTED {
            return None;
        }
        let _active = InvokingGuard::enter(self.key());
        Some(f())
    }

    /// Mark disconnected and wait for invocations running on other threads.
    ///
    /// Invocations on this thread, or inherited from a thread parked in
    /// [`Worker::post_and_wait`](crate::worker::Worker::post_and_wait), are
    /// not waited for.
    ///
    /// Returns false if the connection was already disconnected.
    pub(crate) fn sever(&self) -> bool {
        if self.state.swap(DISCONNECTED, Ordering::SeqCst) == DISCONNECTED {
            return false;
        }
        // A slot disconnecting itself lets its current invocation finish
        if !InvokingGuard::is_active(self.key()) {
            drop(self.gate.write());
        }
        true
    }

    /// Sever and remove from the owning signal
    pub(crate) fn disconnect(&self) -> bool {
        if !self.sever() {
            return false;
        }
        if let Some(host) = self.host.upgrade() {
            host.detach(self.id);
        }
        debug!(connection = %self.label, "Disconnected");
        true
    }

    fn set_blocked(&self, blocked: bool) -> bool {
        let (from, to) = if blocked {
            (CONNECTED, BLOCKED)
        } else {
            (BLOCKED, CONNECTED)
        };
        let changed = self
            .state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if changed {
            trace!(connection = %self.label, blocked, "Connection block state changed");
        }
        changed
    }
}

/// Weak back-references from a slot to the connections that target it
#[doc(hidden)]
#[derive(Default)]
pub struct SlotLinks {
    links: Mutex<Vec<Weak<ConnectionCore>>>,
}

impl SlotLinks {
    pub(crate) fn attach(&self, core: &Arc<ConnectionCore>) {
        let mut links = self.links.lock();
        links.retain(|link| link.upgrade().is_some_and(|c| !c.is_disconnected()));
        links.push(Arc::downgrade(core));
    }

    pub(crate) fn count(&self) -> usize {
        self.links
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_disconnected())
            .count()
    }

    pub(crate) fn disconnect_all(&self) {
        let cores: Vec<_> = self
            .links
            .lock()
            .drain(..)
            .filter_map(|link| link.upgrade())
            .collect();
        for core in cores {
            core.disconnect();
        }
    }
}

/// Handle to one signal-to-slot binding
///
/// Cloning yields another handle to the same binding. Dropping a handle does
/// not disconnect; use [`Connection::disconnect`] or a [`ConnectionSet`].
#[derive(Clone)]
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.core.label)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(core: Arc<ConnectionCore>) -> Self {
        Connection { core }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Whether the connection has not been disconnected (blocked counts)
    pub fn is_connected(&self) -> bool {
        !self.core.is_disconnected()
    }

    /// Whether dispatch is currently suppressed
    pub fn is_blocked(&self) -> bool {
        self.state() == ConnectionState::Blocked
    }

    /// Disconnect; idempotent and safe from any thread
    ///
    /// When this returns no invocation through this connection will start,
    /// and none is running except the one this call is made on behalf of.
    /// That is the slot's own invocation when called from inside the slot,
    /// or from a worker task the slot waits on with
    /// [`Worker::post_and_wait`](crate::worker::Worker::post_and_wait); it
    /// completes normally. Tasks already posted to a worker are not
    /// cancelled.
    ///
    /// A slot must not hand its own disconnect to a plain thread and join
    /// it: that thread waits for the slot to return.
    pub fn disconnect(&self) {
        self.core.disconnect();
    }

    /// Suppress dispatch without disconnecting
    ///
    /// Has no effect on a disconnected connection.
    pub fn block(&self) {
        self.core.set_blocked(true);
    }

    /// Resume dispatch after [`block`](Connection::block)
    pub fn unblock(&self) {
        self.core.set_blocked(false);
    }

    /// Block until the returned guard is dropped
    ///
    /// Used to break feedback loops: a consumer updating state that would
    /// re-trigger the same signal holds the guard during the update.
    pub fn blocker(&self) -> ConnectionBlocker {
        let blocked = self.core.set_blocked(true);
        ConnectionBlocker {
            connection: self.clone(),
            blocked,
        }
    }

    /// Whether two handles refer to the same binding
    pub fn same_connection(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

/// Scoped block on a [`Connection`], released on drop
pub struct ConnectionBlocker {
    connection: Connection,
    blocked: bool,
}

impl Drop for ConnectionBlocker {
    fn drop(&mut self) {
        // Only undo a block this guard put in place
        if self.blocked {
            self.connection.unblock();
        }
    }
}

/// Group of connections disconnected together
///
/// A component typically keeps one set for all the connections it made and
/// drops or clears it on shutdown.
#[derive(Default)]
pub struct ConnectionSet {
    connections: Vec<Connection>,
}

impl ConnectionSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection
    pub fn push(&mut self, connection: Connection) {
        self.connections.push(connection);
    }

    /// Number of connections tracked (including already disconnected ones)
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the set tracks no connection
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Block every connection
    pub fn block_all(&self) {
        self.connections.iter().for_each(Connection::block);
    }

    /// Unblock every connection
    pub fn unblock_all(&self) {
        self.connections.iter().for_each(Connection::unblock);
    }

    /// Disconnect and forget every connection
    pub fn disconnect_all(&mut self) {
        for connection in self.connections.drain(..) {
            connection.disconnect();
        }
    }
}

impl Extend<Connection> for ConnectionSet {
    fn extend<I: IntoIterator<Item = Connection>>(&mut self, iter: I) {
        self.connections.extend(iter);
    }
}

impl Drop for ConnectionSet {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHost {
        detached: AtomicUsize,
    }

    impl ConnectionHost for CountingHost {
        fn detach(&self, _id: u64) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connection(host: &Arc<CountingHost>) -> Connection {
        let weak: Weak<dyn ConnectionHost> = Arc::downgrade(host) as Weak<dyn ConnectionHost>;
        Connection::new(Arc::new(ConnectionCore::new(1, weak, "test".to_string())))
    }

    fn host() -> Arc<CountingHost> {
        Arc::new(CountingHost {
            detached: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_state_transitions() {
        let host = host();
        let conn = connection(&host);
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.block();
        assert_eq!(conn.state(), ConnectionState::Blocked);
        conn.unblock();
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.block();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        // Disconnected is terminal
        conn.unblock();
        conn.block();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let host = host();
        let conn = connection(&host);
        conn.disconnect();
        conn.disconnect();
        conn.clone().disconnect();
        assert_eq!(host.detached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invoke_skips_blocked_and_disconnected() {
        let host = host();
        let conn = connection(&host);
        assert_eq!(conn.core.invoke(|| 1), Some(1));

        conn.block();
        assert_eq!(conn.core.invoke(|| 2), None);

        conn.unblock();
        conn.disconnect();
        assert_eq!(conn.core.invoke(|| 3), None);
    }

    #[test]
    fn test_reentrant_disconnect_completes_invocation() {
        let host = host();
        let conn = connection(&host);
        let inner = conn.clone();
        let result = conn.core.invoke(move || {
            inner.disconnect();
            "finished"
        });
        assert_eq!(result, Some("finished"));
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_blocker_restores_state() {
        let host = host();
        let conn = connection(&host);
        {
            let _blocker = conn.blocker();
            assert!(conn.is_blocked());
        }
        assert_eq!(conn.state(), ConnectionState::Connected);

        // A guard taken on an already blocked connection leaves it blocked
        conn.block();
        drop(conn.blocker());
        assert!(conn.is_blocked());
    }

    #[test]
    fn test_connection_set_disconnects_on_drop() {
        let host = host();
        let a = connection(&host);
        let b = connection(&host);
        {
            let mut set = ConnectionSet::new();
            set.extend([a.clone(), b.clone()]);
            assert_eq!(set.len(), 2);
        }
        assert!(!a.is_connected());
        assert!(!b.is_connected());
    }
}
