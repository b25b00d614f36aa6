//! Timestamped buffer history
//!
//! A [`Timeline`] keeps an ordered, bounded history of immutable
//! [`Buffer`]s of one payload kind. Producers push from any thread;
//! consumers connect to the timeline's signals and query the buffer closest
//! to the instant they care about.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use igtcom::com::Slot;
//! use igtcom::timeline::{Buffer, Direction, MatrixTl, Matrix4, Timestamp};
//!
//! let poses = Arc::new(MatrixTl::named("poses"));
//!
//! let reader = poses.clone();
//! let on_push = Slot::new(move |(ts,): (Timestamp,)| {
//!     if let Some(buffer) = reader.closest_buffer(ts, Direction::Nearest) {
//!         println!("pose at {ts}: {:?}", buffer.element(0));
//!     }
//! });
//! poses.pushed().connect(&on_push)?;
//!
//! poses.push(Buffer::single(Timestamp::now(), Matrix4::translation(1.0, 2.0, 3.0)))?;
//! # Ok::<(), igtcom::ComError>(())
//! ```

pub mod buffer;
pub mod synchronizer;
pub mod timestamp;
pub mod types;

pub use buffer::{Buffer, MAX_POOL_SIZE};
pub use synchronizer::{SyncMember, SyncPoint, Synchronizer, SynchronizerConfig};
pub use timestamp::Timestamp;
pub use types::{Frame, FrameTl, Matrix4, MatrixTl, MessageTl, TrackingMessage};

use std::any::Any;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::com::{Signal, SignalTable};
use crate::error::{ComError, Result};
use crate::registry::Registry;

/// Signal keys published in [`Timeline::signals`]
pub mod signals {
    /// Emitted with the buffer's timestamp after every push
    pub const PUSHED: &str = "pushed";
    /// Emitted once after the timeline is cleared
    pub const CLEARED: &str = "cleared";
}

/// How much history a timeline keeps
///
/// Both bounds apply when both are set. Age is measured from the newest
/// entry, not from the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    /// Maximum number of buffers
    pub max_count: Option<usize>,
    /// Maximum distance from the newest buffer
    pub max_age: Option<Duration>,
}

impl Default for Retention {
    fn default() -> Self {
        Self::count(1000)
    }
}

impl Retention {
    fn validate(&self) -> Result<()> {
        if self.max_count == Some(0) {
            return Err(ComError::InvalidRetention);
        }
        Ok(())
    }

    /// Keep at most `max_count` buffers
    pub fn count(max_count: usize) -> Self {
        Retention {
            max_count: Some(max_count),
            max_age: None,
        }
    }

    /// Keep buffers no older than `max_age` relative to the newest
    pub fn duration(max_age: Duration) -> Self {
        Retention {
            max_count: None,
            max_age: Some(max_age),
        }
    }

    /// Keep everything
    pub fn unbounded() -> Self {
        Retention {
            max_count: None,
            max_age: None,
        }
    }

    /// Add an age bound, builder style
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Timeline settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// Element slots per buffer (1 to 64)
    pub pool_size: usize,
    /// History bound
    pub retention: Retention,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        TimelineConfig {
            pool_size: 1,
            retention: Retention::default(),
        }
    }
}

impl TimelineConfig {
    /// Config with a custom pool size
    pub fn with_pool_size(pool_size: usize) -> Self {
        TimelineConfig {
            pool_size,
            ..Default::default()
        }
    }

    /// Replace the retention policy, builder style
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }
}

/// Which side of a timestamp a query may look at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Exact match or the newest entry before
    Past,
    /// Exact match or the oldest entry after
    Future,
    /// Closest on either side; ties go to the past
    Nearest,
}

struct State<T> {
    buffers: BTreeMap<Timestamp, Arc<Buffer<T>>>,
    config: TimelineConfig,
}

impl<T> State<T> {
    /// Drop entries outside the retention window; returns how many went
    fn evict(&mut self) -> usize {
        let before = self.buffers.len();
        let retention = self.config.retention;

        if let (Some(max_age), Some(newest)) =
            (retention.max_age, self.buffers.keys().next_back().copied())
        {
            let cutoff = newest.saturating_sub(max_age);
            self.buffers = self.buffers.split_off(&cutoff);
        }
        if let Some(max_count) = retention.max_count {
            while self.buffers.len() > max_count {
                self.buffers.pop_first();
            }
        }

        before - self.buffers.len()
    }
}

/// Ordered, bounded history of timestamped buffers
///
/// Share it behind an `Arc`: every operation takes `&self`. Writers are
/// serialized by a single lock; signals are emitted after it is released,
/// so slots may query the timeline freely.
pub struct Timeline<T> {
    name: String,
    state: RwLock<State<T>>,
    pushed: Arc<Signal<(Timestamp,)>>,
    cleared: Arc<Signal<()>>,
    signals: SignalTable,
}

impl<T> std::fmt::Debug for Timeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Timeline")
            .field("name", &self.name)
            .field("len", &state.buffers.len())
            .field("config", &state.config)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Timeline<T> {
    /// Timeline with default settings (pool size 1, 1000 buffers)
    pub fn named(name: impl Into<String>) -> Self {
        Self::build(name.into(), TimelineConfig::default())
    }

    /// Timeline with custom settings
    ///
    /// # Errors
    ///
    /// - [`ComError::InvalidPoolSize`] - Pool size is 0 or above 64
    /// - [`ComError::InvalidRetention`] - Retention keeps zero buffers
    pub fn with_config(name: impl Into<String>, config: TimelineConfig) -> Result<Self> {
        buffer::validate_pool_size(config.pool_size)?;
        config.retention.validate()?;
        Ok(Self::build(name.into(), config))
    }

    fn build(name: String, config: TimelineConfig) -> Self {
        let pushed = Arc::new(Signal::named(format!("{name}.{}", signals::PUSHED)));
        let cleared = Arc::new(Signal::named(format!("{name}.{}", signals::CLEARED)));

        let mut table = SignalTable::new();
        table.insert(signals::PUSHED, pushed.clone());
        table.insert(signals::CLEARED, cleared.clone());

        Timeline {
            name,
            state: RwLock::new(State {
                buffers: BTreeMap::new(),
                config,
            }),
            pushed,
            cleared,
            signals: table,
        }
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current settings
    pub fn config(&self) -> TimelineConfig {
        self.state.read().config
    }

    /// Replace the retention policy and evict immediately
    ///
    /// # Errors
    ///
    /// - [`ComError::InvalidRetention`] - Retention keeps zero buffers
    pub fn set_retention(&self, retention: Retention) -> Result<()> {
        retention.validate()?;
        let mut state = self.state.write();
        state.config.retention = retention;
        let evicted = state.evict();
        if evicted > 0 {
            debug!(timeline = %self.name, evicted, "Retention tightened");
        }
        Ok(())
    }

    /// Published signals, keyed by [`signals::PUSHED`] and [`signals::CLEARED`]
    pub fn signals(&self) -> &SignalTable {
        &self.signals
    }

    /// Signal emitted with the timestamp of every pushed buffer
    pub fn pushed(&self) -> &Signal<(Timestamp,)> {
        &self.pushed
    }

    /// Signal emitted once per [`clear`](Timeline::clear)
    pub fn cleared(&self) -> &Signal<()> {
        &self.cleared
    }

    /// Empty buffer sized for this timeline
    pub fn create_buffer(&self, timestamp: Timestamp) -> Buffer<T> {
        Buffer::empty(timestamp, self.state.read().config.pool_size)
    }

    /// Whether `buffer` has this timeline's pool size
    pub fn is_buffer_compatible(&self, buffer: &Buffer<T>) -> bool {
        buffer.pool_size() == self.state.read().config.pool_size
    }

    /// Store `buffer` at its timestamp, evict, then emit "pushed"
    ///
    /// A buffer already stored at the same timestamp is replaced. A buffer
    /// older than the age bound allows is dropped at once and not announced.
    ///
    /// # Errors
    ///
    /// - [`ComError::IncompatibleBuffer`] - Pool size differs from the timeline's
    /// - Any failure of a direct slot connected to "pushed"; the buffer stays stored
    pub fn push(&self, buffer: Buffer<T>) -> Result<()> {
        self.push_object(Arc::new(buffer))
    }

    /// As [`push`](Timeline::push) for a buffer that is already shared
    pub fn push_object(&self, buffer: Arc<Buffer<T>>) -> Result<()> {
        let timestamp = buffer.timestamp();
        {
            let mut state = self.state.write();
            if buffer.pool_size() != state.config.pool_size {
                return Err(ComError::IncompatibleBuffer {
                    expected: state.config.pool_size,
                    actual: buffer.pool_size(),
                });
            }
            state.buffers.insert(timestamp, buffer);
            let evicted = state.evict();
            if !state.buffers.contains_key(&timestamp) {
                trace!(timeline = %self.name, timestamp = %timestamp, "Pushed buffer already out of retention");
                return Ok(());
            }
            trace!(
                timeline = %self.name,
                timestamp = %timestamp,
                len = state.buffers.len(),
                evicted,
                "Buffer pushed"
            );
        }
        self.pushed.emit((timestamp,))
    }

    /// Exact lookup
    pub fn buffer(&self, timestamp: Timestamp) -> Option<Arc<Buffer<T>>> {
        self.state.read().buffers.get(&timestamp).cloned()
    }

    /// Buffer closest to `timestamp` on the side allowed by `direction`
    pub fn closest_buffer(
        &self,
        timestamp: Timestamp,
        direction: Direction,
    ) -> Option<Arc<Buffer<T>>> {
        let state = self.state.read();
        let past = || state.buffers.range(..=timestamp).next_back();
        let future = || state.buffers.range(timestamp..).next();

        let found = match direction {
            Direction::Past => past(),
            Direction::Future => future(),
            Direction::Nearest => match (past(), future()) {
                (Some(p), Some(f)) => {
                    if timestamp.distance(*f.0) < timestamp.distance(*p.0) {
                        Some(f)
                    } else {
                        Some(p)
                    }
                }
                (p, f) => p.or(f),
            },
        };
        found.map(|(_, buffer)| buffer.clone())
    }

    /// Oldest buffer strictly after `timestamp`
    pub fn newer_buffer(&self, timestamp: Timestamp) -> Option<Arc<Buffer<T>>> {
        self.state
            .read()
            .buffers
            .range((Bound::Excluded(timestamp), Bound::Unbounded))
            .next()
            .map(|(_, buffer)| buffer.clone())
    }

    /// Newest buffer strictly before `timestamp`
    pub fn older_buffer(&self, timestamp: Timestamp) -> Option<Arc<Buffer<T>>> {
        self.state
            .read()
            .buffers
            .range(..timestamp)
            .next_back()
            .map(|(_, buffer)| buffer.clone())
    }

    /// Most recent buffer
    pub fn newest_buffer(&self) -> Option<Arc<Buffer<T>>> {
        self.state
            .read()
            .buffers
            .last_key_value()
            .map(|(_, buffer)| buffer.clone())
    }

    /// Timestamp of the most recent buffer
    pub fn newest_timestamp(&self) -> Option<Timestamp> {
        self.state.read().buffers.keys().next_back().copied()
    }

    /// Timestamp of the oldest buffer
    pub fn oldest_timestamp(&self) -> Option<Timestamp> {
        self.state.read().buffers.keys().next().copied()
    }

    /// Remove and return the buffer stored exactly at `timestamp`
    pub fn pop_buffer(&self, timestamp: Timestamp) -> Option<Arc<Buffer<T>>> {
        self.state.write().buffers.remove(&timestamp)
    }

    /// Stored timestamps, oldest first
    pub fn timestamps(&self) -> Vec<Timestamp> {
        self.state.read().buffers.keys().copied().collect()
    }

    /// Number of stored buffers
    pub fn len(&self) -> usize {
        self.state.read().buffers.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.state.read().buffers.is_empty()
    }

    /// Drop every buffer, then emit "cleared" once
    pub fn clear(&self) -> Result<()> {
        let dropped = {
            let mut state = self.state.write();
            std::mem::take(&mut state.buffers).len()
        };
        debug!(timeline = %self.name, dropped, "Timeline cleared");
        self.cleared.emit(())
    }
}

impl<T: Clone + Send + Sync + 'static> Timeline<T> {
    /// Replace contents and settings with a deep copy of `other`
    ///
    /// Buffers are cloned, not shared, so the two timelines evolve
    /// independently afterwards. No signal is emitted.
    pub fn copy_from(&self, other: &Timeline<T>) {
        if std::ptr::eq(self, other) {
            return;
        }
        let (buffers, config) = {
            let source = other.state.read();
            let buffers: BTreeMap<_, _> = source
                .buffers
                .iter()
                .map(|(ts, buffer)| (*ts, Arc::new((**buffer).clone())))
                .collect();
            (buffers, source.config)
        };

        let mut state = self.state.write();
        state.buffers = buffers;
        state.config = config;
        debug!(timeline = %self.name, from = %other.name, len = state.buffers.len(), "Timeline copied");
    }
}

/// Type-erased view of a [`Timeline`]
pub trait AnyTimeline: Send + Sync + 'static {
    /// Debug name
    fn name(&self) -> &str;

    /// Payload type name
    fn payload(&self) -> &'static str;

    /// Number of stored buffers
    fn len(&self) -> usize;

    /// Whether nothing is stored
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp of the most recent buffer
    fn newest_timestamp(&self) -> Option<Timestamp>;

    /// Timestamp of the oldest buffer
    fn oldest_timestamp(&self) -> Option<Timestamp>;

    /// Drop every buffer and emit "cleared"
    fn clear(&self) -> Result<()>;

    /// Published signals
    fn signals(&self) -> &SignalTable;

    /// Downcast support for typed access
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + Sync + 'static> AnyTimeline for Timeline<T> {
    fn name(&self) -> &str {
        Timeline::name(self)
    }

    fn payload(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn len(&self) -> usize {
        Timeline::len(self)
    }

    fn newest_timestamp(&self) -> Option<Timestamp> {
        Timeline::newest_timestamp(self)
    }

    fn oldest_timestamp(&self) -> Option<Timestamp> {
        Timeline::oldest_timestamp(self)
    }

    fn clear(&self) -> Result<()> {
        Timeline::clear(self)
    }

    fn signals(&self) -> &SignalTable {
        Timeline::signals(self)
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Recover the concrete timeline behind a type-erased one
pub fn downcast<T: Send + Sync + 'static>(timeline: Arc<dyn AnyTimeline>) -> Option<Arc<Timeline<T>>> {
    timeline.as_any_arc().downcast::<Timeline<T>>().ok()
}

/// Register the shipped timeline kinds in `registry`
///
/// Keys: `MatrixTl`, `MessageTl`, `FrameTl`.
pub fn register(registry: &mut Registry) {
    registry.register_timeline_factory("MatrixTl", |name| {
        Arc::new(MatrixTl::named(name)) as Arc<dyn AnyTimeline>
    });
    registry.register_timeline_factory("MessageTl", |name| {
        Arc::new(MessageTl::named(name)) as Arc<dyn AnyTimeline>
    });
    registry.register_timeline_factory("FrameTl", |name| {
        Arc::new(FrameTl::named(name)) as Arc<dyn AnyTimeline>
    });
}
