//! Multi-timeline synchronization
//!
//! A [`Synchronizer`] watches several timelines (of any payload kind) and
//! picks one instant at which all of the fresh ones can be read together.
//!
//! The newest timestamp over all populated timelines is the reference.
//! Every timeline whose newest timestamp lies strictly within the tolerance
//! of the reference takes part, and the synchronization timestamp is the
//! oldest of those. Each member is then queried at that timestamp minus its
//! own delay.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::com::{Signal, SignalTable};
use crate::error::Result;
use crate::timeline::{AnyTimeline, Timestamp};

/// Signal keys published in [`Synchronizer::signals`]
pub mod signals {
    /// Emitted with the synchronization timestamp
    pub const SYNCHRONIZED: &str = "synchronized";
    /// Emitted when there was nothing new to synchronize
    pub const SKIPPED: &str = "skipped";
}

/// Synchronizer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizerConfig {
    /// Maximum distance from the reference for a timeline to take part
    pub tolerance: Duration,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        SynchronizerConfig {
            tolerance: Duration::from_millis(500),
        }
    }
}

impl SynchronizerConfig {
    /// Config with a custom tolerance
    pub fn with_tolerance(tolerance: Duration) -> Self {
        SynchronizerConfig { tolerance }
    }
}

struct Member {
    timeline: Weak<dyn AnyTimeline>,
    delay: Duration,
}

/// One timeline taking part in a [`SyncPoint`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMember {
    /// Index returned by [`Synchronizer::add_timeline`]
    pub index: usize,
    /// Timeline name
    pub name: String,
    /// Where to read this timeline: the sync timestamp minus its delay
    pub query: Timestamp,
}

/// Outcome of a successful synchronization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPoint {
    /// Synchronization timestamp
    pub timestamp: Timestamp,
    /// Timelines within tolerance, in index order
    pub members: Vec<SyncMember>,
}

/// Picks a common timestamp over several timelines
///
/// Holds only weak references: a dropped timeline simply stops taking part.
pub struct Synchronizer {
    config: SynchronizerConfig,
    members: RwLock<Vec<Member>>,
    last: Mutex<Option<Timestamp>>,
    synchronized: Arc<Signal<(Timestamp,)>>,
    skipped: Arc<Signal<()>>,
    signals: SignalTable,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("config", &self.config)
            .field("members", &self.members.read().len())
            .field("last", &*self.last.lock())
            .finish()
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new(SynchronizerConfig::default())
    }
}

impl Synchronizer {
    /// Create a synchronizer with no timelines
    pub fn new(config: SynchronizerConfig) -> Self {
        let synchronized = Arc::new(Signal::named(signals::SYNCHRONIZED));
        let skipped = Arc::new(Signal::named(signals::SKIPPED));

        let mut table = SignalTable::new();
        table.insert(signals::SYNCHRONIZED, synchronized.clone());
        table.insert(signals::SKIPPED, skipped.clone());

        Synchronizer {
            config,
            members: RwLock::new(Vec::new()),
            last: Mutex::new(None),
            synchronized,
            skipped,
            signals: table,
        }
    }

    /// Settings
    pub fn config(&self) -> SynchronizerConfig {
        self.config
    }

    /// Published signals, keyed by [`signals::SYNCHRONIZED`] and [`signals::SKIPPED`]
    pub fn signals(&self) -> &SignalTable {
        &self.signals
    }

    /// Signal emitted with each new synchronization timestamp
    pub fn synchronized(&self) -> &Signal<(Timestamp,)> {
        &self.synchronized
    }

    /// Signal emitted when a synchronization is skipped
    pub fn skipped(&self) -> &Signal<()> {
        &self.skipped
    }

    /// Watch `timeline`, read `delay` earlier than the sync timestamp
    ///
    /// Returns the member index used in [`SyncPoint::members`].
    pub fn add_timeline(&self, timeline: &Arc<dyn AnyTimeline>, delay: Duration) -> usize {
        let mut members = self.members.write();
        members.push(Member {
            timeline: Arc::downgrade(timeline),
            delay,
        });
        debug!(timeline = %timeline.name(), delay_ms = delay.as_millis() as u64, "Timeline added to synchronizer");
        members.len() - 1
    }

    /// Change the delay of member `index`; returns false if there is no such member
    pub fn set_delay(&self, index: usize, delay: Duration) -> bool {
        match self.members.write().get_mut(index) {
            Some(member) => {
                member.delay = delay;
                true
            }
            None => false,
        }
    }

    /// Forget the last synchronization so the next one always emits
    pub fn reset(&self) {
        *self.last.lock() = None;
    }

    /// Compute the synchronization point
    ///
    /// Emits "synchronized" and returns the point when it moved since the
    /// last call; emits "skipped" and returns `None` when no timeline is
    /// populated or nothing changed.
    ///
    /// # Errors
    ///
    /// - Any failure of a direct slot connected to either signal
    pub fn synchronize(&self) -> Result<Option<SyncPoint>> {
        let populated: Vec<(usize, Arc<dyn AnyTimeline>, Duration, Timestamp)> = self
            .members
            .read()
            .iter()
            .enumerate()
            .filter_map(|(index, member)| {
                let timeline = member.timeline.upgrade()?;
                let newest = timeline.newest_timestamp()?;
                Some((index, timeline, member.delay, newest))
            })
            .collect();

        let Some(reference) = populated.iter().map(|(_, _, _, newest)| *newest).max() else {
            trace!("Nothing to synchronize");
            self.skipped.emit(())?;
            return Ok(None);
        };

        let within: Vec<_> = populated
            .iter()
            .filter(|(_, _, _, newest)| reference.distance(*newest) < self.config.tolerance)
            .collect();
        // Empty only with a zero tolerance
        let timestamp = within
            .iter()
            .map(|(_, _, _, newest)| *newest)
            .min()
            .unwrap_or(reference);

        {
            let mut last = self.last.lock();
            if *last == Some(timestamp) {
                drop(last);
                trace!(timestamp = %timestamp, "Synchronization unchanged");
                self.skipped.emit(())?;
                return Ok(None);
            }
            *last = Some(timestamp);
        }

        let members = within
            .iter()
            .map(|(index, timeline, delay, _)| SyncMember {
                index: *index,
                name: timeline.name().to_string(),
                query: timestamp.saturating_sub(*delay),
            })
            .collect::<Vec<_>>();

        debug!(
            timestamp = %timestamp,
            members = members.len(),
            populated = populated.len(),
            "Synchronized"
        );
        self.synchronized.emit((timestamp,))?;
        Ok(Some(SyncPoint { timestamp, members }))
    }
}
