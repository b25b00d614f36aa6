//! Application-wide context
//!
//! A [`Registry`] is created once at startup and passed explicitly to the
//! components that need it. It owns the named workers, the timeline
//! factories registered by each module, and the debug name counter.
//!
//! # Example
//!
//! ```no_run
//! use igtcom::registry::Registry;
//! use igtcom::timeline::Matrix4;
//!
//! let registry = Registry::with_defaults()?;
//! let render = registry.spawn_worker("render")?;
//!
//! let poses = registry.create_typed_timeline::<Matrix4>("MatrixTl")?;
//! assert!(poses.name().starts_with("MatrixTl-"));
//!
//! registry.teardown();
//! # Ok::<(), igtcom::ComError>(())
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::com::{Args, Signal, Slot};
use crate::error::{ComError, Result};
use crate::timeline::{self, AnyTimeline, Timeline};
use crate::worker::{StopPolicy, Worker};

/// Name of the worker returned by [`Registry::default_worker`]
pub const DEFAULT_WORKER: &str = "default";

/// Builds a fresh timeline under the given name
pub type TimelineFactory = Arc<dyn Fn(&str) -> Arc<dyn AnyTimeline> + Send + Sync>;

/// Explicit application context
pub struct Registry {
    workers: RwLock<HashMap<String, Worker>>,
    factories: HashMap<String, TimelineFactory>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("workers", &self.worker_names())
            .field("timeline_kinds", &self.timeline_kinds())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry: no workers, no timeline kinds
    pub fn new() -> Self {
        Registry {
            workers: RwLock::new(HashMap::new()),
            factories: HashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registry with the default worker running and the shipped timeline
    /// kinds registered
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        timeline::register(&mut registry);
        registry.default_worker()?;
        Ok(registry)
    }

    /// Next value of the debug id counter
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Unique debug name such as `MatrixTl-3`
    pub fn next_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id())
    }

    /// Signal under a fresh debug name such as `pose_changed-4`
    pub fn new_signal<A: Args>(&self, prefix: &str) -> Signal<A> {
        Signal::named(self.next_name(prefix))
    }

    /// Infallible slot under a fresh debug name
    pub fn new_slot<A, R, F>(&self, prefix: &str, f: F) -> Slot<A, R>
    where
        A: Args,
        R: Send + 'static,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Slot::named(self.next_name(prefix), f)
    }

    /// Worker registered under `name`, spawning it first if needed
    pub fn spawn_worker(&self, name: &str) -> Result<Worker> {
        if let Some(worker) = self.worker(name) {
            return Ok(worker);
        }

        let mut workers = self.workers.write();
        // Another thread may have won the race
        if let Some(worker) = workers.get(name) {
            return Ok(worker.clone());
        }
        let worker = Worker::spawn(name)?;
        workers.insert(name.to_string(), worker.clone());
        Ok(worker)
    }

    /// Worker registered under `name`
    pub fn worker(&self, name: &str) -> Option<Worker> {
        self.workers.read().get(name).cloned()
    }

    /// The shared default worker, spawned on first use
    pub fn default_worker(&self) -> Result<Worker> {
        self.spawn_worker(DEFAULT_WORKER)
    }

    /// Names of the registered workers, sorted
    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.workers.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Make a timeline kind creatable by key, replacing any previous factory
    pub fn register_timeline_factory<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> Arc<dyn AnyTimeline> + Send + Sync + 'static,
    {
        let key = key.into();
        debug!(kind = %key, "Timeline kind registered");
        self.factories.insert(key, Arc::new(factory));
    }

    /// Registered timeline kinds, sorted
    pub fn timeline_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Create a timeline of kind `key` under a fresh debug name
    ///
    /// # Errors
    ///
    /// - [`ComError::UnknownTimelineKind`] - No factory registered under `key`
    pub fn create_timeline(&self, key: &str) -> Result<Arc<dyn AnyTimeline>> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| ComError::UnknownTimelineKind(key.to_string()))?;
        let timeline = factory(&self.next_name(key));
        debug!(kind = key, timeline = %timeline.name(), "Timeline created");
        Ok(timeline)
    }

    /// As [`create_timeline`](Registry::create_timeline), with the payload
    /// type checked
    ///
    /// # Errors
    ///
    /// - [`ComError::UnknownTimelineKind`] - No factory under `key`, or it
    ///   does not produce `Timeline<T>`
    pub fn create_typed_timeline<T: Send + Sync + 'static>(
        &self,
        key: &str,
    ) -> Result<Arc<Timeline<T>>> {
        let timeline = self.create_timeline(key)?;
        timeline::downcast::<T>(timeline).ok_or_else(|| {
            ComError::UnknownTimelineKind(format!("{} as {}", key, std::any::type_name::<T>()))
        })
    }

    /// Stop every worker (draining their queues) and forget them
    ///
    /// Safe to call more than once; also runs on drop.
    pub fn teardown(&self) {
        let workers: Vec<_> = self.workers.write().drain().collect();
        if workers.is_empty() {
            return;
        }
        for (_, worker) in &workers {
            worker.stop_with(StopPolicy::Drain);
        }
        info!(workers = workers.len(), "Registry torn down");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{Frame, Matrix4, TrackingMessage};

    #[test]
    fn test_named_workers_are_shared() {
        let registry = Registry::new();
        let a = registry.spawn_worker("io").unwrap();
        let b = registry.spawn_worker("io").unwrap();
        assert!(a.same_worker(&b));
        assert!(registry.worker("missing").is_none());
        assert_eq!(registry.worker_names(), vec!["io".to_string()]);
    }

    #[test]
    fn test_defaults() {
        let registry = Registry::with_defaults().unwrap();
        assert_eq!(registry.timeline_kinds(), vec!["FrameTl", "MatrixTl", "MessageTl"]);
        assert!(registry.worker(DEFAULT_WORKER).is_some());
    }

    #[test]
    fn test_create_timelines() {
        let registry = Registry::with_defaults().unwrap();

        let poses = registry.create_typed_timeline::<Matrix4>("MatrixTl").unwrap();
        let frames = registry.create_typed_timeline::<Frame>("FrameTl").unwrap();
        let messages = registry.create_typed_timeline::<TrackingMessage>("MessageTl").unwrap();
        assert_ne!(poses.name(), frames.name());
        assert!(messages.name().starts_with("MessageTl-"));

        assert!(matches!(
            registry.create_timeline("VolumeTl"),
            Err(ComError::UnknownTimelineKind(_))
        ));
        assert!(matches!(
            registry.create_typed_timeline::<Frame>("MatrixTl"),
            Err(ComError::UnknownTimelineKind(_))
        ));
    }

    #[test]
    fn test_teardown_stops_workers() {
        let registry = Registry::with_defaults().unwrap();
        let worker = registry.default_worker().unwrap();
        registry.teardown();

        assert!(!worker.is_running());
        assert!(registry.worker_names().is_empty());
        registry.teardown();
    }

    #[test]
    fn test_names_are_unique() {
        let registry = Registry::new();
        let a = registry.next_name("slot");
        let b = registry.next_name("slot");
        assert_ne!(a, b);
    }

    #[test]
    fn test_signals_and_slots_get_debug_names() {
        let registry = Registry::new();
        let signal: Signal<(u32,)> = registry.new_signal("moved");
        let slot = registry.new_slot("on_moved", |(_,): (u32,)| ());
        let other = registry.new_slot("on_moved", |(_,): (u32,)| ());

        assert_eq!(signal.name(), "moved-1");
        assert_eq!(slot.name(), "on_moved-2");
        assert_eq!(other.name(), "on_moved-3");
        assert!(signal.connect(&slot).is_ok());
    }
}
