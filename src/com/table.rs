//! Named capability tables
//!
//! Components publish their signals and slots under string keys so that
//! producers and consumers can be wired without knowing each other's
//! concrete types. Wiring goes through the same runtime signature check as
//! a typed connect.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::com::connection::Connection;
use crate::com::signal::{DispatchMode, Signal, SignalBase};
use crate::com::signature::Args;
use crate::com::slot::{Slot, SlotBase};
use crate::error::{ComError, Result};

/// Signals exposed by a component, keyed by name
#[derive(Default)]
pub struct SignalTable {
    signals: HashMap<String, Arc<dyn SignalBase>>,
}

impl std::fmt::Debug for SignalTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}

impl SignalTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a signal under `key`, replacing any previous entry
    pub fn insert<A: Args>(&mut self, key: impl Into<String>, signal: Arc<Signal<A>>) {
        self.signals.insert(key.into(), signal);
    }

    /// Type-erased lookup
    pub fn get(&self, key: &str) -> Option<&Arc<dyn SignalBase>> {
        self.signals.get(key)
    }

    /// Typed lookup; `None` if the key is unknown or the arguments differ
    pub fn typed<A: Args>(&self, key: &str) -> Option<Arc<Signal<A>>> {
        let signal = self.signals.get(key)?.clone();
        signal.as_any_arc().downcast::<Signal<A>>().ok()
    }

    /// Published keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<_> = self.signals.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Number of published signals
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Whether no signal is published
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Connect signal `key` to slot `slot_key` of `slots` with the default
    /// dispatch mode
    ///
    /// # Errors
    ///
    /// - [`ComError::UnknownSignal`] - No signal under `key`
    /// - [`ComError::UnknownSlot`] - No slot under `slot_key`
    /// - [`ComError::SignatureMismatch`] - Incompatible argument types
    pub fn connect(&self, key: &str, slots: &SlotTable, slot_key: &str) -> Result<Connection> {
        self.wire(key, slots, slot_key, None)
    }

    /// As [`connect`](SignalTable::connect) with an explicit dispatch mode
    pub fn connect_with(
        &self,
        key: &str,
        slots: &SlotTable,
        slot_key: &str,
        mode: DispatchMode,
    ) -> Result<Connection> {
        self.wire(key, slots, slot_key, Some(mode))
    }

    fn wire(
        &self,
        key: &str,
        slots: &SlotTable,
        slot_key: &str,
        mode: Option<DispatchMode>,
    ) -> Result<Connection> {
        let signal = self
            .signals
            .get(key)
            .ok_or_else(|| ComError::UnknownSignal(key.to_string()))?;
        let slot = slots
            .slots
            .get(slot_key)
            .ok_or_else(|| ComError::UnknownSlot(slot_key.to_string()))?;

        debug!(signal = key, slot = slot_key, "Wiring by name");
        signal.connect_dyn(slot.clone(), mode)
    }
}

/// Slots exposed by a component, keyed by name
#[derive(Default)]
pub struct SlotTable {
    slots: HashMap<String, Arc<dyn SlotBase>>,
}

impl std::fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}

impl SlotTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a slot under `key`, replacing any previous entry
    pub fn insert<S: SlotBase>(&mut self, key: impl Into<String>, slot: S) {
        self.slots.insert(key.into(), Arc::new(slot));
    }

    /// Type-erased lookup
    pub fn get(&self, key: &str) -> Option<&Arc<dyn SlotBase>> {
        self.slots.get(key)
    }

    /// Typed lookup; `None` if the key is unknown or the signature differs
    pub fn typed<A: Args, R: Send + 'static>(&self, key: &str) -> Option<Slot<A, R>> {
        self.slots
            .get(key)?
            .as_any()
            .downcast_ref::<Slot<A, R>>()
            .cloned()
    }

    /// Published keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<_> = self.slots.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Number of published slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is published
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
