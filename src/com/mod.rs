//! Signal/slot communication
//!
//! - [`Signal`]: typed broadcast point
//! - [`Slot`]: typed callable endpoint, optionally bound to a [`Worker`](crate::worker::Worker)
//! - [`Connection`]: handle tying one signal to one slot
//! - [`SignalTable`] / [`SlotTable`]: wiring by name

pub mod connection;
pub mod signal;
pub mod signature;
pub mod slot;
pub mod table;

pub use connection::{Connection, ConnectionBlocker, ConnectionSet, ConnectionState};
pub use signal::{DispatchMode, Signal, SignalBase};
pub use signature::{Args, Signature, TypeDesc};
pub use slot::{Slot, SlotBase};
pub use table::{SignalTable, SlotTable};
