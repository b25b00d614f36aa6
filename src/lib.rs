//! Thread-safe signal/slot messaging for image-guided therapy applications
//!
//! This library provides the in-process messaging core of a navigation
//! application: typed signals and slots with per-connection dispatch modes,
//! serial worker threads, and timestamped timelines for tracking data and
//! video frames.
//!
//! # Features
//!
//! - **Typed signals and slots** - Argument tuples checked at compile time, and at runtime when wired by name
//! - **Three dispatch modes** - Direct, asynchronous on a worker, or blocking on a worker
//! - **Safe teardown** - Disconnecting or dropping a signal races safely with in-flight emissions
//! - **Serial workers** - One OS thread per worker, FIFO, with drain or discard shutdown
//! - **Timelines** - Bounded, ordered history of immutable buffers with nearest-in-time queries
//! - **Synchronization** - Common timestamp over several timelines with tolerance and delays
//!
//! # Quick Start
//!
//! ## Connecting a Slot on a Worker
//!
//! ```no_run
//! use igtcom::com::{Signal, Slot};
//! use igtcom::worker::Worker;
//!
//! let render = Worker::spawn("render")?;
//! let tool_moved: Signal<(String, [f32; 3])> = Signal::named("tool_moved");
//!
//! let update = Slot::named("update_scene", |(tool, pos): (String, [f32; 3])| {
//!     println!("{tool} at {pos:?}");
//! })
//! .with_worker(render.clone());
//!
//! // Bound to a worker, so dispatch is asynchronous by default
//! let connection = tool_moved.connect(&update)?;
//! tool_moved.emit(("needle".to_string(), [1.0, 2.0, 3.0]))?;
//!
//! connection.disconnect();
//! render.stop();
//! # Ok::<(), igtcom::ComError>(())
//! ```
//!
//! ## Recording Tracking Data
//!
//! ```no_run
//! use igtcom::timeline::{Buffer, Direction, Matrix4, MatrixTl, Timestamp};
//!
//! let poses = MatrixTl::named("poses");
//! poses.push(Buffer::single(Timestamp::from_millis(100), Matrix4::identity()))?;
//! poses.push(Buffer::single(Timestamp::from_millis(200), Matrix4::translation(0.0, 0.0, 5.0)))?;
//!
//! let pose = poses.closest_buffer(Timestamp::from_millis(180), Direction::Nearest);
//! assert_eq!(pose.unwrap().timestamp(), Timestamp::from_millis(200));
//! # Ok::<(), igtcom::ComError>(())
//! ```
//!
//! # Architecture
//!
//! ## Module Structure
//!
//! - **`com`** - Signal/slot core
//!   - `Signal` / `Slot` - Typed broadcast points and callable endpoints
//!   - `Connection` - Handle with block/unblock/disconnect
//!   - `SignalTable` / `SlotTable` - Wiring by name
//!
//! - **`worker`** - Serial task queues on dedicated threads
//!
//! - **`timeline`** - Timestamped buffer history
//!   - `Timeline` / `Buffer` - Storage and cells
//!   - `MatrixTl` / `MessageTl` / `FrameTl` - Shipped payload kinds
//!   - `Synchronizer` - Common timestamp over several timelines
//!
//! - **`registry`** - Explicit application context
//!
//! - **`error`** - Error handling
//!   - `ComError` - Unified error type for all operations
//!   - `Result<T>` - Type alias for `Result<T, ComError>`
//!
//! ## Design Principles
//!
//! 1. **No global state**: Workers and factories live in a `Registry` passed explicitly
//! 2. **Weak back-references**: Connections never keep a signal alive
//! 3. **Locks never held across dispatch**: Slots may connect, disconnect and emit freely
//! 4. **Explicit errors**: Absence is `Option`, failure is `ComError`
//!
//! # Error Handling
//!
//! Direct and blocking dispatch propagate slot failures to the emitter.
//! Asynchronous dispatch cannot: its failures are logged with `tracing` and
//! kept as the worker's [last error](worker::Worker::last_error).
//!
//! ```no_run
//! use igtcom::com::{Signal, Slot};
//! use igtcom::ComError;
//!
//! let signal: Signal<(u32,)> = Signal::new();
//! let strict = Slot::fallible("strict", |(n,): (u32,)| {
//!     if n == 0 {
//!         return Err(ComError::callable("zero is not a valid tool id"));
//!     }
//!     Ok(())
//! });
//! signal.connect(&strict)?;
//!
//! match signal.emit((0,)) {
//!     Err(ComError::Callable(reason)) => eprintln!("rejected: {reason}"),
//!     other => other?,
//! }
//! # Ok::<(), igtcom::ComError>(())
//! ```

pub mod com;
pub mod error;
pub mod registry;
pub mod timeline;
pub mod worker;

// Re-export commonly used types
pub use com::{Connection, DispatchMode, Signal, Slot};
pub use error::{ComError, Result};
pub use registry::Registry;
pub use worker::Worker;
