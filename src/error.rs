//! Error types for signal/slot dispatch, workers and timelines
//!
//! This module defines every error that can surface from the messaging core:
//! connection-time signature checks, worker shutdown races, failing callables
//! and timeline buffer validation.
//!
//! Expected absence (an empty timeline, no entry in the requested direction)
//! is never an error; timeline queries return `Option` instead.

use thiserror::Error;

/// Messaging core error types
///
/// All fallible operations in this library return `Result<T, ComError>`.
#[derive(Error, Debug)]
pub enum ComError {
    /// Slot signature is incompatible with the signal it is connected to
    ///
    /// This error occurs when:
    /// - The slot expects more arguments than the signal provides
    /// - An argument type differs at the same position
    ///
    /// It is detected once, at connect time, never during `emit`.
    ///
    /// # Example
    /// ```no_run
    /// # use igtcom::error::ComError;
    /// let err = ComError::SignatureMismatch {
    ///     expected: "fn(u64)".to_string(),
    ///     actual: "fn(alloc::string::String)".to_string(),
    /// };
    /// ```
    #[error("Signature mismatch: signal is {expected}, slot is {actual}")]
    SignatureMismatch {
        /// Signature of the signal
        expected: String,
        /// Signature of the slot being connected
        actual: String,
    },

    /// Worker no longer accepts tasks
    ///
    /// Returned by [`Worker::post`](crate::worker::Worker::post) once
    /// [`Worker::stop`](crate::worker::Worker::stop) has been called.
    #[error("Worker '{worker}' is stopped")]
    WorkerStopped {
        /// Name of the worker
        worker: String,
    },

    /// Dispatch target worker has shut down
    ///
    /// This error occurs when:
    /// - A blocking dispatch is posted to a worker that has been stopped
    /// - A pending task was discarded by a `Discard` shutdown before it ran
    ///
    /// Asynchronous dispatch never returns this error to the emitter; it is
    /// logged and the update is dropped.
    #[error("Worker '{worker}' is unavailable")]
    WorkerUnavailable {
        /// Name of the worker
        worker: String,
    },

    /// Slot has no worker but the requested call needs one
    #[error("Slot '{slot}' has no worker")]
    NoWorker {
        /// Debug name of the slot
        slot: String,
    },

    /// Task panicked while running on a worker
    ///
    /// The panic is caught so the worker keeps processing its queue.
    #[error("Task panicked on worker '{worker}': {message}")]
    TaskPanicked {
        /// Name of the worker
        worker: String,
        /// Panic payload, when it was a string
        message: String,
    },

    /// Failure reported by a slot callable
    #[error("Callable failed: {0}")]
    Callable(String),

    /// No signal registered under this key
    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    /// No slot registered under this key
    #[error("Unknown slot: {0}")]
    UnknownSlot(String),

    /// No timeline factory registered under this key
    #[error("Unknown timeline kind: {0}")]
    UnknownTimelineKind(String),

    /// Buffer element index outside the buffer's pool
    #[error("Invalid element index {index} (pool size {max})")]
    InvalidElementIndex {
        /// Requested element index
        index: usize,
        /// Pool size of the buffer
        max: usize,
    },

    /// Buffer was not created for this timeline
    ///
    /// Pushing a buffer whose pool size differs from the timeline's pool
    /// size is refused.
    #[error("Incompatible buffer: expected pool size {expected}, got {actual}")]
    IncompatibleBuffer {
        /// Pool size of the timeline
        expected: usize,
        /// Pool size of the pushed buffer
        actual: usize,
    },

    /// I/O error while spawning a worker thread
    ///
    /// This error wraps standard library I/O errors raised by
    /// `std::thread::Builder::spawn`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Pool size outside `1..=64`
    #[error("Invalid pool size: {0} (must be between 1 and 64)")]
    InvalidPoolSize(usize),

    /// Retention bounded to zero buffers
    #[error("Invalid retention: max_count must be at least 1")]
    InvalidRetention,
}

impl ComError {
    /// Build a [`ComError::Callable`] from any displayable failure
    pub fn callable(err: impl std::fmt::Display) -> Self {
        ComError::Callable(err.to_string())
    }
}

/// Result type alias for messaging core operations
pub type Result<T> = std::result::Result<T, ComError>;
