//! Error types for parfor.

use thiserror::Error;

use crate::task::TaskId;

/// Main error type for parfor.
#[derive(Error, Debug)]
pub enum Error {
    /// The callable name was never registered, so the task cannot cross the
    /// process boundary. Raised at submission, before any work starts.
    #[error("no callable registered under '{0}'")]
    UnknownCallable(String),

    #[error("a callable is already registered under '{0}'")]
    DuplicateCallable(String),

    /// A task item, argument or result cannot be encoded for the process
    /// boundary.
    #[error("cannot encode for the process boundary: {0}")]
    Json(#[from] serde_json::Error),

    /// A worker process terminated without producing its chunk result.
    /// Always fatal: the pool is aborted and no partial results are returned.
    #[error("worker {worker} died: {reason}")]
    WorkerCrash { worker: usize, reason: String },

    /// A task failed in a worker and the confirming re-execution in the
    /// calling process failed too.
    #[error("task {id} failed: {message}")]
    TaskError { id: TaskId, message: String },

    /// `request` was called with a task id that was never submitted.
    #[error("unknown task handle: {0}")]
    UnknownHandle(TaskId),

    #[error("pool is closed")]
    PoolClosed,

    /// The source has no intrinsic length and no explicit `length` was given.
    #[error("iterable has no usable length; pass an explicit length")]
    LengthRequired,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for parfor operations.
pub type Result<T> = std::result::Result<T, Error>;
