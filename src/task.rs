//! Task data model shared between the caller and the worker processes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordinal index of a task in the original iteration order.
///
/// The id is the sole key used for final ordering and result retrieval.
pub type TaskId = u64;

/// Named extra arguments passed to a callable alongside the iteration item.
pub type Kwargs = serde_json::Map<String, Value>;

/// A failure captured while executing a single task.
///
/// In capture mode this becomes the task's outcome; in the default mode it is
/// only an intermediate record that triggers re-execution in the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFault {
    message: String,
}

impl TaskFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for TaskFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskFault {}

impl From<String> for TaskFault {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for TaskFault {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Caller-facing outcome of one task: its value, or the captured fault.
pub type Outcome = std::result::Result<Value, TaskFault>;

/// One unit of work: a registered callable applied to one iteration item.
///
/// Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Name the callable was registered under.
    pub call: String,
    /// The per-iteration item, already encoded for the boundary.
    pub item: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Kwargs::is_empty")]
    pub kwargs: Kwargs,
}

/// A contiguous, ordered batch of tasks dispatched to one worker as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: u64,
    pub tasks: Vec<Task>,
}

/// Per-task outcome as it travels back over the pipe.
///
/// The error marker carries the task itself so the caller can re-execute it
/// locally without keeping every in-flight task around.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum WireOutcome {
    #[serde(rename = "ok")]
    Ok { value: Value },

    #[serde(rename = "err")]
    Err { message: String, task: Task },
}

/// Result of executing one chunk, in task order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    pub id: u64,
    pub outcomes: Vec<(TaskId, WireOutcome)>,
}
