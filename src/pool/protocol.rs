//! Wire protocol between the caller and a worker process.
//!
//! Messages are JSON-serialized and newline-delimited.

use serde::{Deserialize, Serialize};

use crate::task::{Chunk, ChunkResult};

/// Request from the caller to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum WorkerRequest {
    /// Execute every task in the chunk, in order.
    #[serde(rename = "run")]
    Run { chunk: Chunk },

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Reply from a worker to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum WorkerReply {
    /// Worker started up and is ready for chunks.
    #[serde(rename = "ready")]
    Ready,

    /// Progress delta: `tasks` more tasks finished. Best effort.
    #[serde(rename = "progress")]
    Progress { tasks: u32 },

    /// All outcomes for one chunk.
    #[serde(rename = "done")]
    Done { result: ChunkResult },

    /// The worker could not make sense of a request.
    #[serde(rename = "fault")]
    Fault { message: String },
}

impl WorkerRequest {
    /// Serialize to a JSON line (without newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("WorkerRequest serialization failed")
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkerReply {
    /// Serialize to a JSON line (without newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("WorkerReply serialization failed")
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
