//! Spawning worker subprocesses.
//!
//! Workers are the current executable re-executed with a marker in the
//! environment. [`init`] checks for that marker and, when present, turns the
//! process into a worker that never returns to `main`.

use std::io;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use super::proc::WorkerProc;
use super::worker_main;

/// Environment variable carrying the worker configuration.
pub(crate) const WORKER_ENV: &str = "PARFOR_WORKER";

/// Configuration handed to a worker through the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WorkerEnv {
    pub worker_id: usize,
}

/// Worker-process hook.
///
/// Call this at the top of `main`, after registering callables and before
/// anything with side effects. In a normal process it does nothing; in a
/// process spawned as a pool worker it runs the worker loop and exits.
pub fn init() {
    if let Ok(raw) = std::env::var(WORKER_ENV) {
        let env: WorkerEnv =
            serde_json::from_str(&raw).unwrap_or(WorkerEnv { worker_id: 0 });
        worker_main::run_worker_main(env.worker_id);
    }
}

/// Spawn one worker subprocess with piped stdin/stdout.
///
/// The worker inherits stderr so its diagnostics reach the caller's terminal.
pub(crate) fn spawn_worker(worker_id: usize) -> io::Result<WorkerProc> {
    let exe = std::env::current_exe()?;
    let env = WorkerEnv { worker_id };

    let mut cmd = Command::new(exe);
    cmd.env(
        WORKER_ENV,
        serde_json::to_string(&env).expect("WorkerEnv serialization failed"),
    );
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let child = cmd.spawn()?;
    WorkerProc::from_child(child)
}
