//! Handle to a single worker subprocess.
//!
//! Wraps the child's pid and its IPC pipe ends. Owned exclusively by the
//! pool; never exposed to callers.

use std::io;
use std::process::Child;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkerRequest, WorkerReply};
use super::signals::{TerminationReason, analyze_wait_status};

/// How long `stop` waits after the exit request before escalating.
const EXIT_GRACE: Duration = Duration::from_millis(10);

pub(crate) struct WorkerProc {
    pid: Pid,
    writer: LineWriter,
    reader: LineReader,
    reaped: bool,
}

impl WorkerProc {
    /// Take over a freshly spawned child with piped stdin/stdout.
    pub fn from_child(mut child: Child) -> io::Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout not captured"))?;

        Ok(Self {
            pid,
            writer: LineWriter::new(PipeFd::new(stdin.into())),
            reader: LineReader::new(PipeFd::new(stdout.into())),
            reaped: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send a request to the worker.
    pub fn send(&mut self, request: &WorkerRequest) -> io::Result<()> {
        self.writer.write_line(&request.to_line())
    }

    /// Receive the next reply. `None` when the worker closed its stdout.
    pub fn recv(&mut self) -> io::Result<Option<WorkerReply>> {
        match self.reader.read_line()? {
            Some(line) => {
                let reply = WorkerReply::from_line(&line)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }

    /// Whether the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        self.try_wait() == TerminationReason::StillAlive
    }

    /// Reap the process if it has terminated; classify either way.
    pub fn try_wait(&mut self) -> TerminationReason {
        if self.reaped {
            return TerminationReason::Unknown;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => TerminationReason::StillAlive,
            Ok(status) => {
                self.reaped = true;
                analyze_wait_status(status)
            }
            Err(_) => {
                self.reaped = true;
                TerminationReason::Unknown
            }
        }
    }

    /// Why the worker went away, for the crash error message.
    pub fn exit_reason(&mut self) -> TerminationReason {
        // A just-died child may not be waitable yet; give it a moment.
        for _ in 0..50 {
            match self.try_wait() {
                TerminationReason::StillAlive => {
                    std::thread::sleep(Duration::from_millis(2));
                }
                reason => return reason,
            }
        }
        TerminationReason::StillAlive
    }

    /// Send SIGTERM.
    pub fn terminate(&self) {
        if !self.reaped {
            let _ = signal::kill(self.pid, Signal::SIGTERM);
        }
    }

    /// SIGKILL and reap.
    pub fn kill(&mut self) {
        if self.reaped {
            return;
        }
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
        self.reaped = true;
    }

    /// Graceful stop: exit request, then SIGTERM, then SIGKILL.
    pub fn stop(&mut self, timeout: Duration) {
        if self.reaped {
            return;
        }

        let _ = self.send(&WorkerRequest::Exit);
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.try_wait() != TerminationReason::StillAlive {
                return;
            }
            std::thread::sleep(EXIT_GRACE);
        }

        self.terminate();
        std::thread::sleep(EXIT_GRACE.saturating_mul(10));
        if self.try_wait() != TerminationReason::StillAlive {
            return;
        }

        self.kill();
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        self.terminate();
        std::thread::sleep(EXIT_GRACE);
        if self.try_wait() == TerminationReason::StillAlive {
            self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn_cat() -> WorkerProc {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("failed to spawn cat");
        WorkerProc::from_child(child).expect("failed to wrap child")
    }

    #[test]
    fn test_liveness_and_stop() {
        let mut proc = spawn_cat();
        assert!(proc.is_running());

        // cat ignores the exit request, so stop escalates to SIGTERM.
        proc.stop(Duration::from_millis(100));
        assert!(!proc.is_running());
    }

    #[test]
    fn test_kill_reaps() {
        let mut proc = spawn_cat();
        proc.kill();
        assert!(!proc.is_running());
    }

    #[test]
    fn test_exit_reason_after_signal() {
        let mut proc = spawn_cat();
        let _ = signal::kill(proc.pid(), Signal::SIGTERM);
        let reason = proc.exit_reason();
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGTERM));
    }
}
