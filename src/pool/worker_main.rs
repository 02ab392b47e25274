//! Worker subprocess entry point.
//!
//! Runs when the re-executed binary finds the worker marker in its
//! environment. Reads chunk requests from stdin, executes every task in
//! sequence through the registry, and writes progress deltas and chunk
//! results to stdout.

use std::io;

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkerRequest, WorkerReply};
use crate::registry;
use crate::task::{ChunkResult, WireOutcome};

/// Worker main loop over the stdin/stdout pipes.
fn worker_loop(reader: &mut LineReader, writer: &mut LineWriter) -> io::Result<()> {
    writer.write_line(&WorkerReply::Ready.to_line())?;

    loop {
        let line = match reader.read_line()? {
            Some(line) => line,
            // Parent closed the pipe.
            None => return Ok(()),
        };

        let request = match WorkerRequest::from_line(&line) {
            Ok(request) => request,
            Err(e) => {
                let reply = WorkerReply::Fault {
                    message: format!("invalid request: {e}"),
                };
                writer.write_line(&reply.to_line())?;
                continue;
            }
        };

        match request {
            WorkerRequest::Exit => return Ok(()),

            WorkerRequest::Run { chunk } => {
                let mut outcomes = Vec::with_capacity(chunk.tasks.len());
                for task in chunk.tasks {
                    let id = task.id;
                    let wire = match registry::execute(&task) {
                        Ok(value) => WireOutcome::Ok { value },
                        Err(fault) => WireOutcome::Err {
                            message: fault.message().to_string(),
                            task,
                        },
                    };
                    outcomes.push((id, wire));
                    // Best-effort progress; the parent rate-limits display.
                    writer.write_line(&WorkerReply::Progress { tasks: 1 }.to_line())?;
                }

                let reply = WorkerReply::Done {
                    result: ChunkResult {
                        id: chunk.id,
                        outcomes,
                    },
                };
                writer.write_line(&reply.to_line())?;
            }
        }
    }
}

/// Run the worker loop over stdin/stdout and exit.
pub(crate) fn run_worker_main(worker_id: usize) -> ! {
    // Pipe errors surface through io::Error, not SIGPIPE.
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        );
    }

    // Descriptors 0 and 1 are the IPC pipes set up by the parent.
    let stdin_fd = unsafe { PipeFd::from_raw(0) };
    let stdout_fd = unsafe { PipeFd::from_raw(1) };
    let mut reader = LineReader::new(stdin_fd);
    let mut writer = LineWriter::new(stdout_fd);

    match worker_loop(&mut reader, &mut writer) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("parfor worker {worker_id} error: {e}");
            std::process::exit(1);
        }
    }
}
