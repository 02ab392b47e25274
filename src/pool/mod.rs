//! Worker process pool.
//!
//! Spawns a fixed set of worker subprocesses and schedules chunks of tasks
//! across them, collecting possibly out-of-order results back into slots
//! addressed by task id.
//!
//! ```text
//!                      ┌─────────────────┐
//!                      │  Caller process │
//!                      │  Pool + slots   │
//!                      └────────┬────────┘
//!                 chunks queue  │  event queue
//!                ┌──────────────┼──────────────┐
//!          ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!          │  agent 0  │  │  agent 1  │  │  agent N  │   (threads)
//!          └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!            pipe│IPC       pipe│IPC       pipe│IPC
//!          ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!          │  worker 0 │  │  worker 1 │  │  worker N │   (processes)
//!          └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Workers share no memory with the caller or each other; all coordination
//! runs over the bounded chunk queue, the event queue and a best-effort
//! progress channel. A worker that dies without delivering its chunk result
//! aborts the whole pool.

mod ipc;
mod proc;
mod protocol;
mod signals;
mod spawn;
mod worker_main;

pub use spawn::init;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{
    Receiver, Sender, SendTimeoutError, TryRecvError, bounded, unbounded,
};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::collect::ResultStore;
use crate::error::{Error, Result};
use crate::progress::{self, ProgressSink};
use crate::registry::{self, FnRef};
use crate::task::{Chunk, Kwargs, Outcome, Task, TaskFault, TaskId, WireOutcome};
use proc::WorkerProc;
use protocol::{WorkerReply, WorkerRequest};

/// How long a graceful worker stop may take before escalating.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting on queues, so worker death is noticed.
const PUMP_INTERVAL: Duration = Duration::from_millis(20);

/// Worker count selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkerCount {
    /// A third of the available processing units, minimum 1.
    Auto,
    /// Exactly this many workers (minimum 1).
    Count(usize),
    /// This fraction of the available processing units, minimum 1.
    Fraction(f64),
}

impl WorkerCount {
    /// Resolve to a concrete worker count.
    pub fn resolve(self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self {
            Self::Auto => (cpus / 3).max(1),
            Self::Count(n) => n.max(1),
            Self::Fraction(f) => ((cpus as f64 * f).round() as usize).max(1),
        }
    }
}

impl Default for WorkerCount {
    fn default() -> Self {
        Self::Auto
    }
}

impl From<usize> for WorkerCount {
    fn from(n: usize) -> Self {
        Self::Count(n)
    }
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes.
    pub workers: WorkerCount,
    /// Capture task faults as outcomes instead of failing fast.
    pub capture_faults: bool,
    /// Chunk queue bound as a multiple of the worker count.
    pub queue_factor: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: WorkerCount::Auto,
            capture_faults: false,
            queue_factor: 3,
        }
    }
}

/// Event posted by an agent thread back to the pool.
enum PoolEvent {
    ChunkDone(crate::task::ChunkResult),
    WorkerDown { worker: usize, reason: String },
}

/// A pool of worker subprocesses executing chunks of tasks.
///
/// Lifecycle: [`Pool::open`] spawns the workers; [`Pool::submit`] hands in
/// tasks; [`Pool::request`] blocks for one task's outcome; [`Pool::close`]
/// releases everything. Dropping the pool closes it, so workers never
/// outlive the handle. One pool may serve several submission batches; task
/// ids stay disjoint because they are assigned monotonically.
pub struct Pool {
    workers: usize,
    capture_faults: bool,
    chunk_tx: Option<Sender<Chunk>>,
    event_rx: Receiver<PoolEvent>,
    agents: Vec<JoinHandle<()>>,
    pids: Arc<Mutex<Vec<Option<Pid>>>>,
    aggregator: Option<JoinHandle<()>>,
    submitted: Arc<AtomicU64>,
    completed_floor: Arc<AtomicU64>,
    store: ResultStore,
    next_task: TaskId,
    next_chunk: u64,
    closed: bool,
}

impl Pool {
    /// Spawn the workers and return the pool handle.
    pub fn open(config: PoolConfig) -> Result<Self> {
        Self::open_with_progress(config, None)
    }

    /// Like [`Pool::open`], with a display sink for progress updates.
    pub fn open_with_progress(
        config: PoolConfig,
        sink: Option<Box<dyn ProgressSink>>,
    ) -> Result<Self> {
        let workers = config.workers.resolve();
        let queue_bound = config.queue_factor.max(1) * workers;

        tracing::info!(workers, queue_bound, "initializing worker pool");

        let (chunk_tx, chunk_rx) = bounded::<Chunk>(queue_bound);
        let (event_tx, event_rx) = unbounded::<PoolEvent>();
        let submitted = Arc::new(AtomicU64::new(0));
        let completed_floor = Arc::new(AtomicU64::new(0));

        let (progress_tx, aggregator) = match sink {
            Some(sink) => {
                let (tx, rx) = bounded(progress::PROGRESS_QUEUE);
                let handle = progress::spawn_aggregator(
                    rx,
                    sink,
                    submitted.clone(),
                    completed_floor.clone(),
                );
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        // Spawn every worker before starting agents, so a failure here tears
        // the already-spawned children down through WorkerProc::drop.
        let mut procs = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            procs.push(spawn::spawn_worker(worker_id)?);
        }

        let pids = Arc::new(Mutex::new(
            procs.iter().map(|p| Some(p.pid())).collect::<Vec<_>>(),
        ));

        let mut agents = Vec::with_capacity(workers);
        for (worker_id, proc) in procs.into_iter().enumerate() {
            let chunk_rx = chunk_rx.clone();
            let event_tx = event_tx.clone();
            let progress_tx = progress_tx.clone();
            let pids = pids.clone();
            let handle = std::thread::Builder::new()
                .name(format!("parfor-agent-{worker_id}"))
                .spawn(move || agent_loop(worker_id, proc, chunk_rx, event_tx, progress_tx, pids))
                .map_err(Error::Io)?;
            agents.push(handle);
        }

        Ok(Self {
            workers,
            capture_faults: config.capture_faults,
            chunk_tx: Some(chunk_tx),
            event_rx,
            agents,
            pids,
            aggregator,
            submitted,
            completed_floor,
            store: ResultStore::with_capacity(queue_bound),
            next_task: 0,
            next_chunk: 0,
            closed: false,
        })
    }

    /// Number of worker processes in the pool.
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Whether task faults are captured as outcomes instead of failing fast.
    pub fn captures_faults(&self) -> bool {
        self.capture_faults
    }

    /// Submit one task and return its handle.
    ///
    /// Blocks when the chunk queue is full. The callable must be registered;
    /// unknown names are rejected here, before any work starts.
    pub fn submit(
        &mut self,
        call: &str,
        item: Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<TaskId> {
        let ids = self.submit_batch(call, vec![item], &args, &kwargs)?;
        Ok(ids[0])
    }

    /// Typed convenience over [`Pool::submit`].
    pub fn submit_task<I, O>(
        &mut self,
        f: &FnRef<I, O>,
        item: I,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<TaskId>
    where
        I: Serialize,
    {
        self.submit(f.name(), serde_json::to_value(item)?, args, kwargs)
    }

    /// Submit a batch of items as one chunk; returns the ids in item order.
    pub fn submit_batch(
        &mut self,
        call: &str,
        items: Vec<Value>,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Vec<TaskId>> {
        if self.closed || self.chunk_tx.is_none() {
            return Err(Error::PoolClosed);
        }
        if !registry::is_registered(call) {
            return Err(Error::UnknownCallable(call.to_string()));
        }

        let mut ids = Vec::with_capacity(items.len());
        let tasks: Vec<Task> = items
            .into_iter()
            .map(|item| {
                let id = self.next_task;
                self.next_task += 1;
                ids.push(id);
                Task {
                    id,
                    call: call.to_string(),
                    item,
                    args: args.to_vec(),
                    kwargs: kwargs.clone(),
                }
            })
            .collect();

        for id in &ids {
            self.store.track(*id);
        }

        let chunk = Chunk {
            id: self.next_chunk,
            tasks,
        };
        self.next_chunk += 1;
        self.dispatch(chunk)?;
        Ok(ids)
    }

    /// Block until the outcome for `id` is available and return it.
    ///
    /// Requesting an id that was never submitted is a usage error with no
    /// side effects. In the default mode a task fault never surfaces here:
    /// it is either recovered by local re-execution or fatal for the pool.
    pub fn request(&mut self, id: TaskId) -> Result<Outcome> {
        if !self.store.known(id) {
            return Err(Error::UnknownHandle(id));
        }
        loop {
            if let Some(outcome) = self.store.take(id) {
                return Ok(outcome);
            }
            self.pump_events(true)?;
        }
    }

    /// Like [`Pool::request`], decoding the value to `O`.
    pub fn request_as<O: DeserializeOwned>(
        &mut self,
        id: TaskId,
    ) -> Result<std::result::Result<O, TaskFault>> {
        match self.request(id)? {
            Ok(value) => Ok(Ok(serde_json::from_value(value)?)),
            Err(fault) => Ok(Err(fault)),
        }
    }

    /// Push a chunk into the queue, pumping events while it is full so a
    /// dying worker cannot leave the caller blocked forever.
    fn dispatch(&mut self, chunk: Chunk) -> Result<()> {
        self.submitted
            .fetch_add(chunk.tasks.len() as u64, Ordering::Relaxed);

        let mut pending = chunk;
        loop {
            let tx = self.chunk_tx.as_ref().ok_or(Error::PoolClosed)?;
            match tx.send_timeout(pending, PUMP_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(chunk)) => {
                    pending = chunk;
                    self.pump_events(false)?;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(Error::PoolClosed),
            }
        }
    }

    /// Drain pending pool events into the result store.
    ///
    /// With `wait` set, blocks briefly for at least one event. Worker death
    /// and confirmed task failures abort the pool and surface here.
    fn pump_events(&mut self, wait: bool) -> Result<()> {
        let mut wait = wait;
        loop {
            let event = if wait {
                wait = false;
                match self.event_rx.recv_timeout(PUMP_INTERVAL) {
                    Ok(event) => event,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => return Ok(()),
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        return Err(Error::PoolClosed);
                    }
                }
            } else {
                match self.event_rx.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => return Ok(()),
                    Err(TryRecvError::Disconnected) => return Err(Error::PoolClosed),
                }
            };
            self.apply_event(event)?;
        }
    }

    fn apply_event(&mut self, event: PoolEvent) -> Result<()> {
        match event {
            PoolEvent::ChunkDone(result) => {
                let tasks = result.outcomes.len() as u64;
                for (id, wire) in result.outcomes {
                    match wire {
                        WireOutcome::Ok { value } => self.store.fill(id, Ok(value)),
                        WireOutcome::Err { message, task } => {
                            self.settle_fault(id, message, task)?;
                        }
                    }
                }
                self.completed_floor.fetch_add(tasks, Ordering::Relaxed);
                Ok(())
            }
            PoolEvent::WorkerDown { worker, reason } => {
                self.abort();
                Err(Error::WorkerCrash { worker, reason })
            }
        }
    }

    /// The error/retry decision for one failed task.
    fn settle_fault(&mut self, id: TaskId, message: String, task: Task) -> Result<()> {
        if self.capture_faults {
            self.store.fill(id, Err(TaskFault::new(message)));
            return Ok(());
        }

        // The fault crossed the process boundary as text and may have lost
        // fidelity; run the task here to recover the authentic error.
        tracing::warn!(
            task = id,
            %message,
            "task failed in a worker; retrying in the calling process"
        );
        match registry::execute(&task) {
            Ok(value) => {
                self.store.fill(id, Ok(value));
                Ok(())
            }
            Err(fault) => {
                self.abort();
                Err(Error::TaskError {
                    id,
                    message: fault.message().to_string(),
                })
            }
        }
    }

    /// Gracefully shut the pool down: finish queued chunks, stop workers,
    /// join all helper threads. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Agents drain what is left in the queue, then stop their workers.
        self.chunk_tx = None;
        for agent in self.agents.drain(..) {
            let _ = agent.join();
        }
        while self.event_rx.try_recv().is_ok() {}
        if let Some(handle) = self.aggregator.take() {
            let _ = handle.join();
        }
        tracing::debug!("worker pool closed");
    }

    /// Fatal teardown: kill every worker immediately and drop queued work.
    pub(crate) fn abort(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        {
            let pids = self.pids.lock().expect("worker pid table poisoned");
            for pid in pids.iter().flatten() {
                let _ = signal::kill(*pid, Signal::SIGKILL);
            }
        }
        self.chunk_tx = None;
        for agent in self.agents.drain(..) {
            let _ = agent.join();
        }
        while self.event_rx.try_recv().is_ok() {}
        if let Some(handle) = self.aggregator.take() {
            let _ = handle.join();
        }
        tracing::warn!("worker pool aborted; all workers terminated");
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("workers", &self.workers)
            .field("capture_faults", &self.capture_faults)
            .field("closed", &self.closed)
            .field("outstanding", &self.store.outstanding())
            .finish()
    }
}

/// Per-worker agent thread: feeds chunks to one worker process and relays
/// its replies.
fn agent_loop(
    worker_id: usize,
    mut proc: WorkerProc,
    chunk_rx: Receiver<Chunk>,
    event_tx: Sender<PoolEvent>,
    progress_tx: Option<Sender<u32>>,
    pids: Arc<Mutex<Vec<Option<Pid>>>>,
) {
    let down = |reason: String| {
        clear_pid(&pids, worker_id);
        let _ = event_tx.send(PoolEvent::WorkerDown {
            worker: worker_id,
            reason,
        });
    };

    // Startup handshake.
    match proc.recv() {
        Ok(Some(WorkerReply::Ready)) => {
            tracing::debug!(worker_id, pid = proc.pid().as_raw(), "worker ready");
        }
        Ok(Some(other)) => {
            proc.kill();
            down(format!("unexpected startup reply: {other:?}"));
            return;
        }
        Ok(None) | Err(_) => {
            down(proc.exit_reason().to_string());
            return;
        }
    }

    while let Ok(chunk) = chunk_rx.recv() {
        let chunk_id = chunk.id;
        let task_count = chunk.tasks.len();

        if proc.send(&WorkerRequest::Run { chunk }).is_err() {
            down(proc.exit_reason().to_string());
            return;
        }

        loop {
            match proc.recv() {
                Ok(Some(WorkerReply::Progress { tasks })) => {
                    if let Some(tx) = &progress_tx {
                        // Best effort: drop the delta rather than stall.
                        let _ = tx.try_send(tasks);
                    }
                }
                Ok(Some(WorkerReply::Done { result })) => {
                    tracing::trace!(worker_id, chunk_id, tasks = task_count, "chunk complete");
                    let _ = event_tx.send(PoolEvent::ChunkDone(result));
                    break;
                }
                Ok(Some(WorkerReply::Fault { message })) => {
                    proc.kill();
                    down(format!("protocol fault: {message}"));
                    return;
                }
                Ok(Some(WorkerReply::Ready)) => {
                    proc.kill();
                    down("unexpected ready reply mid-chunk".to_string());
                    return;
                }
                Ok(None) | Err(_) => {
                    let reason = proc.exit_reason().to_string();
                    tracing::warn!(worker_id, %reason, "worker died mid-chunk");
                    down(reason);
                    return;
                }
            }
        }
    }

    // Chunk queue closed: normal shutdown.
    proc.stop(STOP_TIMEOUT);
    clear_pid(&pids, worker_id);
}

fn clear_pid(pids: &Arc<Mutex<Vec<Option<Pid>>>>, worker_id: usize) {
    if let Ok(mut pids) = pids.lock() {
        pids[worker_id] = None;
    }
}
