//! parfor - parallel for-loops over a pool of worker processes.
//!
//! Maps a callable over an iterable on a bounded pool of worker OS
//! processes, returning the results in the original iteration order. Work
//! travels in chunks over pipes; results come back out of order and are
//! reassembled by task id. Small workloads skip the pool entirely and run
//! serially in the caller.
//!
//! Worker processes are the current executable re-executed with a marker in
//! the environment, so callables cross the boundary by registered name, not
//! by serialized code. Register first, then hand control to [`init`]:
//!
//! ```no_run
//! use parfor::{Parfor, TaskFault};
//! use serde_json::{Value, json};
//!
//! fn main() -> parfor::Result<()> {
//!     let square = parfor::register("square", |i: i64, args: &[Value], _kw| {
//!         let a = args.first().and_then(Value::as_i64).unwrap_or(1);
//!         Ok::<_, TaskFault>(a * i * i)
//!     })?;
//!     parfor::init();
//!
//!     let results: Vec<i64> = Parfor::new(&square)
//!         .args([json!(3)])
//!         .desc("squaring")
//!         .run(0..10)?;
//!     assert_eq!(results[9], 243);
//!     Ok(())
//! }
//! ```
//!
//! A failing task is re-executed in the calling process to confirm the
//! failure with full fidelity, then fails the whole call; with
//! [`pmap_captured`] the fault becomes that index's outcome instead. A
//! worker process dying is always fatal. The low-level [`Pool`] surface
//! supports heterogeneous tasks and result retrieval by id.

pub mod chunk;
pub mod error;
pub mod logging;
pub mod map;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod task;

mod collect;

pub use chunk::{Chunks, chunk_size, chunks};
pub use error::{Error, Result};
pub use map::{Options, Parfor, pmap, pmap_captured, pmap_on};
pub use pool::{Pool, PoolConfig, WorkerCount, init};
pub use progress::{MeterSink, ProgressSink};
pub use registry::{FnRef, register};
pub use task::{Kwargs, Outcome, TaskFault, TaskId};
