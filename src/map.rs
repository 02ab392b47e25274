//! High-level call surfaces over the pool.
//!
//! [`pmap`] maps a registered callable over an iterable and returns the
//! results in iteration order. [`Parfor`] is the same engine behind a
//! builder, for call sites that want to bind configuration ahead of time.
//! Small workloads never touch a pool: below the serial threshold every task
//! runs synchronously in the caller.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::chunk::{chunk_size, chunks};
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolConfig, WorkerCount};
use crate::progress::{MeterSink, ProgressSink};
use crate::registry::{self, FnRef};
use crate::task::{Kwargs, Outcome, Task, TaskFault, TaskId};

/// Configuration for one mapping operation.
#[derive(Debug, Clone)]
pub struct Options {
    /// Extra positional arguments passed to the callable after the item.
    pub args: Vec<Value>,
    /// Extra named arguments passed to the callable.
    pub kwargs: Kwargs,
    /// Task count for sources without an intrinsic length; also caps longer
    /// sources.
    pub length: Option<usize>,
    /// Progress bar label.
    pub desc: Option<String>,
    /// Show the progress bar.
    pub bar: bool,
    /// Show the backlog (submitted − completed) meter.
    pub backlog_bar: bool,
    /// Worker process count.
    pub workers: WorkerCount,
    /// Below this many tasks, run serially in the caller.
    pub serial: usize,
    /// Chunking granularity: target chunks per worker.
    pub chunks_per_worker: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            kwargs: Kwargs::new(),
            length: None,
            desc: None,
            bar: true,
            backlog_bar: false,
            workers: WorkerCount::Auto,
            serial: 4,
            chunks_per_worker: 4,
        }
    }
}

/// Map a registered callable over `items`, in parallel, preserving order.
///
/// Fail-fast: if any task errors (confirmed by re-execution in the caller),
/// the whole call errors and no result list is produced.
pub fn pmap<I, O, It>(f: &FnRef<I, O>, items: It, opts: &Options) -> Result<Vec<O>>
where
    I: Serialize,
    O: DeserializeOwned,
    It: IntoIterator<Item = I>,
{
    let outcomes = run(f.name(), items, opts, false)?;
    decode_strict(outcomes)
}

/// Like [`pmap`], but task faults become outcomes instead of errors.
///
/// The returned list always has one entry per input item: the value, or the
/// captured fault at the failing index.
pub fn pmap_captured<I, O, It>(
    f: &FnRef<I, O>,
    items: It,
    opts: &Options,
) -> Result<Vec<std::result::Result<O, TaskFault>>>
where
    I: Serialize,
    O: DeserializeOwned,
    It: IntoIterator<Item = I>,
{
    let outcomes = run(f.name(), items, opts, true)?;
    decode_captured(outcomes)
}

/// Run a mapping on a caller-supplied pool instead of a fresh one.
///
/// The pool's fault mode decides whether task errors are captured or fatal.
/// On a fatal error the pool is aborted before the error propagates.
pub fn pmap_on<I, O, It>(
    pool: &mut Pool,
    f: &FnRef<I, O>,
    items: It,
    opts: &Options,
) -> Result<Vec<std::result::Result<O, TaskFault>>>
where
    I: Serialize,
    O: DeserializeOwned,
    It: IntoIterator<Item = I>,
{
    let iter = items.into_iter();
    let total = resolve_total(&iter, opts)?;
    let iter = iter.take(total);

    if total < opts.serial {
        let capture = pool.captures_faults();
        return decode_captured(run_serial(f.name(), iter, opts, capture)?);
    }

    match drive(pool, f.name(), iter, total, opts) {
        Ok(outcomes) => decode_captured(outcomes),
        Err(e) => {
            pool.abort();
            Err(e)
        }
    }
}

/// Builder-style surface binding a callable and its configuration ahead of
/// the call.
#[derive(Debug, Clone)]
pub struct Parfor<'f, I, O> {
    f: &'f FnRef<I, O>,
    opts: Options,
}

impl<'f, I, O> Parfor<'f, I, O>
where
    I: Serialize,
    O: DeserializeOwned,
{
    pub fn new(f: &'f FnRef<I, O>) -> Self {
        Self {
            f,
            opts: Options::default(),
        }
    }

    /// Extra positional arguments for every call.
    pub fn args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.opts.args = args.into_iter().collect();
        self
    }

    /// Extra named arguments for every call.
    pub fn kwargs(mut self, kwargs: Kwargs) -> Self {
        self.opts.kwargs = kwargs;
        self
    }

    /// Explicit task count for length-less sources.
    pub fn length(mut self, length: usize) -> Self {
        self.opts.length = Some(length);
        self
    }

    /// Progress bar label.
    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.opts.desc = Some(desc.into());
        self
    }

    /// Toggle the progress bar.
    pub fn bar(mut self, enabled: bool) -> Self {
        self.opts.bar = enabled;
        self
    }

    /// Toggle the backlog meter.
    pub fn backlog_bar(mut self, enabled: bool) -> Self {
        self.opts.backlog_bar = enabled;
        self
    }

    /// Worker process count.
    pub fn workers(mut self, workers: impl Into<WorkerCount>) -> Self {
        self.opts.workers = workers.into();
        self
    }

    /// Serial fallback threshold.
    pub fn serial(mut self, serial: usize) -> Self {
        self.opts.serial = serial;
        self
    }

    /// Chunking granularity: target chunks per worker.
    pub fn chunks_per_worker(mut self, n: usize) -> Self {
        self.opts.chunks_per_worker = n;
        self
    }

    /// Run fail-fast; see [`pmap`].
    pub fn run<It: IntoIterator<Item = I>>(&self, items: It) -> Result<Vec<O>> {
        pmap(self.f, items, &self.opts)
    }

    /// Run with fault capture; see [`pmap_captured`].
    pub fn run_captured<It: IntoIterator<Item = I>>(
        &self,
        items: It,
    ) -> Result<Vec<std::result::Result<O, TaskFault>>> {
        pmap_captured(self.f, items, &self.opts)
    }
}

/// Decide serial vs parallel and produce raw outcomes in iteration order.
fn run<I, It>(call: &str, items: It, opts: &Options, capture: bool) -> Result<Vec<Outcome>>
where
    I: Serialize,
    It: IntoIterator<Item = I>,
{
    let iter = items.into_iter();
    let total = resolve_total(&iter, opts)?;
    let iter = iter.take(total);

    if total < opts.serial {
        return run_serial(call, iter, opts, capture);
    }

    let workers = opts.workers.resolve();
    let config = PoolConfig {
        workers: WorkerCount::Count(workers),
        capture_faults: capture,
        ..PoolConfig::default()
    };
    let mut pool = Pool::open_with_progress(config, build_sink(opts, total))?;

    match drive(&mut pool, call, iter, total, opts) {
        Ok(outcomes) => {
            pool.close();
            Ok(outcomes)
        }
        Err(e) => {
            // Release every worker before the error surfaces.
            pool.abort();
            Err(e)
        }
    }
}

/// Total task count: explicit hint, else the iterator's exact size.
fn resolve_total<I: Iterator>(iter: &I, opts: &Options) -> Result<usize> {
    if let Some(length) = opts.length {
        return Ok(length);
    }
    match iter.size_hint() {
        (lo, Some(hi)) if lo == hi => Ok(lo),
        _ => Err(Error::LengthRequired),
    }
}

/// The serial fallback: every task runs in the calling process.
fn run_serial<I, It>(call: &str, items: It, opts: &Options, capture: bool) -> Result<Vec<Outcome>>
where
    I: Serialize,
    It: IntoIterator<Item = I>,
{
    let mut outcomes = Vec::new();
    for (id, item) in items.into_iter().enumerate() {
        let id = id as TaskId;
        let task = Task {
            id,
            call: call.to_string(),
            item: serde_json::to_value(item)?,
            args: opts.args.clone(),
            kwargs: opts.kwargs.clone(),
        };
        match registry::execute(&task) {
            Ok(value) => outcomes.push(Ok(value)),
            Err(fault) if capture => outcomes.push(Err(fault)),
            Err(fault) => {
                return Err(Error::TaskError {
                    id,
                    message: fault.message().to_string(),
                });
            }
        }
    }
    Ok(outcomes)
}

/// Chunk the source into the pool and collect every outcome in id order.
fn drive<I, It>(
    pool: &mut Pool,
    call: &str,
    items: It,
    total: usize,
    opts: &Options,
) -> Result<Vec<Outcome>>
where
    I: Serialize,
    It: IntoIterator<Item = I>,
{
    let size = chunk_size(total, pool.worker_count(), opts.chunks_per_worker);

    let mut ids: Vec<TaskId> = Vec::with_capacity(total);
    for batch in chunks(items, size) {
        let values = batch
            .into_iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        ids.extend(pool.submit_batch(call, values, &opts.args, &opts.kwargs)?);
    }

    let mut outcomes = Vec::with_capacity(ids.len());
    for id in ids {
        outcomes.push(pool.request(id)?);
    }
    Ok(outcomes)
}

fn build_sink(opts: &Options, total: usize) -> Option<Box<dyn ProgressSink>> {
    if !opts.bar && !opts.backlog_bar {
        return None;
    }
    Some(Box::new(MeterSink::new(
        opts.desc.as_deref(),
        Some(total as u64),
        opts.bar,
        opts.backlog_bar,
    )))
}

fn decode_strict<O: DeserializeOwned>(outcomes: Vec<Outcome>) -> Result<Vec<O>> {
    let mut out = Vec::with_capacity(outcomes.len());
    for (id, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(value) => out.push(serde_json::from_value(value)?),
            // Unreachable in fail-fast mode; surface it honestly anyway.
            Err(fault) => {
                return Err(Error::TaskError {
                    id: id as TaskId,
                    message: fault.message().to_string(),
                });
            }
        }
    }
    Ok(out)
}

fn decode_captured<O: DeserializeOwned>(
    outcomes: Vec<Outcome>,
) -> Result<Vec<std::result::Result<O, TaskFault>>> {
    let mut out = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            Ok(value) => out.push(Ok(serde_json::from_value(value)?)),
            Err(fault) => out.push(Err(fault)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::register;
    use serde_json::json;

    fn serial_opts() -> Options {
        Options {
            bar: false,
            // Everything in these tests stays under the threshold, so no
            // worker process is ever spawned.
            serial: usize::MAX,
            ..Options::default()
        }
    }

    #[test]
    fn test_serial_map_preserves_order() {
        let f = register("map-square", |i: i64, args: &[Value], _: &Kwargs| {
            let a = args.first().and_then(Value::as_i64).unwrap_or(1);
            Ok::<_, TaskFault>(a * i * i)
        })
        .unwrap();

        let opts = Options {
            args: vec![json!(3)],
            ..serial_opts()
        };
        let got: Vec<i64> = pmap(&f, 0..10, &opts).unwrap();
        assert_eq!(got, vec![0, 3, 12, 27, 48, 75, 108, 147, 192, 243]);
    }

    #[test]
    fn test_serial_kwargs_reach_callable() {
        let f = register("map-offset", |i: i64, _: &[Value], kw: &Kwargs| {
            let off = kw.get("offset").and_then(Value::as_i64).unwrap_or(0);
            Ok::<_, TaskFault>(i + off)
        })
        .unwrap();

        let mut kwargs = Kwargs::new();
        kwargs.insert("offset".to_string(), json!(100));
        let opts = Options {
            kwargs,
            ..serial_opts()
        };
        let got: Vec<i64> = pmap(&f, 0..3, &opts).unwrap();
        assert_eq!(got, vec![100, 101, 102]);
    }

    #[test]
    fn test_serial_fail_fast() {
        let f = register("map-picky", |i: i64, _: &[Value], _: &Kwargs| {
            if i == 2 {
                Err(TaskFault::new("two is right out"))
            } else {
                Ok(i)
            }
        })
        .unwrap();

        let err = pmap(&f, 0..5, &serial_opts()).unwrap_err();
        match err {
            Error::TaskError { id, message } => {
                assert_eq!(id, 2);
                assert!(message.contains("two is right out"));
            }
            other => panic!("expected task error, got {other}"),
        }
    }

    #[test]
    fn test_serial_capture_fills_every_slot() {
        let f = register("map-flaky", |i: i64, _: &[Value], _: &Kwargs| {
            if i == 1 {
                Err(TaskFault::new("hiccup"))
            } else {
                Ok(i * 10)
            }
        })
        .unwrap();

        let got = pmap_captured(&f, 0..4, &serial_opts()).unwrap();
        assert_eq!(got.len(), 4);
        assert_eq!(got[0].as_ref().unwrap(), &0);
        assert_eq!(got[1].as_ref().unwrap_err().message(), "hiccup");
        assert_eq!(got[2].as_ref().unwrap(), &20);
        assert_eq!(got[3].as_ref().unwrap(), &30);
    }

    #[test]
    fn test_length_required_for_lazy_sources() {
        let f = register("map-id", |i: i64, _: &[Value], _: &Kwargs| {
            Ok::<_, TaskFault>(i)
        })
        .unwrap();

        let mut n = 0i64;
        let lazy = std::iter::from_fn(move || {
            n += 1;
            Some(n)
        });
        let err = pmap(&f, lazy, &serial_opts()).unwrap_err();
        assert!(matches!(err, Error::LengthRequired));
    }

    #[test]
    fn test_length_hint_caps_lazy_sources() {
        let f = register("map-id2", |i: i64, _: &[Value], _: &Kwargs| {
            Ok::<_, TaskFault>(i)
        })
        .unwrap();

        let mut n = -1i64;
        let lazy = std::iter::from_fn(move || {
            n += 1;
            Some(n)
        });
        let opts = Options {
            length: Some(5),
            ..serial_opts()
        };
        let got: Vec<i64> = pmap(&f, lazy, &opts).unwrap();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_builder_binds_configuration() {
        let f = register("map-builder", |i: i64, args: &[Value], _: &Kwargs| {
            let a = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok::<_, TaskFault>(i * a)
        })
        .unwrap();

        let bound = Parfor::new(&f)
            .args([json!(7)])
            .bar(false)
            .serial(usize::MAX)
            .desc("scaling");
        let got: Vec<i64> = bound.run(0..3).unwrap();
        assert_eq!(got, vec![0, 7, 14]);
        // The builder is reusable.
        let again: Vec<i64> = bound.run(vec![5]).unwrap();
        assert_eq!(again, vec![35]);
    }

    #[test]
    fn test_empty_input_yields_empty_output() {
        let f = register("map-empty", |i: i64, _: &[Value], _: &Kwargs| {
            Ok::<_, TaskFault>(i)
        })
        .unwrap();
        let got: Vec<i64> = pmap(&f, Vec::<i64>::new(), &serial_opts()).unwrap();
        assert!(got.is_empty());
    }
}
