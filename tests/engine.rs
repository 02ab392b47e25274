//! End-to-end engine tests.
//!
//! This binary runs without the libtest harness: pool workers are
//! re-executions of the current executable, so `main` must register the
//! callables and reach the worker hook before anything else happens. Each
//! scenario prints one `ok` line; any failure aborts the run with a nonzero
//! exit.

use anyhow::{Context, Result, bail, ensure};
use serde_json::{Value, json};

use parfor::{
    Error, FnRef, Kwargs, Options, Parfor, Pool, PoolConfig, TaskFault, WorkerCount, pmap,
    pmap_captured, pmap_on,
};

struct Callables {
    square: FnRef<i64, i64>,
    triple: FnRef<i64, i64>,
    flaky: FnRef<i64, i64>,
    whoami: FnRef<i64, u32>,
    whoami_slow: FnRef<i64, u32>,
    die: FnRef<i64, i64>,
}

fn register_all() -> parfor::Result<Callables> {
    Ok(Callables {
        square: parfor::register("scale-square", |i: i64, args: &[Value], _kw: &Kwargs| {
            let a = args.first().and_then(Value::as_i64).unwrap_or(1);
            Ok::<_, TaskFault>(a * i * i)
        })?,
        triple: parfor::register("triple", |i: i64, _: &[Value], _: &Kwargs| {
            Ok::<_, TaskFault>(3 * i)
        })?,
        flaky: parfor::register("flaky-double", |i: i64, _: &[Value], _: &Kwargs| {
            if i == 3 {
                Err(TaskFault::new("boom at index 3"))
            } else {
                Ok(2 * i)
            }
        })?,
        whoami: parfor::register("whoami", |_: i64, _: &[Value], _: &Kwargs| {
            Ok::<_, TaskFault>(std::process::id())
        })?,
        whoami_slow: parfor::register("whoami-slow", |_: i64, _: &[Value], _: &Kwargs| {
            std::thread::sleep(std::time::Duration::from_millis(25));
            Ok::<_, TaskFault>(std::process::id())
        })?,
        die: parfor::register("die-quietly", |i: i64, _: &[Value], _: &Kwargs| {
            if i == 5 {
                // Hard worker death, not a task error.
                std::process::exit(7);
            }
            Ok::<_, TaskFault>(i)
        })?,
    })
}

fn main() -> Result<()> {
    let fns = register_all().context("registration failed")?;
    parfor::init();
    parfor::logging::init(parfor::logging::LogConfig::default().with_env_overrides());

    let scenarios: &[(&str, fn(&Callables) -> Result<()>)] = &[
        ("parallel matches serial across worker counts", scale_square_matches_serial),
        ("length-hinted lazy source", lazy_source_with_length),
        ("missing length is rejected", missing_length_is_rejected),
        ("serial fallback stays in process", serial_fallback_stays_in_process),
        ("parallel work leaves the calling process", parallel_runs_in_workers),
        ("fail-fast surfaces the task error", fail_fast_aborts),
        ("captured faults fill every slot", captured_faults_fill_every_slot),
        ("pool reuse across batches", pool_reuse_across_batches),
        ("pool misuse is rejected", pool_misuse_is_rejected),
        ("mapping on a shared pool", mapping_on_a_shared_pool),
        ("worker death is fatal", worker_death_is_fatal),
        ("progress sinks accept updates", progress_sinks_accept_updates),
    ];

    for (name, scenario) in scenarios {
        scenario(&fns).with_context(|| format!("scenario failed: {name}"))?;
        eprintln!("ok - {name}");
    }
    eprintln!("all engine scenarios passed");
    Ok(())
}

fn quiet(workers: usize) -> Options {
    Options {
        bar: false,
        workers: WorkerCount::Count(workers),
        ..Options::default()
    }
}

fn scale_square_matches_serial(fns: &Callables) -> Result<()> {
    let expected = vec![0, 3, 12, 27, 48, 75, 108, 147, 192, 243];

    let serial: Vec<i64> = pmap(
        &fns.square,
        0..10,
        &Options {
            args: vec![json!(3)],
            serial: usize::MAX,
            bar: false,
            ..Options::default()
        },
    )?;
    ensure!(serial == expected, "serial run diverged: {serial:?}");

    for workers in [1, 2, 4] {
        let opts = Options {
            args: vec![json!(3)],
            ..quiet(workers)
        };
        let parallel: Vec<i64> = pmap(&fns.square, 0..10, &opts)?;
        ensure!(
            parallel == expected,
            "parallel run with {workers} workers diverged: {parallel:?}"
        );
    }
    Ok(())
}

fn lazy_source_with_length(fns: &Callables) -> Result<()> {
    let mut n = -1i64;
    let endless = std::iter::from_fn(move || {
        n += 1;
        Some(n)
    });

    let opts = Options {
        length: Some(5),
        ..quiet(2)
    };
    let got: Vec<i64> = pmap(&fns.square, endless, &opts)?;
    ensure!(got == vec![0, 1, 4, 9, 16], "lazy mapping diverged: {got:?}");
    Ok(())
}

fn missing_length_is_rejected(fns: &Callables) -> Result<()> {
    let mut n = 0i64;
    let endless = std::iter::from_fn(move || {
        n += 1;
        Some(n)
    });

    match pmap(&fns.square, endless, &quiet(2)) {
        Err(Error::LengthRequired) => Ok(()),
        Err(other) => bail!("expected a length error, got: {other}"),
        Ok(_) => bail!("length-less source was accepted"),
    }
}

fn serial_fallback_stays_in_process(fns: &Callables) -> Result<()> {
    // Three tasks sit under the default threshold of four.
    let pids: Vec<u32> = pmap(&fns.whoami, 0..3, &quiet(2))?;
    let me = std::process::id();
    ensure!(
        pids.iter().all(|pid| *pid == me),
        "serial fallback left the calling process: {pids:?} vs {me}"
    );
    Ok(())
}

fn parallel_runs_in_workers(fns: &Callables) -> Result<()> {
    let pids: Vec<u32> = pmap(&fns.whoami_slow, 0..12, &quiet(2))?;
    let me = std::process::id();
    ensure!(pids.len() == 12, "expected 12 results, got {}", pids.len());
    ensure!(
        pids.iter().all(|pid| *pid != me),
        "parallel work ran in the calling process: {pids:?}"
    );
    Ok(())
}

fn fail_fast_aborts(fns: &Callables) -> Result<()> {
    match pmap(&fns.flaky, 0..10, &quiet(2)) {
        Err(Error::TaskError { id, message }) => {
            ensure!(id == 3, "wrong failing task id: {id}");
            ensure!(
                message.contains("boom at index 3"),
                "task error lost its identity: {message}"
            );
            Ok(())
        }
        Err(other) => bail!("expected a task error, got: {other}"),
        Ok(list) => bail!("a result list was produced despite the failure: {list:?}"),
    }
}

fn captured_faults_fill_every_slot(fns: &Callables) -> Result<()> {
    let got = pmap_captured(&fns.flaky, 0..10, &quiet(2))?;
    ensure!(got.len() == 10, "expected 10 outcomes, got {}", got.len());

    for (i, outcome) in got.iter().enumerate() {
        if i == 3 {
            let fault = outcome
                .as_ref()
                .err()
                .context("index 3 should hold the captured fault")?;
            ensure!(fault.message().contains("boom at index 3"));
        } else {
            let value = outcome
                .as_ref()
                .ok()
                .with_context(|| format!("index {i} should hold a value"))?;
            ensure!(*value == 2 * i as i64, "wrong value at {i}: {value}");
        }
    }
    Ok(())
}

fn pool_reuse_across_batches(fns: &Callables) -> Result<()> {
    let mut pool = Pool::open(PoolConfig {
        workers: WorkerCount::Count(2),
        ..PoolConfig::default()
    })?;

    // First batch: three squares scaled by 3.
    let mut ids = Vec::new();
    for i in 0..3i64 {
        ids.push(pool.submit_task(&fns.square, i, vec![json!(3)], Kwargs::new())?);
    }
    // Second batch: two triples, via the untyped surface.
    ids.push(pool.submit("triple", json!(10), Vec::new(), Kwargs::new())?);
    ids.push(pool.submit("triple", json!(20), Vec::new(), Kwargs::new())?);

    ensure!(ids == vec![0, 1, 2, 3, 4], "ids not disjoint and ordered: {ids:?}");

    // Request by id in arbitrary order.
    let expected: &[(u64, i64)] = &[(4, 60), (1, 3), (3, 30), (0, 0), (2, 12)];
    for (id, want) in expected {
        let got: i64 = pool
            .request_as(*id)?
            .map_err(|fault| anyhow::anyhow!("task {id} faulted: {fault}"))?;
        ensure!(got == *want, "task {id}: expected {want}, got {got}");
    }

    pool.close();
    Ok(())
}

fn pool_misuse_is_rejected(_fns: &Callables) -> Result<()> {
    let mut pool = Pool::open(PoolConfig {
        workers: WorkerCount::Count(1),
        ..PoolConfig::default()
    })?;

    match pool.submit("never-registered", json!(1), Vec::new(), Kwargs::new()) {
        Err(Error::UnknownCallable(name)) => ensure!(name == "never-registered"),
        other => bail!("unregistered callable was accepted: {other:?}"),
    }

    match pool.request(99) {
        Err(Error::UnknownHandle(99)) => {}
        other => bail!("unsubmitted handle was served: {other:?}"),
    }

    pool.close();
    match pool.submit("triple", json!(1), Vec::new(), Kwargs::new()) {
        Err(Error::PoolClosed) => Ok(()),
        other => bail!("closed pool accepted work: {other:?}"),
    }
}

fn mapping_on_a_shared_pool(fns: &Callables) -> Result<()> {
    let mut pool = Pool::open(PoolConfig {
        workers: WorkerCount::Count(2),
        capture_faults: true,
        ..PoolConfig::default()
    })?;

    let first = pmap_on(&mut pool, &fns.flaky, 0..6, &quiet(2))?;
    ensure!(first.len() == 6);
    ensure!(first[3].is_err(), "fault was not captured on the shared pool");
    ensure!(first[5].as_ref().ok() == Some(&10));

    // The pool survives for another round with a different callable.
    let second = pmap_on(&mut pool, &fns.triple, 0..6, &quiet(2))?;
    let values: Vec<i64> = second
        .into_iter()
        .collect::<std::result::Result<_, _>>()
        .map_err(|fault| anyhow::anyhow!("unexpected fault: {fault}"))?;
    ensure!(values == vec![0, 3, 6, 9, 12, 15]);

    pool.close();
    Ok(())
}

fn worker_death_is_fatal(fns: &Callables) -> Result<()> {
    match pmap(&fns.die, 0..10, &quiet(2)) {
        Err(Error::WorkerCrash { reason, .. }) => {
            ensure!(
                reason.contains("code 7"),
                "crash reason lost the exit status: {reason}"
            );
            Ok(())
        }
        Err(other) => bail!("expected a worker crash, got: {other}"),
        Ok(list) => bail!("a result list was produced despite the crash: {list:?}"),
    }
}

fn progress_sinks_accept_updates(fns: &Callables) -> Result<()> {
    let got: Vec<i64> = Parfor::new(&fns.square)
        .args([json!(2)])
        .desc("engine test")
        .backlog_bar(true)
        .workers(2)
        .run(0..30)?;
    ensure!(got.len() == 30);
    ensure!(got[7] == 2 * 49, "wrong value under progress display: {}", got[7]);
    Ok(())
}
