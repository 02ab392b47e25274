//! The callable registry: parfor's serialization capability.
//!
//! Arbitrary closures cannot cross a process boundary, so callables travel as
//! names looked up in a process-wide registry. Both the parent and its worker
//! processes run the same `main`, so registering before [`crate::init`] puts
//! the same functions on both sides of the boundary.
//!
//! Items, arguments and results cross as JSON values; anything serde cannot
//! represent is rejected at submission time, never silently later.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::task::{Kwargs, Outcome, Task, TaskFault};

/// Monomorphic form every registered callable is stored as.
type RawFn =
    dyn Fn(&Value, &[Value], &Kwargs) -> std::result::Result<Value, TaskFault> + Send + Sync;

static REGISTRY: LazyLock<RwLock<HashMap<String, Arc<RawFn>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Typed handle to a registered callable.
///
/// Only the name crosses the process boundary; the type parameters keep the
/// call surfaces honest about what goes in and what comes out.
#[derive(Debug)]
pub struct FnRef<I, O> {
    name: String,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for FnRef<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _types: PhantomData,
        }
    }
}

impl<I, O> FnRef<I, O> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Register a callable under `name` and return a typed handle to it.
///
/// The callable receives the decoded iteration item plus the extra positional
/// and named arguments from the submission. Registration must happen before
/// [`crate::init`] so worker processes see the same table.
pub fn register<I, O, E, F>(name: &str, f: F) -> Result<FnRef<I, O>>
where
    I: DeserializeOwned,
    O: Serialize,
    E: std::fmt::Display,
    F: Fn(I, &[Value], &Kwargs) -> std::result::Result<O, E> + Send + Sync + 'static,
{
    let wrapped: Arc<RawFn> = Arc::new(move |item, args, kwargs| {
        let item: I = serde_json::from_value(item.clone())
            .map_err(|e| TaskFault::new(format!("cannot decode item: {e}")))?;
        let out = f(item, args, kwargs).map_err(|e| TaskFault::new(e.to_string()))?;
        serde_json::to_value(out).map_err(|e| TaskFault::new(format!("cannot encode result: {e}")))
    });

    let mut table = REGISTRY.write().expect("callable registry poisoned");
    if table.contains_key(name) {
        return Err(Error::DuplicateCallable(name.to_string()));
    }
    table.insert(name.to_string(), wrapped);

    Ok(FnRef {
        name: name.to_string(),
        _types: PhantomData,
    })
}

/// Whether a callable is registered under `name`.
pub fn is_registered(name: &str) -> bool {
    REGISTRY
        .read()
        .expect("callable registry poisoned")
        .contains_key(name)
}

fn lookup(name: &str) -> Option<Arc<RawFn>> {
    REGISTRY
        .read()
        .expect("callable registry poisoned")
        .get(name)
        .cloned()
}

/// Execute a task in the current process.
///
/// Used by workers, by the serial fallback, and by the confirming
/// re-execution on the fail-fast path. Panics inside the callable are caught
/// and reported as the task's fault.
pub(crate) fn execute(task: &Task) -> Outcome {
    let Some(f) = lookup(&task.call) else {
        return Err(TaskFault::new(format!(
            "no callable registered under '{}'",
            task.call
        )));
    };

    match catch_unwind(AssertUnwindSafe(|| f(&task.item, &task.args, &task.kwargs))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(TaskFault::new(format!(
            "callable '{}' panicked: {}",
            task.call,
            panic_message(&*payload)
        ))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
