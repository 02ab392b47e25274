//! Result slot bookkeeping.
//!
//! One slot per task id. A slot goes outstanding at submission, is filled
//! exactly once when its chunk result arrives, and is emptied when the caller
//! retrieves it. Completion order across workers is unconstrained; retrieval
//! is always by id.

use std::collections::{HashMap, HashSet};

use crate::task::{Outcome, TaskId};

#[derive(Debug, Default)]
pub(crate) struct ResultStore {
    filled: HashMap<TaskId, Outcome>,
    outstanding: HashSet<TaskId>,
}

impl ResultStore {
    pub fn with_capacity(hint: usize) -> Self {
        Self {
            filled: HashMap::with_capacity(hint),
            outstanding: HashSet::with_capacity(hint),
        }
    }

    /// Mark `id` as submitted.
    pub fn track(&mut self, id: TaskId) {
        self.outstanding.insert(id);
    }

    /// Whether `id` was ever submitted and not yet retrieved.
    pub fn known(&self, id: TaskId) -> bool {
        self.outstanding.contains(&id) || self.filled.contains_key(&id)
    }

    /// Store the outcome for `id`.
    ///
    /// A second fill for the same slot indicates a protocol bug upstream; the
    /// first outcome wins and the repeat is logged.
    pub fn fill(&mut self, id: TaskId, outcome: Outcome) {
        if !self.outstanding.remove(&id) {
            tracing::warn!(task = id, "dropping outcome for a slot that is not outstanding");
            return;
        }
        self.filled.insert(id, outcome);
    }

    /// Remove and return the outcome for `id`, if it has arrived.
    pub fn take(&mut self, id: TaskId) -> Option<Outcome> {
        self.filled.remove(&id)
    }

    /// Number of submitted tasks whose outcome has not arrived yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}
