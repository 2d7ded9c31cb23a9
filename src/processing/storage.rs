//! Persistence collaborators.
//!
//! The accessor records subtask progress and results through these traits so a peer that
//! rejoins a task can reload what is already known. The in-memory implementations back the
//! node binary and the tests.

use dashmap::DashMap;

use super::types::{SubTaskResult, SubTaskState};

pub trait SubTaskStateStorage: Send + Sync {
    fn change_subtask_state(&self, subtask_id: &str, state: SubTaskState);
    fn subtask_state(&self, subtask_id: &str) -> Option<SubTaskState>;
}

pub trait SubTaskResultStorage: Send + Sync {
    fn add_subtask_result(&self, result: &SubTaskResult);
    fn remove_subtask_result(&self, subtask_id: &str);
    /// Stored results among `subtask_ids`, in the order of `subtask_ids`.
    fn subtask_results(&self, subtask_ids: &[String]) -> Vec<SubTaskResult>;
}

#[derive(Default)]
pub struct InMemorySubTaskStateStorage {
    states: DashMap<String, SubTaskState>,
}

impl InMemorySubTaskStateStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubTaskStateStorage for InMemorySubTaskStateStorage {
    fn change_subtask_state(&self, subtask_id: &str, state: SubTaskState) {
        tracing::trace!("Subtask {} state -> {:?}", subtask_id, state);
        self.states.insert(subtask_id.to_string(), state);
    }

    fn subtask_state(&self, subtask_id: &str) -> Option<SubTaskState> {
        self.states.get(subtask_id).map(|entry| *entry.value())
    }
}

#[derive(Default)]
pub struct InMemorySubTaskResultStorage {
    results: DashMap<String, SubTaskResult>,
}

impl InMemorySubTaskResultStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl SubTaskResultStorage for InMemorySubTaskResultStorage {
    /// The first stored result of a subtask wins.
    fn add_subtask_result(&self, result: &SubTaskResult) {
        self.results
            .entry(result.subtask_id.clone())
            .or_insert_with(|| result.clone());
    }

    fn remove_subtask_result(&self, subtask_id: &str) {
        self.results.remove(subtask_id);
    }

    fn subtask_results(&self, subtask_ids: &[String]) -> Vec<SubTaskResult> {
        subtask_ids
            .iter()
            .filter_map(|id| self.results.get(id).map(|entry| entry.value().clone()))
            .collect()
    }
}
