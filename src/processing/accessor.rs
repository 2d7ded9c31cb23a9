//! Queue Accessor
//!
//! Per-task facade over the queue manager, the persistence collaborators and the
//! validation engine. Owns the result channel of the task and its finalization.

use crate::pubsub::PubSub;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::error::ProcessingError;
use super::manager::SubTaskQueueManager;
use super::storage::{SubTaskResultStorage, SubTaskStateStorage};
use super::types::{
    self, FinalizationStatus, SubTask, SubTaskResult, SubTaskState, TaskId, TaskResult,
};
use super::validation::ValidationCore;

/// Receives the assembled result of a finalized task.
pub type TaskResultSink = Arc<dyn Fn(TaskResult) + Send + Sync>;
/// Invoked once the local queue is connected (initialized locally or from a peer).
pub type QueueConnectedSink = Arc<dyn Fn() + Send + Sync>;

struct AccessorState {
    results: BTreeMap<String, SubTaskResult>,
    finalization: FinalizationStatus,
}

pub struct SubTaskQueueAccessor {
    task_id: TaskId,
    pubsub: Arc<dyn PubSub>,
    result_topic: String,
    manager: Arc<SubTaskQueueManager>,
    state_storage: Arc<dyn SubTaskStateStorage>,
    result_storage: Arc<dyn SubTaskResultStorage>,
    validation: ValidationCore,
    task_result_sink: TaskResultSink,
    state: Mutex<AccessorState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SubTaskQueueAccessor {
    pub fn new(
        task_id: TaskId,
        pubsub: Arc<dyn PubSub>,
        manager: Arc<SubTaskQueueManager>,
        state_storage: Arc<dyn SubTaskStateStorage>,
        result_storage: Arc<dyn SubTaskResultStorage>,
        task_result_sink: TaskResultSink,
    ) -> Arc<Self> {
        let result_topic = types::result_channel_topic(&task_id);
        tracing::debug!("Accessor created for task {} on {}", task_id, result_topic);

        Arc::new(Self {
            task_id,
            pubsub,
            result_topic,
            manager,
            state_storage,
            result_storage,
            validation: ValidationCore::new(),
            task_result_sink,
            state: Mutex::new(AccessorState {
                results: BTreeMap::new(),
                finalization: FinalizationStatus::NotFinalized,
            }),
            listener: Mutex::new(None),
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn manager(&self) -> &Arc<SubTaskQueueManager> {
        &self.manager
    }

    /// Subscribes the result channel and reports when the queue becomes available.
    ///
    /// `on_connected` runs on a spawned task, never inside the manager's callback.
    pub fn connect_to_subtask_queue(self: &Arc<Self>, on_connected: QueueConnectedSink) {
        let mut subscription = self.pubsub.subscribe(&self.result_topic);
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            while let Some(bytes) = subscription.recv().await {
                let Some(accessor) = weak.upgrade() else {
                    break;
                };
                accessor.on_result_channel_message(&bytes);
            }
        });

        if let Some(previous) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }

        let weak_owner = Arc::downgrade(self);
        self.manager.set_ownership_event_sink(Arc::new(move || {
            if let Some(accessor) = weak_owner.upgrade() {
                accessor.on_ownership_gained();
            }
        }));

        self.manager
            .set_assignment_event_sink(Arc::new(move |subtask_ids: Vec<String>| {
                tracing::debug!("Queue assigned with {} subtasks", subtask_ids.len());
                let on_connected = on_connected.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move { on_connected() });
                    }
                    Err(_) => on_connected(),
                }
            }));
    }

    /// Records the subtasks as enqueued and creates the queue with the local node as owner.
    pub fn assign_subtasks(&self, subtasks: Vec<SubTask>) -> Result<(), ProcessingError> {
        for subtask in &subtasks {
            self.state_storage
                .change_subtask_state(&subtask.subtask_id, SubTaskState::Enqueued);
        }

        self.manager.create_queue(subtasks)
    }

    /// Requests a subtask for local execution.
    ///
    /// Results already persisted for the queue's subtasks are reloaded first; if that completes
    /// the queue, finalization is attempted before any live grabbing. Resolves with `None`
    /// once the task is complete.
    pub fn grab_subtask(&self) -> oneshot::Receiver<Option<SubTask>> {
        let mut finalized_result = None;

        {
            let mut st = self.lock_state();
            if st.finalization != FinalizationStatus::NotFinalized {
                return ready(None);
            }

            if let Some(queue) = self.manager.queue_snapshot() {
                let subtask_ids = queue.subtask_ids();
                self.update_results_from_storage(&mut st, &subtask_ids);

                let processed: Vec<String> = st.results.keys().cloned().collect();
                self.manager.change_subtask_processing_states(processed, true);

                if self.manager.is_processed() {
                    let (status, task_result) =
                        self.finalize_queue_processing(&mut st, &queue.subtasks);
                    finalized_result = task_result;

                    if status != FinalizationStatus::NotFinalized {
                        drop(st);
                        self.emit_task_result(finalized_result);
                        return ready(None);
                    }
                }
            }
        }

        self.emit_task_result(finalized_result);
        self.manager.grab_subtask()
    }

    /// Persists a locally computed result and broadcasts it on the result channel.
    pub fn complete_subtask(&self, subtask_id: &str, result: SubTaskResult) {
        self.result_storage.add_subtask_result(&result);
        self.state_storage
            .change_subtask_state(subtask_id, SubTaskState::Processed);

        self.publish_result(&result);
        tracing::debug!("[RESULT_SENT] ({})", subtask_id);
    }

    /// Ingests a result from the result channel and finalizes once everything is processed.
    pub fn on_result_received(&self, result: SubTaskResult) -> FinalizationStatus {
        let subtask_id = result.subtask_id.clone();

        let (status, task_result, is_new, triggering) = {
            let mut st = self.lock_state();
            if st.finalization != FinalizationStatus::NotFinalized {
                tracing::debug!("Result for {} ignored, task already validated", subtask_id);
                return st.finalization;
            }

            let is_new = !st.results.contains_key(&subtask_id);
            if is_new {
                st.results.insert(subtask_id.clone(), result.clone());
            } else {
                tracing::debug!("[RESULT_DUPLICATE] ({})", subtask_id);
            }

            self.manager
                .change_subtask_processing_states([subtask_id.as_str()], true);

            if !self.manager.is_processed() {
                return FinalizationStatus::NotFinalized;
            }

            let Some(queue) = self.manager.queue_snapshot() else {
                return FinalizationStatus::NotFinalized;
            };

            let (status, task_result) = self.finalize_queue_processing(&mut st, &queue.subtasks);
            (status, task_result, is_new, result)
        };

        self.emit_task_result(task_result);

        if status == FinalizationStatus::FinalizedButNotOwner && is_new {
            tracing::debug!("Rebroadcasting result {} for the queue owner", subtask_id);
            self.publish_result(&triggering);
        }

        status
    }

    /// Finalizes a task validated while another peer owned the queue.
    ///
    /// Does nothing unless this peer is `FinalizedButNotOwner` and no owner has emitted the
    /// task result yet.
    pub fn on_ownership_gained(&self) -> FinalizationStatus {
        let (status, task_result) = {
            let mut st = self.lock_state();
            if st.finalization != FinalizationStatus::FinalizedButNotOwner
                || self.manager.is_queue_finalized()
            {
                return st.finalization;
            }

            let Some(queue) = self.manager.queue_snapshot() else {
                return st.finalization;
            };

            tracing::debug!("Ownership gained after validation of task {}", self.task_id);
            st.finalization = FinalizationStatus::NotFinalized;
            self.finalize_queue_processing(&mut st, &queue.subtasks)
        };

        self.emit_task_result(task_result);
        status
    }

    /// Accumulated results ordered by subtask id.
    pub fn results(&self) -> Vec<SubTaskResult> {
        self.lock_state().results.values().cloned().collect()
    }

    pub fn finalization_status(&self) -> FinalizationStatus {
        self.lock_state().finalization
    }

    /// Whether this peer has nothing left to do for the task.
    pub fn is_task_complete(&self) -> bool {
        self.finalization_status() != FinalizationStatus::NotFinalized
    }

    fn on_result_channel_message(&self, bytes: &[u8]) {
        match types::decode::<SubTaskResult>(bytes) {
            Ok(result) => {
                tracing::debug!("[RESULT_RECEIVED] ({})", result.subtask_id);
                self.on_result_received(result);
            }
            Err(e) => {
                tracing::warn!("Dropping undecodable result on {}: {}", self.result_topic, e);
            }
        }
    }

    fn update_results_from_storage(&self, st: &mut AccessorState, subtask_ids: &[String]) {
        let results = self.result_storage.subtask_results(subtask_ids);
        tracing::debug!("[RESULTS_LOADED] {} results loaded from results storage", results.len());

        for result in results {
            if subtask_ids.contains(&result.subtask_id) {
                st.results.entry(result.subtask_id.clone()).or_insert(result);
            } else {
                tracing::warn!("INVALID_RESULT_FOUND subtask id: '{}'", result.subtask_id);
            }
        }
    }

    /// Validates the accumulated results and, on the owner of a queue not yet finalized,
    /// assembles the task result.
    ///
    /// Invalid results are evicted locally and from result storage and handed back to the
    /// queue as unprocessed, so they get recomputed.
    fn finalize_queue_processing(
        &self,
        st: &mut AccessorState,
        subtasks: &[SubTask],
    ) -> (FinalizationStatus, Option<TaskResult>) {
        let report = self.validation.validate_results(subtasks, &st.results);
        tracing::debug!(
            "RESULTS_VALIDATED: {}",
            if report.is_valid() { "VALID" } else { "INVALID" }
        );

        if !report.is_valid() {
            for subtask_id in &report.invalid_subtask_ids {
                st.results.remove(subtask_id);
                self.result_storage.remove_subtask_result(subtask_id);
                self.state_storage
                    .change_subtask_state(subtask_id, SubTaskState::Enqueued);
            }

            tracing::warn!(
                "Task {}: {} invalid results evicted",
                self.task_id,
                report.invalid_subtask_ids.len()
            );
            self.manager
                .change_subtask_processing_states(report.invalid_subtask_ids, false);
            return (FinalizationStatus::NotFinalized, None);
        }

        if !self.manager.try_finalize_queue() {
            st.finalization = FinalizationStatus::FinalizedButNotOwner;
            return (FinalizationStatus::FinalizedButNotOwner, None);
        }

        st.finalization = FinalizationStatus::Finalized;
        tracing::info!("Task {} finalized with {} results", self.task_id, st.results.len());

        let task_result = TaskResult {
            task_id: self.task_id.clone(),
            subtask_results: st.results.values().cloned().collect(),
        };
        (FinalizationStatus::Finalized, Some(task_result))
    }

    fn emit_task_result(&self, task_result: Option<TaskResult>) {
        if let Some(task_result) = task_result {
            (self.task_result_sink)(task_result);
        }
    }

    fn publish_result(&self, result: &SubTaskResult) {
        let published = types::encode(result).and_then(|bytes| {
            self.pubsub
                .publish(&self.result_topic, bytes)
                .map_err(|e| ProcessingError::Transport(e.to_string()))
        });

        if let Err(e) = published {
            tracing::warn!("Failed to publish result {}: {}", result.subtask_id, e);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, AccessorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SubTaskQueueAccessor {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
    }
}

fn ready(subtask: Option<SubTask>) -> oneshot::Receiver<Option<SubTask>> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(subtask);
    rx
}
