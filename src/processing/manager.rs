//! Queue Manager
//!
//! Runs the ownership and locking protocol of one replicated queue.
//!
//! ## Protocol
//! - **Grab**: callers enqueue a one-shot receiver. The owner serves pending grabs strictly in
//!   submission order, publishing a snapshot after every lock. When nothing is free it unlocks
//!   expired items, and failing that arms the grab timer for the earliest lock expiration.
//! - **Ownership**: a non-owner broadcasts an ownership request and arms the response timer.
//!   The owner answers by moving ownership to the requester and publishing. When the timer
//!   expires without a newer snapshot, the waiting peers run the rollback heuristic.
//! - **Merge**: inbound snapshots replace local state only when strictly newer.
//! - **Finalize**: the owner that emits the task result marks the queue finalized, so a later
//!   owner never emits it again.
//!
//! All state lives behind one mutex per queue. Sinks are always invoked with the lock released.

use crate::config::ProcessingConfig;
use crate::pubsub::types::NodeId;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::channel::SubTaskQueueChannel;
use super::clock::{Clock, SystemClock};
use super::error::ProcessingError;
use super::shared_queue::SharedQueue;
use super::types::{Ownership, SubTask, SubTaskQueue, SubTaskQueueRequest};

/// Receives the full subtask id list once the local queue is initialized.
pub type AssignmentEventSink = Arc<dyn Fn(Vec<String>) + Send + Sync>;
/// Receives a description of a terminal processing condition.
pub type ProcessingErrorSink = Arc<dyn Fn(&str) + Send + Sync>;
/// Invoked when the local node becomes the queue owner through a snapshot or a rollback.
pub type OwnershipEventSink = Arc<dyn Fn() + Send + Sync>;

const MIN_GRAB_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Grab,
    Response,
}

/// A timer that can be re-armed or cancelled; stale firings are recognised by generation.
#[derive(Default)]
struct TimerSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    fn cancel(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Claims a firing. Returns `false` when the timer was re-armed or cancelled since.
    fn fire(&mut self, generation: u64) -> bool {
        if self.generation != generation || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        true
    }
}

struct ManagerState {
    queue: SharedQueue,
    subtasks: Vec<SubTask>,
    processed_ids: HashSet<String>,
    pending_grabs: VecDeque<oneshot::Sender<Option<SubTask>>>,
    processing_timeout: Duration,
    grab_timer: TimerSlot,
    response_timer: TimerSlot,
    owned_since_ns: Option<u64>,
    owned_total_ns: u64,
}

impl ManagerState {
    fn timer_mut(&mut self, kind: TimerKind) -> &mut TimerSlot {
        match kind {
            TimerKind::Grab => &mut self.grab_timer,
            TimerKind::Response => &mut self.response_timer,
        }
    }

    fn is_processed(&self) -> bool {
        self.queue.is_initialized()
            && self
                .subtasks
                .iter()
                .all(|subtask| self.processed_ids.contains(&subtask.subtask_id))
    }

    fn unprocessed_indices(&self) -> Vec<usize> {
        self.subtasks
            .iter()
            .enumerate()
            .filter(|(_, subtask)| !self.processed_ids.contains(&subtask.subtask_id))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn snapshot(&self) -> Option<SubTaskQueue> {
        self.queue.queue().map(|processing_queue| SubTaskQueue {
            processing_queue: processing_queue.clone(),
            subtasks: self.subtasks.clone(),
        })
    }

    fn subtask_ids(&self) -> Vec<String> {
        self.subtasks.iter().map(|s| s.subtask_id.clone()).collect()
    }

    fn ownership_acquired(&mut self) {
        if self.owned_since_ns.is_none() {
            self.owned_since_ns = Some(self.queue.now_ns());
        }
    }

    fn ownership_released(&mut self) {
        if let Some(since) = self.owned_since_ns.take() {
            self.owned_total_ns += self.queue.now_ns().saturating_sub(since);
        }
    }
}

/// Side effects that must run after the state lock is released.
#[derive(Default)]
#[must_use]
struct Deferred {
    assigned: Option<Vec<String>>,
    exhausted: bool,
    ownership_gained: bool,
}

pub struct SubTaskQueueManager {
    local_node_id: NodeId,
    channel: Arc<dyn SubTaskQueueChannel>,
    queue_response_timeout: Duration,
    state: Mutex<ManagerState>,
    assignment_sink: Mutex<Option<AssignmentEventSink>>,
    error_sink: Mutex<Option<ProcessingErrorSink>>,
    ownership_sink: Mutex<Option<OwnershipEventSink>>,
    weak_self: Weak<Self>,
}

impl SubTaskQueueManager {
    pub fn new(
        channel: Arc<dyn SubTaskQueueChannel>,
        local_node_id: NodeId,
        config: &ProcessingConfig,
    ) -> Arc<Self> {
        Self::with_clock(channel, local_node_id, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        channel: Arc<dyn SubTaskQueueChannel>,
        local_node_id: NodeId,
        config: &ProcessingConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            local_node_id: local_node_id.clone(),
            channel,
            queue_response_timeout: config.queue_response_timeout,
            state: Mutex::new(ManagerState {
                queue: SharedQueue::new(local_node_id, clock),
                subtasks: Vec::new(),
                processed_ids: HashSet::new(),
                pending_grabs: VecDeque::new(),
                processing_timeout: config.processing_timeout,
                grab_timer: TimerSlot::default(),
                response_timer: TimerSlot::default(),
                owned_since_ns: None,
                owned_total_ns: 0,
            }),
            assignment_sink: Mutex::new(None),
            error_sink: Mutex::new(None),
            ownership_sink: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    /// Installs `subtasks` as a fresh queue owned by the local node and publishes it.
    pub fn create_queue(&self, subtasks: Vec<SubTask>) -> Result<(), ProcessingError> {
        check_split(&subtasks)?;

        let deferred = {
            let mut st = self.lock_state();

            st.subtasks = subtasks;
            st.processed_ids.clear();
            st.grab_timer.cancel();
            st.response_timer.cancel();

            let item_count = st.subtasks.len();
            st.queue.create_queue(item_count);
            st.owned_since_ns = None;
            st.ownership_acquired();

            tracing::debug!("Subtask queue created with {} subtasks", item_count);
            self.publish_queue(&st);

            let mut deferred = Deferred {
                assigned: Some(st.subtask_ids()),
                ..Deferred::default()
            };
            if !st.pending_grabs.is_empty() {
                deferred.exhausted = self.process_pending_subtask_grabbing(&mut st);
            }
            deferred
        };

        self.run_deferred(deferred);
        Ok(())
    }

    /// Requests one subtask. Resolves with `None` once every subtask is processed.
    pub fn grab_subtask(&self) -> oneshot::Receiver<Option<SubTask>> {
        let (tx, rx) = oneshot::channel();

        let exhausted = {
            let mut st = self.lock_state();
            st.pending_grabs.push_back(tx);
            self.grab_subtasks(&mut st)
        };

        self.run_deferred(Deferred {
            exhausted,
            ..Deferred::default()
        });
        rx
    }

    pub fn move_ownership_to(&self, node_id: &NodeId) -> bool {
        let mut st = self.lock_state();
        self.transfer_ownership(&mut st, node_id)
    }

    pub fn has_ownership(&self) -> bool {
        self.lock_state().queue.has_ownership()
    }

    pub fn ownership(&self) -> Ownership {
        self.lock_state().queue.ownership()
    }

    pub fn is_queue_initialized(&self) -> bool {
        self.lock_state().queue.is_initialized()
    }

    pub fn queue_snapshot(&self) -> Option<SubTaskQueue> {
        self.lock_state().snapshot()
    }

    /// Whether some owner already emitted the task result.
    pub fn is_queue_finalized(&self) -> bool {
        self.lock_state().queue.is_finalized()
    }

    /// Claims the right to emit the task result: succeeds only on the owner of a queue not
    /// yet finalized, and publishes the marked snapshot.
    pub fn try_finalize_queue(&self) -> bool {
        let mut st = self.lock_state();
        if !st.queue.mark_finalized() {
            return false;
        }

        tracing::debug!("QUEUE_FINALIZED");
        self.publish_queue(&st);
        true
    }

    /// Merges an inbound snapshot. Returns whether the local queue changed.
    pub fn process_queue_message(&self, remote: SubTaskQueue) -> bool {
        if remote.processing_queue.items.len() != remote.subtasks.len() {
            tracing::warn!(
                "Ignoring malformed queue snapshot: {} items for {} subtasks",
                remote.processing_queue.items.len(),
                remote.subtasks.len()
            );
            return false;
        }

        let deferred = {
            let mut st = self.lock_state();
            let was_initialized = st.queue.is_initialized();
            let had_ownership = st.queue.has_ownership();

            let SubTaskQueue {
                processing_queue,
                subtasks,
            } = remote;

            if !st.queue.update_queue(processing_queue) {
                return false;
            }

            st.response_timer.cancel();
            st.subtasks = subtasks;
            let indices = st.unprocessed_indices();
            st.queue.set_valid_item_indices(indices);

            let has_ownership = st.queue.has_ownership();
            match (had_ownership, has_ownership) {
                (false, true) => st.ownership_acquired(),
                (true, false) => st.ownership_released(),
                _ => {}
            }

            let mut deferred = Deferred {
                ownership_gained: !had_ownership && has_ownership,
                ..Deferred::default()
            };
            if has_ownership {
                deferred.exhausted = self.process_pending_subtask_grabbing(&mut st);
            } else if !st.pending_grabs.is_empty() {
                self.request_ownership(&mut st);
            }

            if !was_initialized {
                deferred.assigned = Some(st.subtask_ids());
            }

            deferred
        };

        self.run_deferred(deferred);
        true
    }

    /// Answers an inbound ownership request.
    pub fn process_queue_request_message(&self, request: SubTaskQueueRequest) -> bool {
        let mut st = self.lock_state();

        if request.node_id == self.local_node_id && st.queue.has_ownership() {
            return true;
        }

        if self.transfer_ownership(&mut st, &request.node_id) {
            return true;
        }

        tracing::debug!("QUEUE_REQUEST_RECEIVED from {}", request.node_id);
        self.arm_timer(&mut st, TimerKind::Response, self.queue_response_timeout);
        false
    }

    /// Marks subtasks processed (or unprocessed) and recomputes the grabbable items.
    pub fn change_subtask_processing_states<I, S>(&self, subtask_ids: I, is_processed: bool)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let exhausted = {
            let mut st = self.lock_state();

            for subtask_id in subtask_ids {
                let subtask_id = subtask_id.into();
                if is_processed {
                    tracing::debug!("Subtask flagged as processed {}", subtask_id);
                    st.processed_ids.insert(subtask_id);
                } else {
                    tracing::debug!("Subtask flagged as UNPROCESSED {}", subtask_id);
                    st.processed_ids.remove(&subtask_id);
                }
            }

            let indices = st.unprocessed_indices();
            st.queue.set_valid_item_indices(indices);

            if st.is_processed() && !st.pending_grabs.is_empty() {
                self.resolve_exhausted_grabs(&mut st)
            } else {
                false
            }
        };

        self.run_deferred(Deferred {
            exhausted,
            ..Deferred::default()
        });
    }

    pub fn is_processed(&self) -> bool {
        let st = self.lock_state();
        let processed = st.is_processed();
        tracing::trace!(
            "IS_PROCESSED: {} of {}",
            st.processed_ids.len(),
            st.subtasks.len()
        );
        processed
    }

    pub fn processed_subtask_ids(&self) -> HashSet<String> {
        self.lock_state().processed_ids.clone()
    }

    /// Sets the assignment sink; fires it immediately if the queue already exists.
    pub fn set_assignment_event_sink(&self, sink: AssignmentEventSink) {
        *self
            .assignment_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink.clone());

        let ids = {
            let st = self.lock_state();
            st.queue.is_initialized().then(|| st.subtask_ids())
        };

        if let Some(ids) = ids {
            sink(ids);
        }
    }

    pub fn set_processing_error_sink(&self, sink: ProcessingErrorSink) {
        *self
            .error_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn set_ownership_event_sink(&self, sink: OwnershipEventSink) {
        *self
            .ownership_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn set_processing_timeout(&self, timeout: Duration) {
        self.lock_state().processing_timeout = timeout;
    }

    /// Total time the local node has held ownership of this queue.
    pub fn ownership_duration(&self) -> Duration {
        let st = self.lock_state();
        let current = st
            .owned_since_ns
            .map(|since| st.queue.now_ns().saturating_sub(since))
            .unwrap_or(0);
        Duration::from_nanos(st.owned_total_ns + current)
    }

    pub fn active_nodes_count(&self) -> usize {
        self.channel.active_nodes_count()
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_queue(&self, st: &ManagerState) {
        if let Some(snapshot) = st.snapshot() {
            self.channel.publish_queue(&snapshot);
            tracing::debug!("QUEUE_PUBLISHED");
        }
    }

    fn transfer_ownership(&self, st: &mut ManagerState, node_id: &NodeId) -> bool {
        if !st.queue.move_ownership_to(node_id.clone()) {
            return false;
        }

        if *node_id != self.local_node_id {
            st.ownership_released();
        }
        tracing::debug!("Queue ownership moved to {}", node_id);
        self.publish_queue(st);
        true
    }

    fn request_ownership(&self, st: &mut ManagerState) {
        self.channel.request_queue_ownership(&self.local_node_id);
        self.arm_timer(st, TimerKind::Response, self.queue_response_timeout);
    }

    /// Returns `true` when pending grabs were resolved because everything is processed.
    fn grab_subtasks(&self, st: &mut ManagerState) -> bool {
        if st.is_processed() {
            return self.resolve_exhausted_grabs(st);
        }

        if st.queue.has_ownership() {
            self.process_pending_subtask_grabbing(st)
        } else {
            self.request_ownership(st);
            false
        }
    }

    fn process_pending_subtask_grabbing(&self, st: &mut ManagerState) -> bool {
        st.grab_timer.cancel();

        while let Some(front) = st.pending_grabs.front() {
            if front.is_closed() {
                st.pending_grabs.pop_front();
                continue;
            }

            if let Some(idx) = st.queue.grab_item() {
                self.publish_queue(st);

                let subtask = st.subtasks.get(idx).cloned();
                if let Some(callback) = st.pending_grabs.pop_front() {
                    if callback.send(subtask).is_err() {
                        tracing::debug!("Grab receiver dropped after locking item {}", idx);
                    }
                }
            } else if !st.queue.unlock_expired_items(st.processing_timeout) {
                break;
            }
        }

        if st.pending_grabs.is_empty() {
            return false;
        }

        if st.is_processed() {
            return self.resolve_exhausted_grabs(st);
        }

        let now = st.queue.now_ns();
        let delay = st
            .queue
            .earliest_lock_timestamp()
            .map(|locked_at| {
                let expires_at = locked_at.saturating_add(st.processing_timeout.as_nanos() as u64);
                Duration::from_nanos(expires_at.saturating_sub(now))
            })
            .unwrap_or(st.processing_timeout)
            .max(MIN_GRAB_DELAY);

        tracing::debug!("GRAB_TIMEOUT {}ms", delay.as_millis());
        self.arm_timer(st, TimerKind::Grab, delay);
        false
    }

    fn resolve_exhausted_grabs(&self, st: &mut ManagerState) -> bool {
        st.grab_timer.cancel();

        let mut notified = false;
        while let Some(callback) = st.pending_grabs.pop_front() {
            notified |= callback.send(None).is_ok();
        }
        notified
    }

    fn arm_timer(&self, st: &mut ManagerState, kind: TimerKind, delay: Duration) {
        let slot = st.timer_mut(kind);
        slot.cancel();
        let generation = slot.generation;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime, {:?} timer not armed", kind);
            return;
        };

        let weak = self.weak_self.clone();
        slot.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.on_timer(kind, generation);
            }
        }));
    }

    fn on_timer(&self, kind: TimerKind, generation: u64) {
        let deferred = {
            let mut st = self.lock_state();
            if !st.timer_mut(kind).fire(generation) {
                return;
            }

            let had_ownership = st.queue.has_ownership();
            let exhausted = match kind {
                TimerKind::Grab => self.handle_grab_timeout(&mut st),
                TimerKind::Response => self.handle_queue_request_timeout(&mut st),
            };

            Deferred {
                assigned: None,
                exhausted,
                ownership_gained: !had_ownership && st.queue.has_ownership(),
            }
        };

        self.run_deferred(deferred);
    }

    fn handle_grab_timeout(&self, st: &mut ManagerState) -> bool {
        tracing::debug!("HANDLE_GRAB_TIMEOUT");
        if st.pending_grabs.is_empty() {
            return false;
        }
        self.grab_subtasks(st)
    }

    fn handle_queue_request_timeout(&self, st: &mut ManagerState) -> bool {
        tracing::debug!("QUEUE_REQUEST_TIMEOUT");

        if st.queue.rollback_ownership() {
            st.ownership_acquired();
            tracing::info!("Queue ownership rolled back to {}", self.local_node_id);
            self.publish_queue(st);
            return self.process_pending_subtask_grabbing(st);
        }

        if !st.pending_grabs.is_empty() {
            self.request_ownership(st);
        }
        false
    }

    fn run_deferred(&self, deferred: Deferred) {
        if let Some(ids) = deferred.assigned {
            let sink = self
                .assignment_sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(sink) = sink {
                sink(ids);
            }
        }

        if deferred.exhausted {
            tracing::info!("All subtasks processed, no more subtasks to grab");
            let sink = self
                .error_sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(sink) = sink {
                sink("no more subtasks");
            }
        }

        if deferred.ownership_gained {
            let sink = self
                .ownership_sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(sink) = sink {
                sink();
            }
        }
    }
}

impl Drop for SubTaskQueueManager {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        st.grab_timer.cancel();
        st.response_timer.cancel();
    }
}

/// Rejects splits the queue cannot index: no subtasks, or a subtask id used twice.
pub fn check_split(subtasks: &[SubTask]) -> Result<(), ProcessingError> {
    if subtasks.is_empty() {
        return Err(ProcessingError::EmptySplit);
    }

    let mut ids = HashSet::new();
    for subtask in subtasks {
        if !ids.insert(subtask.subtask_id.as_str()) {
            return Err(ProcessingError::DuplicateSubTaskId(subtask.subtask_id.clone()));
        }
    }

    Ok(())
}

#[cfg(test)]
impl SubTaskQueueManager {
    pub(crate) fn is_grab_timer_armed(&self) -> bool {
        self.lock_state().grab_timer.is_armed()
    }

    pub(crate) fn is_response_timer_armed(&self) -> bool {
        self.lock_state().response_timer.is_armed()
    }
}
