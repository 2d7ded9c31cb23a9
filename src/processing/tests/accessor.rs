use super::support::{
    eventually, honest_result, node, result_with_hashes, shared_split, test_config,
    RecordingChannel,
};
use crate::processing::accessor::SubTaskQueueAccessor;
use crate::processing::manager::SubTaskQueueManager;
use crate::processing::storage::{
    InMemorySubTaskResultStorage, InMemorySubTaskStateStorage, SubTaskResultStorage,
    SubTaskStateStorage,
};
use crate::processing::types::{
    self, FinalizationStatus, ProcessingQueue, QueueItem, SubTaskQueue, SubTaskResult,
    SubTaskState, TaskId, TaskResult,
};
use crate::pubsub::local::LocalBus;
use crate::pubsub::{PubSub, Subscription};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Fixture {
    bus: Arc<LocalBus>,
    manager: Arc<SubTaskQueueManager>,
    accessor: Arc<SubTaskQueueAccessor>,
    state_storage: Arc<InMemorySubTaskStateStorage>,
    result_storage: Arc<InMemorySubTaskResultStorage>,
    finalized: Arc<Mutex<Vec<TaskResult>>>,
}

impl Fixture {
    fn new(local: &str) -> Self {
        let bus = LocalBus::new();
        let channel = RecordingChannel::new();
        let manager = SubTaskQueueManager::new(channel, node(local), &test_config());
        let state_storage = Arc::new(InMemorySubTaskStateStorage::new());
        let result_storage = Arc::new(InMemorySubTaskResultStorage::new());
        let finalized = Arc::new(Mutex::new(Vec::new()));

        let sink_finalized = finalized.clone();
        let accessor = SubTaskQueueAccessor::new(
            TaskId::from("T1"),
            bus.endpoint(node(local)),
            manager.clone(),
            state_storage.clone(),
            result_storage.clone(),
            Arc::new(move |result: TaskResult| sink_finalized.lock().unwrap().push(result)),
        );

        Self {
            bus,
            manager,
            accessor,
            state_storage,
            result_storage,
            finalized,
        }
    }

    /// Subscribes an observer peer to the task's result channel.
    fn observe_results(&self) -> Subscription {
        self.bus
            .endpoint(node("OBSERVER"))
            .subscribe(&types::result_channel_topic(&TaskId::from("T1")))
    }

    fn finalized_count(&self) -> usize {
        self.finalized.lock().unwrap().len()
    }
}

fn drain(subscription: &mut Subscription) -> Vec<SubTaskResult> {
    let mut received = Vec::new();
    while let Ok(bytes) = subscription.try_recv() {
        received.push(types::decode(&bytes).unwrap());
    }
    received
}

fn remote_snapshot(owner: &str, ids: &[&str]) -> SubTaskQueue {
    SubTaskQueue {
        processing_queue: ProcessingQueue {
            owner_node_id: Some(node(owner)),
            last_update_timestamp: 1,
            items: vec![QueueItem::default(); ids.len()],
            finalized: false,
        },
        subtasks: shared_split(ids),
    }
}

// ============================================================
// FINALIZATION
// ============================================================

#[tokio::test]
async fn test_owner_finalizes_once_all_results_arrive() {
    // ARRANGE
    let fx = Fixture::new("A");
    let subtasks = shared_split(&["S2", "S1"]);
    fx.accessor.assign_subtasks(subtasks.clone()).unwrap();

    // ACT
    let first = fx.accessor.on_result_received(honest_result(&subtasks[0]));
    let second = fx.accessor.on_result_received(honest_result(&subtasks[1]));

    // ASSERT
    assert_eq!(first, FinalizationStatus::NotFinalized);
    assert_eq!(second, FinalizationStatus::Finalized);
    assert!(fx.accessor.is_task_complete());
    assert!(fx.manager.is_queue_finalized(), "Owner marks the queue finalized");

    let finalized = fx.finalized.lock().unwrap().clone();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].task_id, TaskId::from("T1"));
    let ids: Vec<_> = finalized[0].subtask_results.iter().map(|r| r.subtask_id.as_str()).collect();
    assert_eq!(ids, vec!["S1", "S2"], "Results are ordered by subtask id");
}

#[tokio::test]
async fn test_late_results_do_not_finalize_again() {
    let fx = Fixture::new("A");
    let subtasks = shared_split(&["S1", "S2"]);
    fx.accessor.assign_subtasks(subtasks.clone()).unwrap();
    fx.accessor.on_result_received(honest_result(&subtasks[0]));
    fx.accessor.on_result_received(honest_result(&subtasks[1]));

    let status = fx.accessor.on_result_received(honest_result(&subtasks[0]));
    let mut rx = fx.accessor.grab_subtask();

    assert_eq!(status, FinalizationStatus::Finalized);
    assert_eq!(rx.try_recv().unwrap(), None);
    assert_eq!(fx.finalized_count(), 1);
}

#[tokio::test]
async fn test_assign_marks_subtasks_enqueued() {
    let fx = Fixture::new("A");

    fx.accessor.assign_subtasks(shared_split(&["S1", "S2"])).unwrap();

    assert_eq!(fx.state_storage.subtask_state("S1"), Some(SubTaskState::Enqueued));
    assert_eq!(fx.state_storage.subtask_state("S2"), Some(SubTaskState::Enqueued));
    assert!(fx.manager.has_ownership());
}

// ============================================================
// STORAGE RELOAD
// ============================================================

#[tokio::test]
async fn test_grab_finalizes_from_stored_results() {
    // ARRANGE: a previous run already persisted every result
    let fx = Fixture::new("A");
    let subtasks = shared_split(&["S1", "S2"]);
    for subtask in &subtasks {
        fx.result_storage.add_subtask_result(&honest_result(subtask));
    }
    fx.accessor.assign_subtasks(subtasks).unwrap();

    // ACT
    let mut rx = fx.accessor.grab_subtask();

    // ASSERT
    assert_eq!(rx.try_recv().unwrap(), None);
    assert_eq!(fx.accessor.finalization_status(), FinalizationStatus::Finalized);
    assert_eq!(fx.finalized_count(), 1);
}

#[tokio::test]
async fn test_grab_skips_subtasks_with_stored_results() {
    let fx = Fixture::new("A");
    let subtasks = shared_split(&["S1", "S2"]);
    fx.result_storage.add_subtask_result(&honest_result(&subtasks[0]));
    fx.accessor.assign_subtasks(subtasks).unwrap();

    let mut rx = fx.accessor.grab_subtask();

    assert_eq!(rx.try_recv().unwrap().map(|s| s.subtask_id).as_deref(), Some("S2"));
    assert_eq!(fx.accessor.results().len(), 1);
}

#[tokio::test]
async fn test_stored_results_of_other_tasks_are_ignored() {
    let fx = Fixture::new("A");
    fx.result_storage.add_subtask_result(&result_with_hashes("OTHER", &["x"]));
    fx.accessor.assign_subtasks(shared_split(&["S1", "S2"])).unwrap();

    let mut rx = fx.accessor.grab_subtask();

    assert_eq!(rx.try_recv().unwrap().map(|s| s.subtask_id).as_deref(), Some("S1"));
    assert!(fx.accessor.results().is_empty());
}

// ============================================================
// INVALID RESULTS
// ============================================================

#[tokio::test]
async fn test_invalid_results_are_evicted_and_requeued() {
    // ARRANGE: S2 reports a forged hash for the shared chunk
    let fx = Fixture::new("A");
    let subtasks = shared_split(&["S1", "S2"]);
    fx.accessor.assign_subtasks(subtasks.clone()).unwrap();
    let forged = result_with_hashes("S2", &["forged"]);
    fx.result_storage.add_subtask_result(&forged);

    // ACT
    fx.accessor.on_result_received(honest_result(&subtasks[0]));
    let status = fx.accessor.on_result_received(forged);

    // ASSERT
    assert_eq!(status, FinalizationStatus::NotFinalized);
    assert!(fx.accessor.results().is_empty());
    assert!(fx.result_storage.is_empty());
    assert_eq!(fx.state_storage.subtask_state("S2"), Some(SubTaskState::Enqueued));
    assert!(fx.manager.processed_subtask_ids().is_empty());
    assert_eq!(fx.finalized_count(), 0);

    let mut rx = fx.accessor.grab_subtask();
    assert_eq!(rx.try_recv().unwrap().map(|s| s.subtask_id).as_deref(), Some("S1"));
}

#[tokio::test]
async fn test_recomputed_results_finalize_after_eviction() {
    let fx = Fixture::new("A");
    let subtasks = shared_split(&["S1", "S2"]);
    fx.accessor.assign_subtasks(subtasks.clone()).unwrap();
    fx.accessor.on_result_received(honest_result(&subtasks[0]));
    fx.accessor.on_result_received(result_with_hashes("S2", &["forged"]));

    fx.accessor.on_result_received(honest_result(&subtasks[0]));
    let status = fx.accessor.on_result_received(honest_result(&subtasks[1]));

    assert_eq!(status, FinalizationStatus::Finalized);
    assert_eq!(fx.finalized_count(), 1);
}

// ============================================================
// NON-OWNER PEERS
// ============================================================

#[tokio::test]
async fn test_non_owner_rebroadcasts_completing_result_once() {
    // ARRANGE: B follows a queue owned by A
    let fx = Fixture::new("B");
    fx.manager.process_queue_message(remote_snapshot("A", &["S1", "S2"]));
    let mut observed = fx.observe_results();
    let subtasks = shared_split(&["S1", "S2"]);

    // ACT
    fx.accessor.on_result_received(honest_result(&subtasks[0]));
    fx.accessor.on_result_received(honest_result(&subtasks[0]));
    let status = fx.accessor.on_result_received(honest_result(&subtasks[1]));
    let duplicate = fx.accessor.on_result_received(honest_result(&subtasks[1]));

    // ASSERT
    assert_eq!(status, FinalizationStatus::FinalizedButNotOwner);
    assert_eq!(duplicate, FinalizationStatus::FinalizedButNotOwner);
    assert_eq!(fx.finalized_count(), 0, "Only the owner emits the task result");

    let rebroadcast = drain(&mut observed);
    assert_eq!(rebroadcast.len(), 1);
    assert_eq!(rebroadcast[0].subtask_id, "S2");
}

#[tokio::test]
async fn test_non_owner_finalizes_after_gaining_ownership() {
    // ARRANGE: B validates everything while A still owns the queue
    let fx = Fixture::new("B");
    fx.accessor.connect_to_subtask_queue(Arc::new(|| {}));
    fx.manager.process_queue_message(remote_snapshot("A", &["S1", "S2"]));
    let subtasks = shared_split(&["S1", "S2"]);
    fx.accessor.on_result_received(honest_result(&subtasks[0]));
    let validated = fx.accessor.on_result_received(honest_result(&subtasks[1]));

    let mut handover = remote_snapshot("B", &["S1", "S2"]);
    handover.processing_queue.last_update_timestamp = 2;

    // ACT
    fx.manager.process_queue_message(handover);

    // ASSERT
    assert_eq!(validated, FinalizationStatus::FinalizedButNotOwner);
    assert_eq!(fx.accessor.finalization_status(), FinalizationStatus::Finalized);
    assert_eq!(fx.finalized_count(), 1);
    assert!(fx.manager.is_queue_finalized());
}

#[tokio::test]
async fn test_gaining_finalized_queue_does_not_finalize_again() {
    // ARRANGE
    let fx = Fixture::new("B");
    fx.accessor.connect_to_subtask_queue(Arc::new(|| {}));
    fx.manager.process_queue_message(remote_snapshot("A", &["S1", "S2"]));
    let subtasks = shared_split(&["S1", "S2"]);
    fx.accessor.on_result_received(honest_result(&subtasks[0]));
    fx.accessor.on_result_received(honest_result(&subtasks[1]));

    let mut handover = remote_snapshot("B", &["S1", "S2"]);
    handover.processing_queue.last_update_timestamp = 2;
    handover.processing_queue.finalized = true;

    // ACT
    fx.manager.process_queue_message(handover);
    let status = fx.accessor.on_ownership_gained();

    // ASSERT
    assert!(fx.manager.has_ownership());
    assert_eq!(status, FinalizationStatus::FinalizedButNotOwner);
    assert_eq!(fx.finalized_count(), 0, "A previous owner already emitted the task result");
}

// ============================================================
// RESULT CHANNEL
// ============================================================

#[tokio::test]
async fn test_complete_subtask_persists_and_publishes() {
    // ARRANGE
    let fx = Fixture::new("A");
    let subtasks = shared_split(&["S1", "S2"]);
    fx.accessor.assign_subtasks(subtasks.clone()).unwrap();
    let mut observed = fx.observe_results();

    // ACT
    fx.accessor.complete_subtask("S1", honest_result(&subtasks[0]));

    // ASSERT
    assert_eq!(fx.result_storage.len(), 1);
    assert_eq!(fx.state_storage.subtask_state("S1"), Some(SubTaskState::Processed));
    assert_eq!(drain(&mut observed), vec![honest_result(&subtasks[0])]);
}

#[tokio::test]
async fn test_connect_reports_queue_and_receives_results() {
    // ARRANGE
    let fx = Fixture::new("A");
    let connected = Arc::new(AtomicUsize::new(0));
    let on_connected = connected.clone();
    fx.accessor.connect_to_subtask_queue(Arc::new(move || {
        on_connected.fetch_add(1, Ordering::SeqCst);
    }));
    let subtasks = shared_split(&["S1", "S2"]);

    // ACT
    fx.accessor.assign_subtasks(subtasks.clone()).unwrap();
    let peer = fx.bus.endpoint(node("B"));
    for subtask in &subtasks {
        let bytes = types::encode(&honest_result(subtask)).unwrap();
        peer.publish(&types::result_channel_topic(&TaskId::from("T1")), bytes)
            .unwrap();
    }

    // ASSERT
    assert!(eventually(|| connected.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| fx.finalized_count() == 1).await);
    assert_eq!(fx.accessor.results().len(), 2);
}
