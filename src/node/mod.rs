//! Node Runtime
//!
//! Hosts every task a peer takes part in and exposes them over HTTP.
//!
//! ## Task lifecycle
//! 1. **Submit**: the receiving peer builds the task runtime, creates the queue (becoming its
//!    owner) and announces the task with the initial snapshot on `TASK_ANNOUNCE_CHANNEL`.
//! 2. **Join**: peers hearing the announcement build their own runtime and seed their queue
//!    from the snapshot. Each runtime starts its engine once the queue is connected.
//! 3. **Complete**: the owner's finalization records the task result; every peer stops its
//!    engine when the task completes.

pub mod handlers;
pub mod protocol;


use crate::config::ProcessingConfig;
use crate::processing::accessor::SubTaskQueueAccessor;
use crate::processing::channel::SubTaskQueueChannelPubSub;
use crate::processing::engine::{ProcessingCore, ProcessingEngine};
use crate::processing::error::ProcessingError;
use crate::processing::manager::{self, ProcessingErrorSink, SubTaskQueueManager};
use crate::processing::storage::{InMemorySubTaskResultStorage, InMemorySubTaskStateStorage};
use crate::processing::types::{self, SubTask, SubTaskQueue, TaskId, TaskResult};
use crate::pubsub::PubSub;
use crate::pubsub::types::NodeId;

use anyhow::Result;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;

use protocol::{SubTaskResultView, TaskAnnouncement, TaskResultResponse, TaskStatusResponse};

/// Everything one peer runs for one task.
struct TaskRuntime {
    manager: Arc<SubTaskQueueManager>,
    accessor: Arc<SubTaskQueueAccessor>,
    engine: Arc<ProcessingEngine>,
    last_processing_error: Arc<Mutex<Option<String>>>,
}

pub struct ProcessingNode {
    node_id: NodeId,
    pubsub: Arc<dyn PubSub>,
    core: Arc<dyn ProcessingCore>,
    config: ProcessingConfig,
    tasks: DashMap<TaskId, Arc<TaskRuntime>>,
    finalized: DashMap<TaskId, TaskResult>,
    announce_listener: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<Self>,
}

impl ProcessingNode {
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        core: Arc<dyn ProcessingCore>,
        config: ProcessingConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            node_id: pubsub.local_node_id(),
            pubsub,
            core,
            config,
            tasks: DashMap::new(),
            finalized: DashMap::new(),
            announce_listener: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Starts listening for task announcements from other peers.
    pub fn start(&self) {
        let mut subscription = self.pubsub.subscribe(protocol::TASK_ANNOUNCE_TOPIC);
        let weak = self.weak_self.clone();

        let handle = tokio::spawn(async move {
            while let Some(bytes) = subscription.recv().await {
                let Some(node) = weak.upgrade() else {
                    break;
                };

                match types::decode::<TaskAnnouncement>(&bytes) {
                    Ok(announcement) => node.on_task_announced(announcement).await,
                    Err(e) => tracing::warn!("Dropping undecodable task announcement: {}", e),
                }
            }
        });

        let previous = self
            .announce_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        tracing::info!("Node {} listening for task announcements", self.node_id);
    }

    /// Creates the queue of a new task locally and announces it to the peer group.
    pub async fn submit_task(&self, task_id: Option<TaskId>, subtasks: Vec<SubTask>) -> Result<TaskId> {
        manager::check_split(&subtasks)?;

        let task_id = task_id.unwrap_or_default();
        if self.tasks.contains_key(&task_id) {
            anyhow::bail!("task {} already exists", task_id);
        }

        let runtime = self.join_task(&task_id).await;
        runtime.accessor.assign_subtasks(subtasks)?;

        let queue = runtime
            .manager
            .queue_snapshot()
            .ok_or(ProcessingError::QueueNotInitialized)?;

        let announcement = TaskAnnouncement {
            task_id: task_id.clone(),
            origin: self.node_id.clone(),
            queue,
        };
        self.pubsub
            .publish(protocol::TASK_ANNOUNCE_TOPIC, types::encode(&announcement)?)?;

        tracing::info!(
            "Task {} submitted with {} subtasks",
            task_id,
            announcement.queue.subtasks.len()
        );
        Ok(task_id)
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn task_status(&self, task_id: &TaskId) -> Option<TaskStatusResponse> {
        let runtime = self.tasks.get(task_id)?.value().clone();
        let snapshot = runtime.manager.queue_snapshot();

        let (owner, total, locked) = match &snapshot {
            Some(queue) => (
                queue.processing_queue.owner_node_id.clone(),
                queue.subtasks.len(),
                queue
                    .processing_queue
                    .items
                    .iter()
                    .filter(|item| item.is_locked())
                    .count(),
            ),
            None => (None, 0, 0),
        };

        Some(TaskStatusResponse {
            task_id: task_id.clone(),
            owned_locally: owner.as_ref() == Some(&self.node_id),
            owner,
            total_subtasks: total,
            locked_subtasks: locked,
            processed_subtasks: runtime.manager.processed_subtask_ids().len(),
            finalization: runtime.accessor.finalization_status(),
            processing: runtime.engine.is_queue_processing_started(),
            last_processing_error: runtime
                .last_processing_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        })
    }

    /// Validated results of a completed task.
    ///
    /// Peers that completed without owning the queue report the results they validated.
    pub fn task_result(&self, task_id: &TaskId) -> Option<TaskResultResponse> {
        if let Some(result) = self.finalized.get(task_id) {
            return Some(TaskResultResponse {
                task_id: task_id.clone(),
                finalized_locally: true,
                results: result.subtask_results.iter().map(SubTaskResultView::from).collect(),
            });
        }

        let runtime = self.tasks.get(task_id)?.value().clone();
        if !runtime.accessor.is_task_complete() {
            return None;
        }

        Some(TaskResultResponse {
            task_id: task_id.clone(),
            finalized_locally: false,
            results: runtime
                .accessor
                .results()
                .iter()
                .map(SubTaskResultView::from)
                .collect(),
        })
    }

    pub fn cluster_nodes(&self) -> Vec<NodeId> {
        self.pubsub.active_nodes()
    }

    async fn on_task_announced(&self, announcement: TaskAnnouncement) {
        if announcement.origin == self.node_id {
            return;
        }

        tracing::info!(
            "Joining task {} announced by {}",
            announcement.task_id,
            announcement.origin
        );
        let runtime = self.join_task(&announcement.task_id).await;
        seed_queue(&runtime.manager, announcement.queue);
    }

    /// Returns the runtime of `task_id`, building and connecting it on first use.
    async fn join_task(&self, task_id: &TaskId) -> Arc<TaskRuntime> {
        if let Some(runtime) = self.tasks.get(task_id).map(|entry| entry.value().clone()) {
            return runtime;
        }

        let channel =
            SubTaskQueueChannelPubSub::new(self.pubsub.clone(), types::queue_channel_topic(task_id));
        let manager = SubTaskQueueManager::new(channel.clone(), self.node_id.clone(), &self.config);
        let last_processing_error = Arc::new(Mutex::new(None));
        manager.set_processing_error_sink(record_processing_error(
            task_id,
            last_processing_error.clone(),
        ));
        channel.bind_manager(&manager);
        channel.listen(self.config.subscription_wait).await;

        let weak = self.weak_self.clone();
        let accessor = SubTaskQueueAccessor::new(
            task_id.clone(),
            self.pubsub.clone(),
            manager.clone(),
            Arc::new(InMemorySubTaskStateStorage::new()),
            Arc::new(InMemorySubTaskResultStorage::new()),
            Arc::new(move |task_result: TaskResult| {
                if let Some(node) = weak.upgrade() {
                    node.on_task_finalized(task_result);
                }
            }),
        );

        let engine = ProcessingEngine::new(
            self.node_id.clone(),
            self.core.clone(),
            self.config.worker_count,
        );
        engine.set_processing_error_sink(record_processing_error(
            task_id,
            last_processing_error.clone(),
        ));

        let runtime = Arc::new(TaskRuntime {
            manager,
            accessor: accessor.clone(),
            engine: engine.clone(),
            last_processing_error,
        });

        let entry = self.tasks.entry(task_id.clone()).or_insert(runtime).value().clone();
        if !Arc::ptr_eq(&entry.accessor, &accessor) {
            return entry;
        }

        let weak_accessor = Arc::downgrade(&accessor);
        accessor.connect_to_subtask_queue(Arc::new(move || {
            if let Some(accessor) = weak_accessor.upgrade() {
                engine.start_queue_processing(accessor);
            }
        }));

        entry
    }

    fn on_task_finalized(&self, task_result: TaskResult) {
        let task_id = task_result.task_id.clone();
        tracing::info!(
            "Task {} completed with {} subtask results",
            task_id,
            task_result.subtask_results.len()
        );
        self.finalized.insert(task_id.clone(), task_result);

        if let Some(runtime) = self.tasks.get(&task_id) {
            runtime.engine.stop_queue_processing();
        }
    }
}

impl Drop for ProcessingNode {
    fn drop(&mut self) {
        let listener = self
            .announce_listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
    }
}

/// Logs processing errors of `task_id` and keeps the latest one for status queries.
fn record_processing_error(
    task_id: &TaskId,
    last_error: Arc<Mutex<Option<String>>>,
) -> ProcessingErrorSink {
    let task_id = task_id.clone();
    Arc::new(move |message: &str| {
        tracing::warn!("Task {}: {}", task_id, message);
        *last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
    })
}

fn seed_queue(manager: &SubTaskQueueManager, queue: SubTaskQueue) {
    if !manager.process_queue_message(queue) {
        tracing::debug!("Announced snapshot is not newer than the local queue");
    }
}
