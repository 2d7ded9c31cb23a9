use crate::pubsub::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::ProcessingError;

/// Identifier of a distributed task.
///
/// Names the task's broadcast topics (queue channel and result channel).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifies one piece of input data consumed by a subtask.
///
/// Compared structurally: two subtasks referencing equal descriptors process the same data,
/// which is what lets the validation step cross-check their hashes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkDescriptor {
    pub chunk_id: String,
    pub n_subchunks: u32,
    pub offset: u64,
    pub stride: u64,
}

impl ChunkDescriptor {
    pub fn new(chunk_id: impl Into<String>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            n_subchunks: 1,
            offset: 0,
            stride: 0,
        }
    }
}

/// Indivisible unit of work. Immutable once placed in a queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubTask {
    pub subtask_id: String,
    pub chunks_to_process: Vec<ChunkDescriptor>,
    /// Caller-defined work description, opaque to the queue protocol.
    pub payload: String,
}

impl SubTask {
    pub fn new(subtask_id: impl Into<String>, chunks_to_process: Vec<ChunkDescriptor>) -> Self {
        Self {
            subtask_id: subtask_id.into(),
            chunks_to_process,
            payload: String::new(),
        }
    }
}

/// Lock slot of one subtask, matched to it by position.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub lock_node_id: Option<NodeId>,
    /// Nanoseconds on the writer's clock when the lock was taken.
    pub lock_timestamp: u64,
}

impl QueueItem {
    pub fn is_locked(&self) -> bool {
        self.lock_node_id.is_some()
    }
}

/// Replicated lock table with its owner and last-writer-wins timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessingQueue {
    pub owner_node_id: Option<NodeId>,
    pub last_update_timestamp: u64,
    pub items: Vec<QueueItem>,
    /// Set by the owner that emitted the task result. Never cleared.
    pub finalized: bool,
}

/// Full queue snapshot as exchanged between peers.
///
/// `processing_queue.items.len() == subtasks.len()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubTaskQueue {
    pub processing_queue: ProcessingQueue,
    pub subtasks: Vec<SubTask>,
}

impl SubTaskQueue {
    pub fn subtask_ids(&self) -> Vec<String> {
        self.subtasks.iter().map(|s| s.subtask_id.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubTaskQueueRequest {
    pub node_id: NodeId,
}

/// Outcome of one subtask execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubTaskResult {
    pub subtask_id: String,
    pub result_hash: Vec<u8>,
    /// One hash per chunk descriptor, in subtask order.
    pub chunk_hashes: Vec<Vec<u8>>,
    /// Peer that produced the result.
    pub node_id: Option<NodeId>,
}

/// Assembled result of a finalized task, ordered by subtask id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub subtask_results: Vec<SubTaskResult>,
}

/// Messages on a task's queue channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProcessingChannelMessage {
    QueueRequest(SubTaskQueueRequest),
    Queue(SubTaskQueue),
}

/// Durable per-subtask progress marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubTaskState {
    Enqueued,
    Processing,
    Processed,
}

/// Who holds write authority over a queue, seen from the local peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Unowned,
    OwnedLocal,
    OwnedRemote(NodeId),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FinalizationStatus {
    NotFinalized,
    Finalized,
    FinalizedButNotOwner,
}

/// Topic of the queue channel of `task_id`.
pub fn queue_channel_topic(task_id: &TaskId) -> String {
    format!("QUEUE_CHANNEL_ID_{}", task_id)
}

/// Topic of the result channel of `task_id`.
pub fn result_channel_topic(task_id: &TaskId) -> String {
    format!("RESULT_CHANNEL_ID_{}", task_id)
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProcessingError> {
    bincode::serialize(value).map_err(ProcessingError::Encode)
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProcessingError> {
    bincode::deserialize(bytes).map_err(ProcessingError::Decode)
}
