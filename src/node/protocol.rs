//! Network Protocol Definitions
//!
//! HTTP DTOs of the node surface and the task announcement broadcast between peers.

use crate::processing::types::{FinalizationStatus, SubTask, SubTaskQueue, SubTaskResult, TaskId};
use crate::pubsub::types::NodeId;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_SUBMIT_TASK: &str = "/task/submit";
pub const ENDPOINT_TASK_STATUS: &str = "/task/status/:id";
pub const ENDPOINT_TASK_RESULT: &str = "/task/result/:id";
pub const ENDPOINT_CLUSTER_NODES: &str = "/cluster/nodes";

/// Topic on which new tasks are announced to every peer.
pub const TASK_ANNOUNCE_TOPIC: &str = "TASK_ANNOUNCE_CHANNEL";

/// Sent by the submitting peer once the task's queue exists.
///
/// Carries the initial snapshot, since peers subscribe the queue channel only after
/// hearing about the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAnnouncement {
    pub task_id: TaskId,
    pub origin: NodeId,
    pub queue: SubTaskQueue,
}

/// A task already split into subtasks; splitting itself happens outside the node.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub subtasks: Vec<SubTask>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: Option<TaskId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub owner: Option<NodeId>,
    pub owned_locally: bool,
    pub total_subtasks: usize,
    pub locked_subtasks: usize,
    pub processed_subtasks: usize,
    pub finalization: FinalizationStatus,
    pub processing: bool,
    /// Latest processing error reported for the task, such as a failed subtask or an
    /// exhausted queue.
    pub last_processing_error: Option<String>,
}

/// One subtask result with hex-encoded hashes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubTaskResultView {
    pub subtask_id: String,
    pub node_id: Option<NodeId>,
    pub result_hash: String,
    pub chunk_hashes: Vec<String>,
}

impl From<&SubTaskResult> for SubTaskResultView {
    fn from(result: &SubTaskResult) -> Self {
        Self {
            subtask_id: result.subtask_id.clone(),
            node_id: result.node_id.clone(),
            result_hash: hex::encode(&result.result_hash),
            chunk_hashes: result.chunk_hashes.iter().map(hex::encode).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResultResponse {
    pub task_id: TaskId,
    /// `true` when this peer emitted the task result as queue owner.
    pub finalized_locally: bool,
    pub results: Vec<SubTaskResultView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterNodesResponse {
    pub local: NodeId,
    pub nodes: Vec<NodeId>,
}
