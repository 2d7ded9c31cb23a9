//! Shared fixtures: a recording queue channel, split builders and wait helpers.

use crate::config::ProcessingConfig;
use crate::processing::channel::SubTaskQueueChannel;
use crate::processing::types::{ChunkDescriptor, SubTask, SubTaskQueue, SubTaskResult};
use crate::pubsub::types::NodeId;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

/// Channel double that records everything the manager sends.
#[derive(Default)]
pub struct RecordingChannel {
    requests: Mutex<Vec<NodeId>>,
    snapshots: Mutex<Vec<SubTaskQueue>>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<NodeId> {
        self.requests.lock().unwrap().clone()
    }

    pub fn snapshots(&self) -> Vec<SubTaskQueue> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn last_snapshot(&self) -> SubTaskQueue {
        self.snapshots
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no snapshot published")
    }
}

impl SubTaskQueueChannel for RecordingChannel {
    fn request_queue_ownership(&self, node_id: &NodeId) {
        self.requests.lock().unwrap().push(node_id.clone());
    }

    fn publish_queue(&self, queue: &SubTaskQueue) {
        self.snapshots.lock().unwrap().push(queue.clone());
    }

    fn active_nodes_count(&self) -> usize {
        1
    }

    fn active_nodes(&self) -> Vec<NodeId> {
        Vec::new()
    }
}

pub fn node(id: &str) -> NodeId {
    NodeId::from(id)
}

pub fn chunk(id: &str) -> ChunkDescriptor {
    ChunkDescriptor::new(id)
}

pub fn subtask(id: &str, chunks: &[&str]) -> SubTask {
    SubTask::new(id, chunks.iter().map(|c| chunk(c)).collect())
}

/// Every subtask processes the same chunk, so any pair can be cross-checked.
pub fn shared_split(ids: &[&str]) -> Vec<SubTask> {
    ids.iter().map(|id| subtask(id, &["CHUNK_1"])).collect()
}

/// Result whose chunk hashes are the chunk ids, as every honest peer would compute.
pub fn honest_result(subtask: &SubTask) -> SubTaskResult {
    SubTaskResult {
        subtask_id: subtask.subtask_id.clone(),
        result_hash: Vec::new(),
        chunk_hashes: subtask
            .chunks_to_process
            .iter()
            .map(|c| c.chunk_id.as_bytes().to_vec())
            .collect(),
        node_id: None,
    }
}

pub fn result_with_hashes(subtask_id: &str, hashes: &[&str]) -> SubTaskResult {
    SubTaskResult {
        subtask_id: subtask_id.to_string(),
        result_hash: Vec::new(),
        chunk_hashes: hashes.iter().map(|h| h.as_bytes().to_vec()).collect(),
        node_id: None,
    }
}

pub fn test_config() -> ProcessingConfig {
    ProcessingConfig::default()
}

/// Polls `condition` until it holds or `WAIT` elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
