//! Processing Engine
//!
//! Worker loops that pull subtasks from a queue accessor, execute them through a
//! `ProcessingCore` and hand the results back for broadcast.
//!
//! ## Lifecycle
//! 1. `start_queue_processing` binds an accessor and spawns `worker_count` loops.
//! 2. Each loop grabs one subtask, runs the core on the blocking pool, completes the subtask
//!    and grabs again.
//! 3. `stop_queue_processing` detaches the accessor. Pending grabs are abandoned; work already
//!    running is not cancelled, its result is discarded.

use crate::pubsub::types::NodeId;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use super::accessor::SubTaskQueueAccessor;
use super::error::ProcessingError;
use super::manager::ProcessingErrorSink;
use super::types::{SubTask, SubTaskResult};

const IDLE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Domain-specific subtask execution. May block.
pub trait ProcessingCore: Send + Sync {
    /// Computes one hash per chunk of `subtask`, in chunk order.
    ///
    /// Chunk hashes must depend only on the chunk data so that peers processing the same chunk
    /// agree; `initial_hash_seed` is available for per-node state.
    fn process_subtask(
        &self,
        subtask: &SubTask,
        initial_hash_seed: u32,
    ) -> anyhow::Result<SubTaskResult>;
}

/// Seed derived from the node id: the first four bytes of its SHA-256.
pub fn initial_hash_seed(node_id: &NodeId) -> u32 {
    let digest = Sha256::digest(node_id.as_str().as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// `SHA-256(seed || chunk_hashes...)`
pub fn compute_result_hash(initial_hash_seed: u32, chunk_hashes: &[Vec<u8>]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(initial_hash_seed.to_be_bytes());
    for chunk_hash in chunk_hashes {
        hasher.update(chunk_hash);
    }
    hasher.finalize().to_vec()
}

/// Core that hashes chunk descriptors, optionally simulating work with a fixed delay.
#[derive(Debug, Default, Clone)]
pub struct DigestProcessingCore {
    work_delay: Duration,
}

impl DigestProcessingCore {
    pub fn new(work_delay: Duration) -> Self {
        Self { work_delay }
    }
}

impl ProcessingCore for DigestProcessingCore {
    fn process_subtask(
        &self,
        subtask: &SubTask,
        _initial_hash_seed: u32,
    ) -> anyhow::Result<SubTaskResult> {
        if !self.work_delay.is_zero() {
            std::thread::sleep(self.work_delay);
        }

        let chunk_hashes = subtask
            .chunks_to_process
            .iter()
            .map(|chunk| {
                let mut hasher = Sha256::new();
                hasher.update(chunk.chunk_id.as_bytes());
                hasher.update(chunk.n_subchunks.to_be_bytes());
                hasher.update(chunk.offset.to_be_bytes());
                hasher.update(chunk.stride.to_be_bytes());
                hasher.finalize().to_vec()
            })
            .collect();

        Ok(SubTaskResult {
            subtask_id: subtask.subtask_id.clone(),
            result_hash: Vec::new(),
            chunk_hashes,
            node_id: None,
        })
    }
}

pub struct ProcessingEngine {
    node_id: NodeId,
    core: Arc<dyn ProcessingCore>,
    worker_count: usize,
    accessor: Mutex<Option<Arc<SubTaskQueueAccessor>>>,
    /// Bumped on every start/stop; workers of an older generation exit.
    generation: watch::Sender<u64>,
    error_sink: Mutex<Option<ProcessingErrorSink>>,
}

impl ProcessingEngine {
    pub fn new(node_id: NodeId, core: Arc<dyn ProcessingCore>, worker_count: usize) -> Arc<Self> {
        let (generation, _) = watch::channel(0);

        Arc::new(Self {
            node_id,
            core,
            worker_count: worker_count.max(1),
            accessor: Mutex::new(None),
            generation,
            error_sink: Mutex::new(None),
        })
    }

    pub fn set_processing_error_sink(&self, sink: ProcessingErrorSink) {
        *self
            .error_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn start_queue_processing(self: &Arc<Self>, accessor: Arc<SubTaskQueueAccessor>) {
        let generation = {
            let mut current = self.accessor.lock().unwrap_or_else(PoisonError::into_inner);
            *current = Some(accessor.clone());
            self.bump_generation()
        };

        tracing::info!(
            "Starting {} processing workers for task {}",
            self.worker_count,
            accessor.task_id()
        );

        for worker_id in 0..self.worker_count {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.worker_loop(worker_id, generation).await;
            });
        }
    }

    pub fn stop_queue_processing(&self) {
        let mut current = self.accessor.lock().unwrap_or_else(PoisonError::into_inner);
        if current.take().is_some() {
            self.bump_generation();
            tracing::debug!("[PROCESSING_STOPPED]");
        }
    }

    pub fn is_queue_processing_started(&self) -> bool {
        self.accessor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn bump_generation(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|generation| {
            *generation += 1;
            next = *generation;
        });
        next
    }

    fn current_accessor(&self, generation: u64) -> Option<Arc<SubTaskQueueAccessor>> {
        if *self.generation.borrow() != generation {
            return None;
        }
        self.accessor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, generation: u64) {
        tracing::debug!("Processing worker {} started", worker_id);
        let mut generation_rx = self.generation.subscribe();

        while let Some(accessor) = self.current_accessor(generation) {
            let grabbed = tokio::select! {
                grabbed = accessor.grab_subtask() => grabbed,
                _ = generation_rx.wait_for(|current| *current != generation) => break,
            };

            match grabbed {
                Ok(Some(subtask)) => {
                    tracing::debug!("[GRABBED] ({})", subtask.subtask_id);
                    self.process_subtask(&accessor, subtask, generation).await;
                }
                Ok(None) | Err(_) => {
                    if accessor.is_task_complete() {
                        tracing::debug!("Worker {}: no more subtasks", worker_id);
                        break;
                    }
                    tokio::time::sleep(IDLE_RETRY_DELAY).await;
                }
            }
        }

        tracing::debug!("Processing worker {} stopped", worker_id);
    }

    async fn process_subtask(
        &self,
        accessor: &SubTaskQueueAccessor,
        subtask: SubTask,
        generation: u64,
    ) {
        tracing::debug!("[PROCESSING_STARTED] ({})", subtask.subtask_id);

        let seed = initial_hash_seed(&self.node_id);
        let core = self.core.clone();
        let input = subtask.clone();
        let outcome = tokio::task::spawn_blocking(move || core.process_subtask(&input, seed)).await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.report_error(ProcessingError::Processing {
                    subtask_id: subtask.subtask_id,
                    reason: e.to_string(),
                });
                return;
            }
            Err(e) => {
                self.report_error(ProcessingError::Processing {
                    subtask_id: subtask.subtask_id,
                    reason: format!("processing task aborted: {}", e),
                });
                return;
            }
        };

        let result = SubTaskResult {
            subtask_id: subtask.subtask_id.clone(),
            result_hash: compute_result_hash(seed, &result.chunk_hashes),
            chunk_hashes: result.chunk_hashes,
            node_id: Some(self.node_id.clone()),
        };
        tracing::debug!("[PROCESSED] ({})", subtask.subtask_id);

        if *self.generation.borrow() != generation {
            tracing::debug!("Discarding result {}, processing stopped", subtask.subtask_id);
            return;
        }

        accessor.complete_subtask(&subtask.subtask_id, result);
    }

    fn report_error(&self, error: ProcessingError) {
        tracing::warn!("{}", error);

        let sink = self
            .error_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            sink(&error.to_string());
        }
    }
}
