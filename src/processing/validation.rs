//! Validation Engine
//!
//! Cross-checks the results of subtasks that share input chunks. Matching hashes are taken to
//! mean matching computation; this detects double-processing and non-deterministic hashing,
//! it does not prove correctness.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::types::{ChunkDescriptor, SubTask, SubTaskResult};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub invalid_subtask_ids: BTreeSet<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.invalid_subtask_ids.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ValidationCore;

impl ValidationCore {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_results(
        &self,
        subtasks: &[SubTask],
        results: &BTreeMap<String, SubTaskResult>,
    ) -> ValidationReport {
        let mut invalid = BTreeSet::new();

        // chunk -> concatenated hash bytes of every contribution
        let mut evidence: BTreeMap<&ChunkDescriptor, Vec<u8>> = BTreeMap::new();
        // chunk -> (subtask id, contributed hash)
        let mut contributions: BTreeMap<&ChunkDescriptor, Vec<(&str, &[u8])>> = BTreeMap::new();

        for subtask in subtasks {
            let Some(result) = results.get(&subtask.subtask_id) else {
                tracing::warn!("NO_RESULTS_FOUND {}", subtask.subtask_id);
                invalid.insert(subtask.subtask_id.clone());
                continue;
            };

            if result.chunk_hashes.len() != subtask.chunks_to_process.len() {
                tracing::warn!("WRONG_RESULT_HASHES_LENGTH {}", subtask.subtask_id);
                invalid.insert(subtask.subtask_id.clone());
                continue;
            }

            for (chunk, hash) in subtask.chunks_to_process.iter().zip(&result.chunk_hashes) {
                evidence.entry(chunk).or_default().extend_from_slice(hash);
                contributions
                    .entry(chunk)
                    .or_default()
                    .push((subtask.subtask_id.as_str(), hash.as_slice()));
            }
        }

        for (chunk, contributed) in &contributions {
            let Some((_, first)) = contributed.first() else {
                continue;
            };

            if contributed.iter().any(|(_, hash)| hash != first) {
                tracing::warn!("CHUNK_HASH_MISMATCH {}", chunk.chunk_id);
                invalid.extend(contributed.iter().map(|(id, _)| id.to_string()));
            }
        }

        for subtask in subtasks {
            if invalid.contains(&subtask.subtask_id) {
                continue;
            }

            if !Self::check_subtask_result_hashes(subtask, &evidence) {
                invalid.insert(subtask.subtask_id.clone());
            }
        }

        ValidationReport {
            invalid_subtask_ids: invalid,
        }
    }

    /// A subtask is consistent when each of its chunks has evidence and no two of its chunks
    /// carry identical aggregated evidence.
    fn check_subtask_result_hashes(
        subtask: &SubTask,
        evidence: &BTreeMap<&ChunkDescriptor, Vec<u8>>,
    ) -> bool {
        let mut encountered: HashSet<&[u8]> = HashSet::new();

        for chunk in &subtask.chunks_to_process {
            let Some(chunk_evidence) = evidence.get(chunk) else {
                tracing::debug!("NO_CHUNK_RESULT_FOUND [{}, {}]", subtask.subtask_id, chunk.chunk_id);
                return false;
            };

            if !encountered.insert(chunk_evidence.as_slice()) {
                tracing::debug!(
                    "INVALID_CHUNK_RESULT_HASH [{}, {}]",
                    subtask.subtask_id,
                    chunk.chunk_id
                );
                return false;
            }
        }

        true
    }
}
