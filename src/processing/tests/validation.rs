use super::support::{honest_result, result_with_hashes, shared_split, subtask};
use crate::processing::types::{SubTask, SubTaskResult};
use crate::processing::validation::ValidationCore;
use std::collections::BTreeMap;

fn results_map(results: Vec<SubTaskResult>) -> BTreeMap<String, SubTaskResult> {
    results
        .into_iter()
        .map(|result| (result.subtask_id.clone(), result))
        .collect()
}

fn honest_results(subtasks: &[SubTask]) -> BTreeMap<String, SubTaskResult> {
    results_map(subtasks.iter().map(honest_result).collect())
}

// ============================================================
// VALID RESULT SETS
// ============================================================

#[test]
fn test_matching_hashes_are_valid() {
    // ARRANGE
    let subtasks = shared_split(&["S1", "S2", "S3"]);
    let results = honest_results(&subtasks);

    // ACT
    let report = ValidationCore::new().validate_results(&subtasks, &results);

    // ASSERT
    assert!(report.is_valid(), "Unexpected invalid ids: {:?}", report.invalid_subtask_ids);
}

#[test]
fn test_overlapping_multi_chunk_split_is_valid() {
    let subtasks = vec![
        subtask("S1", &["C1", "C2"]),
        subtask("S2", &["C2", "C3"]),
        subtask("S3", &["C3", "C1"]),
    ];
    let results = honest_results(&subtasks);

    let report = ValidationCore::new().validate_results(&subtasks, &results);

    assert!(report.is_valid());
}

// ============================================================
// INVALID RESULT SETS
// ============================================================

#[test]
fn test_missing_result_is_invalid() {
    let subtasks = shared_split(&["S1", "S2"]);
    let results = results_map(vec![honest_result(&subtasks[0])]);

    let report = ValidationCore::new().validate_results(&subtasks, &results);

    assert!(!report.is_valid());
    assert_eq!(report.invalid_subtask_ids.len(), 1);
    assert!(report.invalid_subtask_ids.contains("S2"));
}

#[test]
fn test_hash_count_mismatch_is_invalid() {
    let subtasks = vec![subtask("S1", &["C1", "C2"]), subtask("S2", &["C1"])];
    let results = results_map(vec![
        result_with_hashes("S1", &["C1"]),
        result_with_hashes("S2", &["C1"]),
    ]);

    let report = ValidationCore::new().validate_results(&subtasks, &results);

    assert!(report.invalid_subtask_ids.contains("S1"));
    assert!(!report.invalid_subtask_ids.contains("S2"));
}

#[test]
fn test_disagreeing_hashes_on_shared_chunk_are_invalid() {
    // ARRANGE: S1 and S2 both process C1 but report different hashes
    let subtasks = vec![subtask("S1", &["C1"]), subtask("S2", &["C1"])];
    let results = results_map(vec![
        result_with_hashes("S1", &["h1"]),
        result_with_hashes("S2", &["h2"]),
    ]);

    // ACT
    let report = ValidationCore::new().validate_results(&subtasks, &results);

    // ASSERT
    assert!(!report.is_valid());
    assert!(!report.invalid_subtask_ids.is_empty());
}

#[test]
fn test_disagreement_only_marks_contributors_of_that_chunk() {
    let subtasks = vec![
        subtask("S1", &["C1", "C2"]),
        subtask("S2", &["C1", "C3"]),
        subtask("S3", &["C2", "C3"]),
    ];
    let results = results_map(vec![
        result_with_hashes("S1", &["bad", "C2"]),
        result_with_hashes("S2", &["C1", "C3"]),
        result_with_hashes("S3", &["C2", "C3"]),
    ]);

    let report = ValidationCore::new().validate_results(&subtasks, &results);

    assert!(report.invalid_subtask_ids.contains("S1"));
    assert!(report.invalid_subtask_ids.contains("S2"));
    assert!(!report.invalid_subtask_ids.contains("S3"));
}

#[test]
fn test_identical_evidence_across_own_chunks_is_invalid() {
    // ARRANGE: S1 claims the same hash for two different chunks
    let subtasks = vec![subtask("S1", &["C1", "C2"]), subtask("S2", &["C1", "C2"])];
    let results = results_map(vec![
        result_with_hashes("S1", &["same", "same"]),
        result_with_hashes("S2", &["same", "same"]),
    ]);

    // ACT
    let report = ValidationCore::new().validate_results(&subtasks, &results);

    // ASSERT
    assert!(report.invalid_subtask_ids.contains("S1"));
    assert!(report.invalid_subtask_ids.contains("S2"));
}

#[test]
fn test_any_disagreement_is_detected() {
    // Every pair of distinct hashes on a shared chunk must be caught, whichever side lies.
    let subtasks = shared_split(&["S1", "S2", "S3"]);
    let validation = ValidationCore::new();

    for liar in ["S1", "S2", "S3"] {
        let results = results_map(
            subtasks
                .iter()
                .map(|s| {
                    if s.subtask_id == liar {
                        result_with_hashes(liar, &["forged"])
                    } else {
                        honest_result(s)
                    }
                })
                .collect(),
        );

        let report = validation.validate_results(&subtasks, &results);

        assert!(!report.is_valid(), "Forged result of {} went undetected", liar);
        assert!(report.invalid_subtask_ids.contains(liar));
    }
}
