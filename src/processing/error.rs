use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("task split produced no subtasks")]
    EmptySplit,

    #[error("duplicate subtask id {0}")]
    DuplicateSubTaskId(String),

    #[error("subtask queue is not initialized")]
    QueueNotInitialized,

    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("subtask {subtask_id} failed: {reason}")]
    Processing { subtask_id: String, reason: String },
}
