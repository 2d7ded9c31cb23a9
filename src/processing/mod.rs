//! Distributed Processing Module
//!
//! Spreads the subtasks of a task over a peer group with no central coordinator.
//!
//! ## Architecture Overview
//! 1. **Queue**: the peer receiving a task creates a replicated queue of its subtasks and
//!    becomes its owner. Only the owner writes: it locks subtasks for whoever holds ownership
//!    and publishes every change as a full snapshot. Snapshots merge last-writer-wins.
//! 2. **Ownership**: a peer wanting work broadcasts an ownership request; the owner hands
//!    ownership over. Unanswered requests are resolved by a recency-of-locks rollback.
//! 3. **Execution**: engines grab subtasks, run them through a `ProcessingCore` and broadcast
//!    results on the task's result channel.
//! 4. **Finalization**: once every subtask has a result, peers cross-validate the chunk hashes.
//!    Invalid results are evicted and recomputed; the owner alone emits the task result.
//!
//! ## Submodules
//! - **`shared_queue`**: lock-table state machine (no I/O).
//! - **`manager`**: ownership protocol, grab scheduling and timers for one queue.
//! - **`channel`**: queue channel port and its pub/sub implementation.
//! - **`validation`**: cross-subtask hash validation.
//! - **`accessor`**: per-task facade binding manager, storage and validation.
//! - **`engine`**: worker loops driving a `ProcessingCore`.
//! - **`storage`**: state and result persistence collaborators.

pub mod accessor;
pub mod channel;
pub mod clock;
pub mod engine;
pub mod error;
pub mod manager;
pub mod shared_queue;
pub mod storage;
pub mod types;
pub mod validation;

#[cfg(test)]
mod tests;
