//! Processing Module Tests
//!
//! ## Test Scopes
//! - **Queue State**: locking, ownership transfer, rollback heuristic, snapshot merge.
//! - **Validation**: cross-subtask chunk hash checks.
//! - **Queue Manager**: grab scheduling, timers, ownership requests (single node and pairs).
//! - **Accessor**: result accumulation, storage reload, finalization outcomes.
//! - **Engine**: worker loops end to end, error reporting.
//! - **Simulation**: several peers on one in-process bus processing one task.

mod accessor;
mod support;
mod validation;
