//! Queue State
//!
//! Pure lock-table state machine of one replicated queue. No I/O: the manager decides when
//! snapshots are published and guards every call with the per-queue mutex.

use crate::pubsub::types::NodeId;
use std::sync::Arc;
use std::time::Duration;

use super::clock::Clock;
use super::types::{Ownership, ProcessingQueue, QueueItem};

pub struct SharedQueue {
    local_node_id: NodeId,
    clock: Arc<dyn Clock>,
    queue: Option<ProcessingQueue>,
    valid_item_indices: Vec<usize>,
}

impl SharedQueue {
    pub fn new(local_node_id: NodeId, clock: Arc<dyn Clock>) -> Self {
        Self {
            local_node_id,
            clock,
            queue: None,
            valid_item_indices: Vec::new(),
        }
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    pub fn is_initialized(&self) -> bool {
        self.queue.is_some()
    }

    pub fn queue(&self) -> Option<&ProcessingQueue> {
        self.queue.as_ref()
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    /// Installs a fresh lock table with `item_count` unlocked items, owned by the local node.
    pub fn create_queue(&mut self, item_count: usize) {
        self.queue = Some(ProcessingQueue {
            owner_node_id: None,
            last_update_timestamp: 0,
            items: vec![QueueItem::default(); item_count],
            finalized: false,
        });
        self.valid_item_indices = (0..item_count).collect();

        let local = self.local_node_id.clone();
        self.change_ownership_to(local);
    }

    /// Replaces the local table iff `remote` carries a strictly newer timestamp.
    ///
    /// The finalized marker survives the merge.
    pub fn update_queue(&mut self, mut remote: ProcessingQueue) -> bool {
        let newer = match &self.queue {
            None => true,
            Some(local) => local.last_update_timestamp < remote.last_update_timestamp,
        };

        if newer {
            remote.finalized |= self.is_finalized();
            self.queue = Some(remote);
            self.log_queue();
        }

        newer
    }

    /// First-fit lock over the valid items. Performs no ownership check.
    pub fn lock_item(&mut self) -> Option<usize> {
        let now = self.clock.now_ns();
        let local = self.local_node_id.clone();
        let queue = self.queue.as_mut()?;

        let index = self
            .valid_item_indices
            .iter()
            .copied()
            .find(|&idx| queue.items.get(idx).is_some_and(|item| !item.is_locked()))?;

        let item = &mut queue.items[index];
        item.lock_node_id = Some(local);
        item.lock_timestamp = now;
        queue.last_update_timestamp = now.max(queue.last_update_timestamp + 1);

        self.log_queue();
        Some(index)
    }

    pub fn grab_item(&mut self) -> Option<usize> {
        if !self.has_ownership() {
            return None;
        }

        self.lock_item()
    }

    pub fn move_ownership_to(&mut self, node_id: NodeId) -> bool {
        if !self.has_ownership() {
            return false;
        }

        self.change_ownership_to(node_id);
        true
    }

    /// Reclaims ownership after an unanswered request, by recency of locks.
    ///
    /// Scans backward cyclically from the item most recently locked by the stated owner
    /// (excluding it), or from the end of the table if the owner holds no lock. The first
    /// lock holder found decides: the local node reclaims, anyone else is left to do so.
    /// With no locks at all the local node reclaims.
    pub fn rollback_ownership(&mut self) -> bool {
        if self.has_ownership() {
            return true;
        }

        let Some(queue) = self.queue.as_ref() else {
            return false;
        };

        let len = queue.items.len();
        let owner_item_index = queue.owner_node_id.as_ref().and_then(|owner| {
            queue
                .items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.lock_node_id.as_ref() == Some(owner))
                .max_by_key(|(_, item)| item.lock_timestamp)
                .map(|(idx, _)| idx)
        });

        let scan: Vec<usize> = match owner_item_index {
            Some(owner_idx) => (1..len).map(|step| (len + owner_idx - step) % len).collect(),
            None => (0..len).rev().collect(),
        };

        let previous_holder = scan
            .into_iter()
            .find_map(|idx| queue.items[idx].lock_node_id.clone());

        match previous_holder {
            Some(holder) if holder != self.local_node_id => {
                tracing::debug!("Ownership rollback deferred to {}", holder);
                false
            }
            _ => {
                let local = self.local_node_id.clone();
                self.change_ownership_to(local);
                true
            }
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| q.finalized)
    }

    /// Marks the task result as emitted. Owner only, succeeds at most once per queue.
    pub fn mark_finalized(&mut self) -> bool {
        if !self.has_ownership() || self.is_finalized() {
            return false;
        }

        let now = self.clock.now_ns();
        let Some(queue) = self.queue.as_mut() else {
            return false;
        };

        queue.finalized = true;
        queue.last_update_timestamp = now.max(queue.last_update_timestamp + 1);
        true
    }

    pub fn has_ownership(&self) -> bool {
        self.queue
            .as_ref()
            .is_some_and(|q| q.owner_node_id.as_ref() == Some(&self.local_node_id))
    }

    pub fn ownership(&self) -> Ownership {
        match self.queue.as_ref().and_then(|q| q.owner_node_id.clone()) {
            None => Ownership::Unowned,
            Some(owner) if owner == self.local_node_id => Ownership::OwnedLocal,
            Some(owner) => Ownership::OwnedRemote(owner),
        }
    }

    /// Clears locks older than `timeout` on valid items. Owner only.
    pub fn unlock_expired_items(&mut self, timeout: Duration) -> bool {
        if !self.has_ownership() {
            return false;
        }

        let now = self.clock.now_ns();
        let timeout_ns = timeout.as_nanos() as u64;
        let Some(queue) = self.queue.as_mut() else {
            return false;
        };

        let mut unlocked = false;
        for &idx in &self.valid_item_indices {
            let Some(item) = queue.items.get_mut(idx) else {
                continue;
            };

            if item.is_locked() && now > item.lock_timestamp.saturating_add(timeout_ns) {
                item.lock_node_id = None;
                item.lock_timestamp = 0;
                unlocked = true;
                tracing::debug!("EXPIRED_SUBTASK_UNLOCKED {}", idx);
            }
        }

        if unlocked {
            queue.last_update_timestamp = now.max(queue.last_update_timestamp + 1);
        }

        unlocked
    }

    /// Latest lock time among locked valid items.
    pub fn last_lock_timestamp(&self) -> Option<u64> {
        self.valid_locks().max()
    }

    /// Earliest lock time among locked valid items.
    pub fn earliest_lock_timestamp(&self) -> Option<u64> {
        self.valid_locks().min()
    }

    pub fn set_valid_item_indices(&mut self, indices: Vec<usize>) {
        self.valid_item_indices = indices;
    }

    pub fn valid_item_indices(&self) -> &[usize] {
        &self.valid_item_indices
    }

    fn valid_locks(&self) -> impl Iterator<Item = u64> + '_ {
        self.valid_item_indices.iter().filter_map(|&idx| {
            self.queue
                .as_ref()
                .and_then(|q| q.items.get(idx))
                .filter(|item| item.is_locked())
                .map(|item| item.lock_timestamp)
        })
    }

    fn change_ownership_to(&mut self, node_id: NodeId) {
        let now = self.clock.now_ns();
        if let Some(queue) = self.queue.as_mut() {
            queue.owner_node_id = Some(node_id);
            queue.last_update_timestamp = now.max(queue.last_update_timestamp + 1);
        }
        self.log_queue();
    }

    fn log_queue(&self) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }

        if let Some(queue) = &self.queue {
            let items: Vec<String> = queue
                .items
                .iter()
                .map(|item| {
                    format!(
                        "{}@{}",
                        item.lock_node_id.as_ref().map(NodeId::as_str).unwrap_or("-"),
                        item.lock_timestamp
                    )
                })
                .collect();

            tracing::trace!(
                "Queue owner={:?} ts={} items=[{}]",
                queue.owner_node_id,
                queue.last_update_timestamp,
                items.join(", ")
            );
        }
    }
}
