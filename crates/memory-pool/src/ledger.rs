// SPDX-License-Identifier: Apache-2.0

//! Bookkeeping maps backing the pool's non-revocable and revocable ledgers.
//!
//! Entries are never kept at zero: a task or query dropping to zero bytes is
//! removed from its map rather than left behind holding a zero, per the
//! pool's "map entries never hold zero values" invariant.

use std::collections::HashMap;

use crate::error::PoolError;
use crate::task_key::{QueryId, Tag, TaskKey};

/// Tracks non-revocable reservations: the flat `reserved_bytes` counter plus
/// per-task, per-query, and per-task-tag breakdowns.
#[derive(Default)]
pub(crate) struct AccountingLedger {
    reserved_bytes: u64,
    per_task: HashMap<TaskKey, u64>,
    per_query: HashMap<QueryId, u64>,
    per_task_tags: HashMap<TaskKey, HashMap<Tag, u64>>,
}

impl AccountingLedger {
    pub(crate) fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    pub(crate) fn task_reservation(&self, task: &TaskKey) -> u64 {
        self.per_task.get(task).copied().unwrap_or(0)
    }

    pub(crate) fn task_reservations(&self) -> HashMap<TaskKey, u64> {
        self.per_task.clone()
    }

    pub(crate) fn query_reservation(&self, query: QueryId) -> u64 {
        self.per_query.get(&query).copied().unwrap_or(0)
    }

    pub(crate) fn query_reservations(&self) -> HashMap<QueryId, u64> {
        self.per_query.clone()
    }

    /// Grouped by query: for each query with at least one active task, the
    /// merged tag -> bytes map across all of that query's tasks.
    pub(crate) fn tagged_allocations(&self) -> HashMap<QueryId, HashMap<Tag, u64>> {
        let mut out: HashMap<QueryId, HashMap<Tag, u64>> = HashMap::new();
        for (task, tags) in &self.per_task_tags {
            let query_entry = out.entry(task.query_id()).or_default();
            for (tag, bytes) in tags {
                *query_entry.entry(tag.clone()).or_insert(0) += bytes;
            }
        }
        out
    }

    /// Applies a reservation of `bytes` to `task`/`tag`. Never fails:
    /// reserving is unconditional at the ledger level; capacity gating
    /// happens one layer up, in the pool.
    pub(crate) fn reserve(&mut self, task: TaskKey, tag: Tag, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.reserved_bytes = self
            .reserved_bytes
            .checked_add(bytes)
            .expect("reserved_bytes overflowed u64");
        *self.per_task.entry(task).or_insert(0) += bytes;
        *self.per_query.entry(task.query_id()).or_insert(0) += bytes;
        *self
            .per_task_tags
            .entry(task)
            .or_default()
            .entry(tag)
            .or_insert(0) += bytes;
    }

    /// Releases a reservation of `bytes` from `task`/`tag`. Fails with
    /// [`PoolError::Underflow`] and leaves the ledger untouched if any
    /// counter would go negative.
    pub(crate) fn free(&mut self, task: TaskKey, tag: Tag, bytes: u64) -> Result<(), PoolError> {
        if bytes == 0 {
            return Ok(());
        }

        let task_available = self.task_reservation(&task);
        let tag_available = self
            .per_task_tags
            .get(&task)
            .and_then(|tags| tags.get(&tag))
            .copied()
            .unwrap_or(0);

        if bytes > task_available || bytes > tag_available {
            let available = task_available.min(tag_available);
            tracing::warn!(
                %task,
                tag = %tag,
                requested = bytes,
                available,
                "rejected free exceeding task/tag reservation"
            );
            return Err(PoolError::Underflow {
                task,
                tag: Some(tag),
                requested: bytes,
                available,
            });
        }

        self.reserved_bytes -= bytes;

        let new_task_total = task_available - bytes;
        if new_task_total == 0 {
            let _ = self.per_task.remove(&task);
        } else {
            let _ = self.per_task.insert(task, new_task_total);
        }

        let query = task.query_id();
        let query_total = self.query_reservation(query);
        let new_query_total = query_total - bytes;
        if new_query_total == 0 {
            let _ = self.per_query.remove(&query);
        } else {
            let _ = self.per_query.insert(query, new_query_total);
        }

        if let Some(tags) = self.per_task_tags.get_mut(&task) {
            let new_tag_total = tag_available - bytes;
            if new_tag_total == 0 {
                let _ = tags.remove(&tag);
            } else {
                let _ = tags.insert(tag, new_tag_total);
            }
            if tags.is_empty() {
                let _ = self.per_task_tags.remove(&task);
            }
        }

        Ok(())
    }
}

/// Tracks revocable reservations: the flat `reserved_revocable_bytes`
/// counter, per-task/per-query breakdowns, and the task-less
/// `global_revocable_bytes` counter used by engine-level caches.
#[derive(Default)]
pub(crate) struct RevocableLedger {
    reserved_revocable_bytes: u64,
    global_revocable_bytes: u64,
    per_task: HashMap<TaskKey, u64>,
    per_query: HashMap<QueryId, u64>,
}

impl RevocableLedger {
    pub(crate) fn reserved_revocable_bytes(&self) -> u64 {
        self.reserved_revocable_bytes
    }

    pub(crate) fn task_reservation(&self, task: &TaskKey) -> u64 {
        self.per_task.get(task).copied().unwrap_or(0)
    }

    /// Unconditionally applies a revocable reservation. Never fails for
    /// capacity reasons; the policy layer is expected to keep the total
    /// sensible via revocation requests.
    pub(crate) fn reserve(&mut self, task: TaskKey, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.reserved_revocable_bytes = self
            .reserved_revocable_bytes
            .checked_add(bytes)
            .expect("reserved_revocable_bytes overflowed u64");
        *self.per_task.entry(task).or_insert(0) += bytes;
        *self.per_query.entry(task.query_id()).or_insert(0) += bytes;
    }

    /// Applies a task-less global revocable reservation, already validated
    /// by the caller's capacity check.
    pub(crate) fn reserve_global(&mut self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.reserved_revocable_bytes = self
            .reserved_revocable_bytes
            .checked_add(bytes)
            .expect("reserved_revocable_bytes overflowed u64");
        self.global_revocable_bytes += bytes;
    }

    pub(crate) fn free(&mut self, task: TaskKey, bytes: u64) -> Result<(), PoolError> {
        if bytes == 0 {
            return Ok(());
        }
        let available = self.task_reservation(&task);
        if bytes > available {
            tracing::warn!(
                %task,
                requested = bytes,
                available,
                "rejected revocable free exceeding task reservation"
            );
            return Err(PoolError::RevocableUnderflowTask {
                task,
                requested: bytes,
                available,
            });
        }

        self.reserved_revocable_bytes -= bytes;
        let new_total = available - bytes;
        if new_total == 0 {
            let _ = self.per_task.remove(&task);
        } else {
            let _ = self.per_task.insert(task, new_total);
        }

        let query = task.query_id();
        let query_total = self.per_query.get(&query).copied().unwrap_or(0);
        let new_query_total = query_total - bytes;
        if new_query_total == 0 {
            let _ = self.per_query.remove(&query);
        } else {
            let _ = self.per_query.insert(query, new_query_total);
        }

        Ok(())
    }

    pub(crate) fn free_global(&mut self, bytes: u64) -> Result<(), PoolError> {
        if bytes == 0 {
            return Ok(());
        }
        if bytes > self.global_revocable_bytes {
            tracing::warn!(
                requested = bytes,
                available = self.global_revocable_bytes,
                "rejected global revocable free exceeding global reservation"
            );
            return Err(PoolError::RevocableUnderflowGlobal {
                requested: bytes,
                available: self.global_revocable_bytes,
            });
        }
        self.reserved_revocable_bytes -= bytes;
        self.global_revocable_bytes -= bytes;
        Ok(())
    }
}
