// SPDX-License-Identifier: Apache-2.0

//! The shared memory pool: a single mutex-guarded ledger pair plus the
//! waiter queue and listener registry that sit on top of them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PoolResult;
use crate::ledger::{AccountingLedger, RevocableLedger};
use crate::listener::{EventKind, ListenerId, ListenerRegistry, MemoryEvent, notify};
use crate::task_key::{QueryId, Tag, TaskKey};
use crate::waiter::{ReservationFuture, WaiterEntry, WaiterQueue};

/// Interior state guarded by the pool's single mutex. All reads that must be
/// consistent across more than one of these fields take the lock once
/// rather than composing several short locks.
pub(crate) struct PoolInner {
    capacity_bytes: u64,
    accounting: AccountingLedger,
    revocable: RevocableLedger,
    waiters: WaiterQueue,
    listeners: ListenerRegistry,
}

impl PoolInner {
    fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            accounting: AccountingLedger::default(),
            revocable: RevocableLedger::default(),
            waiters: WaiterQueue::default(),
            listeners: ListenerRegistry::new(),
        }
    }

    /// `reserved_bytes + reserved_revocable_bytes <= capacity_bytes`: the
    /// predicate both the reserve fast path and the waiter drain use.
    fn capacity_satisfied(&self) -> bool {
        self.accounting.reserved_bytes() + self.revocable.reserved_revocable_bytes()
            <= self.capacity_bytes
    }

    /// Drains the waiter queue once free capacity may have increased. Every
    /// queued waiter's bytes are already folded into `reserved_bytes` from
    /// the moment it was created, so the drain predicate is the same
    /// constant for every entry in the queue; once it holds, the whole
    /// queue empties in one pass rather than one waiter at a time.
    fn drain_waiters(&mut self) {
        let satisfied = self.capacity_satisfied();
        if satisfied {
            self.waiters.drain_while(|| true);
        }
    }

    fn reserved_event(&self, task: Option<TaskKey>, tag: Option<Tag>, bytes: u64) -> MemoryEvent {
        MemoryEvent {
            kind: EventKind::MemoryReserved,
            task,
            tag,
            bytes,
            reserved_bytes: self.accounting.reserved_bytes(),
            reserved_revocable_bytes: self.revocable.reserved_revocable_bytes(),
        }
    }

    fn freed_event(&self, task: Option<TaskKey>, tag: Option<Tag>, bytes: u64) -> MemoryEvent {
        MemoryEvent {
            kind: EventKind::MemoryFreed,
            task,
            tag,
            bytes,
            reserved_bytes: self.accounting.reserved_bytes(),
            reserved_revocable_bytes: self.revocable.reserved_revocable_bytes(),
        }
    }

    pub(crate) fn waiter_is_pending(&self, id: u64) -> bool {
        self.waiters.contains(id)
    }

    pub(crate) fn register_waiter_waker(&mut self, id: u64, waker: &std::task::Waker) -> bool {
        self.waiters.register_waker(id, waker)
    }
}

/// Accounts for and gates bulk memory usage across concurrent
/// query-execution tasks sharing a worker process.
///
/// Cheap to clone: a `MemoryPool` is a handle around an `Arc<Mutex<_>>`, so
/// every operator/task thread in the process can hold its own clone while
/// all of them mutate the same underlying ledgers.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl MemoryPool {
    /// Creates a pool with a fixed, immutable capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity_bytes` is zero; a zero-capacity pool could never
    /// grant a positive reservation and very likely indicates a
    /// misconfiguration rather than an intentional limit.
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Self {
        assert!(capacity_bytes > 0, "memory pool capacity must be positive");
        Self {
            inner: Arc::new(Mutex::new(PoolInner::new(capacity_bytes))),
        }
    }

    /// The pool's fixed capacity in bytes.
    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.inner.lock().capacity_bytes
    }

    /// Reserves `bytes` for `task` under `tag`.
    ///
    /// The reservation is applied to the ledger immediately regardless of
    /// available capacity. The returned future is already resolved if the
    /// pool had enough free non-revocable capacity at the moment of the
    /// call; otherwise the request joins the FIFO waiter queue and the
    /// future resolves once frees bring the pool back within budget.
    /// Callers that want a hard accept/reject test instead should use
    /// [`MemoryPool::try_reserve`].
    pub fn reserve(&self, task: TaskKey, tag: impl Into<Tag>, bytes: u64) -> ReservationFuture {
        let tag = tag.into();
        let (future, event, callbacks) = {
            let mut inner = self.inner.lock();
            inner.accounting.reserve(task, tag.clone(), bytes);

            let future = if inner.capacity_satisfied() {
                ReservationFuture::ready()
            } else {
                let waiter = WaiterEntry::new(task, tag.clone(), bytes);
                let waiter_id = waiter.id;
                inner.waiters.push(waiter);
                tracing::debug!(%task, tag = %tag, bytes, "reserve exceeds free capacity; queued");
                ReservationFuture::waiting(self.inner.clone(), waiter_id)
            };

            let event = inner.reserved_event(Some(task), Some(tag), bytes);
            let callbacks = inner.listeners.callbacks_for(EventKind::MemoryReserved);
            (future, event, callbacks)
        };
        notify(&callbacks, &event);
        future
    }

    /// Atomically tests whether `bytes` fits in the pool's current free
    /// non-revocable capacity; if so, reserves it (as [`MemoryPool::reserve`]
    /// would, without ever creating a waiter) and returns `true`. Otherwise
    /// leaves the ledger untouched and returns `false`.
    pub fn try_reserve(&self, task: TaskKey, tag: impl Into<Tag>, bytes: u64) -> bool {
        let tag = tag.into();
        let (granted, event, callbacks) = {
            let mut inner = self.inner.lock();
            let fits = inner.accounting.reserved_bytes() + bytes
                + inner.revocable.reserved_revocable_bytes()
                <= inner.capacity_bytes;
            if fits {
                inner.accounting.reserve(task, tag.clone(), bytes);
            }
            let event = inner.reserved_event(Some(task), Some(tag), bytes);
            let callbacks = if fits {
                inner.listeners.callbacks_for(EventKind::MemoryReserved)
            } else {
                Vec::new()
            };
            (fits, event, callbacks)
        };
        if granted {
            notify(&callbacks, &event);
        }
        granted
    }

    /// Releases a non-revocable reservation of `bytes` from `task`/`tag`.
    ///
    /// Fails with [`crate::error::PoolError::Underflow`] and leaves the ledger untouched
    /// if doing so would drive the task's or tag's reservation negative.
    /// On success, drains as many queued waiters as current capacity
    /// allows.
    pub fn free(&self, task: TaskKey, tag: impl Into<Tag>, bytes: u64) -> PoolResult<()> {
        let tag = tag.into();
        let (event, callbacks) = {
            let mut inner = self.inner.lock();
            inner.accounting.free(task, tag.clone(), bytes)?;
            inner.drain_waiters();
            let event = inner.freed_event(Some(task), Some(tag), bytes);
            let callbacks = inner.listeners.callbacks_for(EventKind::MemoryFreed);
            (event, callbacks)
        };
        notify(&callbacks, &event);
        Ok(())
    }

    /// Free non-revocable and revocable capacity remaining in the pool.
    /// May be negative: revocable reservations can transiently push total
    /// usage above `capacity_bytes`.
    #[must_use]
    pub fn get_free_bytes(&self) -> i64 {
        let inner = self.inner.lock();
        inner.capacity_bytes as i64
            - inner.accounting.reserved_bytes() as i64
            - inner.revocable.reserved_revocable_bytes() as i64
    }

    /// Total non-revocable bytes currently reserved across all tasks.
    #[must_use]
    pub fn get_reserved_bytes(&self) -> u64 {
        self.inner.lock().accounting.reserved_bytes()
    }

    /// Total revocable bytes currently reserved, task-attributed plus
    /// global.
    #[must_use]
    pub fn get_reserved_revocable_bytes(&self) -> u64 {
        self.inner.lock().revocable.reserved_revocable_bytes()
    }

    /// Snapshot of non-revocable reservation totals by query.
    #[must_use]
    pub fn get_query_memory_reservations(&self) -> HashMap<QueryId, u64> {
        self.inner.lock().accounting.query_reservations()
    }

    /// Non-revocable reservation total for a single query (`0` if absent).
    #[must_use]
    pub fn get_query_memory_reservation(&self, query: QueryId) -> u64 {
        self.inner.lock().accounting.query_reservation(query)
    }

    /// Snapshot of non-revocable reservation totals by task.
    #[must_use]
    pub fn get_task_memory_reservations(&self) -> HashMap<TaskKey, u64> {
        self.inner.lock().accounting.task_reservations()
    }

    /// Non-revocable reservation total for a single task (`0` if absent).
    #[must_use]
    pub fn get_task_memory_reservation(&self, task: TaskKey) -> u64 {
        self.inner.lock().accounting.task_reservation(&task)
    }

    /// Snapshot of tag -> bytes breakdowns, grouped by query, merged across
    /// that query's tasks. A query with no active tasks is absent.
    #[must_use]
    pub fn get_tagged_memory_allocations(&self) -> HashMap<QueryId, HashMap<Tag, u64>> {
        self.inner.lock().accounting.tagged_allocations()
    }

    /// Reserves `bytes` of revocable memory for `task`. Unconditional: never
    /// blocks and never fails for capacity reasons. The policy layer is
    /// expected to keep the aggregate revocable total sensible by issuing
    /// revocation requests to operators holding it.
    pub fn reserve_revocable(&self, task: TaskKey, bytes: u64) {
        let (event, callbacks) = {
            let mut inner = self.inner.lock();
            inner.revocable.reserve(task, bytes);
            let event = inner.reserved_event(Some(task), None, bytes);
            let callbacks = inner.listeners.callbacks_for(EventKind::MemoryReserved);
            (event, callbacks)
        };
        notify(&callbacks, &event);
    }

    /// Atomically reserves `bytes` of task-less, global revocable memory
    /// (engine-level caches not attributable to a single task) if it fits
    /// within the pool's capacity, counting existing revocable reservations
    /// against the same budget.
    pub fn try_reserve_revocable(&self, bytes: u64) -> bool {
        let (granted, event, callbacks) = {
            let mut inner = self.inner.lock();
            let fits = inner.accounting.reserved_bytes()
                + inner.revocable.reserved_revocable_bytes()
                + bytes
                <= inner.capacity_bytes;
            if fits {
                inner.revocable.reserve_global(bytes);
            }
            let event = inner.reserved_event(None, None, bytes);
            let callbacks = if fits {
                inner.listeners.callbacks_for(EventKind::MemoryReserved)
            } else {
                Vec::new()
            };
            (fits, event, callbacks)
        };
        if granted {
            notify(&callbacks, &event);
        }
        granted
    }

    /// Releases `bytes` of revocable memory held by `task`.
    ///
    /// Fails with [`crate::error::PoolError::RevocableUnderflowTask`] and leaves the
    /// ledger untouched if it would drive the task's revocable reservation
    /// negative. On success, drains queued non-revocable waiters.
    pub fn free_revocable(&self, task: TaskKey, bytes: u64) -> PoolResult<()> {
        let (event, callbacks) = {
            let mut inner = self.inner.lock();
            inner.revocable.free(task, bytes)?;
            inner.drain_waiters();
            let event = inner.freed_event(Some(task), None, bytes);
            let callbacks = inner.listeners.callbacks_for(EventKind::MemoryFreed);
            (event, callbacks)
        };
        notify(&callbacks, &event);
        Ok(())
    }

    /// Releases `bytes` of task-less global revocable memory.
    ///
    /// Fails with [`crate::error::PoolError::RevocableUnderflowGlobal`] and leaves the
    /// ledger untouched if it would drive `global_revocable_bytes` negative.
    /// On success, drains queued non-revocable waiters.
    pub fn free_global_revocable(&self, bytes: u64) -> PoolResult<()> {
        let (event, callbacks) = {
            let mut inner = self.inner.lock();
            inner.revocable.free_global(bytes)?;
            inner.drain_waiters();
            let event = inner.freed_event(None, None, bytes);
            let callbacks = inner.listeners.callbacks_for(EventKind::MemoryFreed);
            (event, callbacks)
        };
        notify(&callbacks, &event);
        Ok(())
    }

    /// Registers a listener for `kind` events. The callback runs after the
    /// pool's lock has been released for the mutation that triggered it, on
    /// a snapshot of the state that resulted from that mutation; it must
    /// not call back into this pool.
    pub fn register_listener<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&MemoryEvent) + Send + Sync + 'static,
    {
        self.inner.lock().listeners.register(kind, callback)
    }

    /// Removes a previously registered listener by identity. Best-effort:
    /// an unknown or already-removed id is silently ignored.
    pub fn deregister_listener(&self, id: ListenerId) {
        self.inner.lock().listeners.deregister(id);
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryPool")
            .field("capacity_bytes", &inner.capacity_bytes)
            .field("reserved_bytes", &inner.accounting.reserved_bytes())
            .field(
                "reserved_revocable_bytes",
                &inner.revocable.reserved_revocable_bytes(),
            )
            .finish()
    }
}
