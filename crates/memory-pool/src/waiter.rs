// SPDX-License-Identifier: Apache-2.0

//! FIFO queue of pending non-revocable reservations and the future handed
//! back to callers for each one.
//!
//! Grounded on the channel crate's hand-rolled `SendFuture`/`RecvFuture` and
//! its `VecDeque<Waker>` fairness pattern, generalized from a single-threaded
//! `Rc<RefCell<_>>` channel to the pool's `Arc<parking_lot::Mutex<_>>`
//! shared state.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::PoolError;
use crate::task_key::{Tag, TaskKey};

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(0);

/// A pending reservation request sitting in the FIFO queue. Its bytes are
/// already reflected in the pool's `reserved_bytes`; this entry exists only
/// to carry the waker that unblocks the caller once capacity catches up.
pub(crate) struct WaiterEntry {
    pub(crate) id: u64,
    pub(crate) task: TaskKey,
    pub(crate) tag: Tag,
    pub(crate) requested_bytes: u64,
    waker: Option<Waker>,
}

impl WaiterEntry {
    pub(crate) fn new(task: TaskKey, tag: Tag, requested_bytes: u64) -> Self {
        Self {
            id: NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed),
            task,
            tag,
            requested_bytes,
            waker: None,
        }
    }
}

/// Strict FIFO queue of pending reservations, append at the back, drained
/// from the front while capacity permits.
#[derive(Default)]
pub(crate) struct WaiterQueue {
    entries: VecDeque<WaiterEntry>,
}

impl WaiterQueue {
    pub(crate) fn push(&mut self, entry: WaiterEntry) {
        self.entries.push_back(entry);
    }

    /// Pops and wakes entries from the front while `satisfiable` holds.
    /// `satisfiable` does not depend on which entry is at the front (every
    /// waiter's bytes are already counted in `reserved_bytes`), so a single
    /// evaluation governs the whole drain; it is still re-checked per
    /// iteration in case a future revision makes it entry-dependent.
    pub(crate) fn drain_while(&mut self, mut satisfiable: impl FnMut() -> bool) {
        while !self.entries.is_empty() && satisfiable() {
            if let Some(mut entry) = self.entries.pop_front() {
                let (task, tag, bytes) = (entry.task, entry.tag.clone(), entry.requested_bytes);
                tracing::debug!(%task, tag = %tag, bytes, "waiter drained");
                if let Some(waker) = entry.waker.take() {
                    waker.wake();
                }
            }
        }
    }

    /// Finds a still-pending entry by id and (re)registers its waker.
    /// Returns `true` if the entry is still queued (future stays pending),
    /// `false` if it has already been drained (future is ready).
    pub(crate) fn register_waker(&mut self, id: u64, waker: &Waker) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.waker = Some(waker.clone());
            true
        } else {
            false
        }
    }

    /// Whether a waiter with `id` is still queued (i.e. not yet drained).
    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Internal state of a [`ReservationFuture`], kept out of the public API so
/// the pool's private interior (`PoolInner`) never leaks through a public
/// enum's fields.
enum FutureState {
    Ready,
    Waiting {
        pool: Arc<Mutex<crate::pool::PoolInner>>,
        waiter_id: u64,
    },
}

/// A one-shot future resolved when the pool grants the reservation it was
/// created for. Already-completed reservations are constructed directly in
/// the ready state, without ever touching the waiter queue.
pub struct ReservationFuture(FutureState);

impl ReservationFuture {
    pub(crate) fn ready() -> Self {
        Self(FutureState::Ready)
    }

    pub(crate) fn waiting(pool: Arc<Mutex<crate::pool::PoolInner>>, waiter_id: u64) -> Self {
        Self(FutureState::Waiting { pool, waiter_id })
    }

    /// Returns `true` if the reservation has already been granted.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        match &self.0 {
            FutureState::Ready => true,
            FutureState::Waiting { pool, waiter_id } => {
                !pool.lock().waiter_is_pending(*waiter_id)
            }
        }
    }

    /// Cancellation is not supported: the bytes behind a pending reservation
    /// are already reflected in `reserved_bytes`, so withdrawing the request
    /// here would desynchronize the ledger. Callers that want to give up
    /// must still `free` the reservation once it completes.
    pub fn cancel(&self) -> Result<(), PoolError> {
        Err(PoolError::CancellationNotSupported)
    }
}

impl Unpin for ReservationFuture {}

impl Future for ReservationFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.0 {
            FutureState::Ready => Poll::Ready(()),
            FutureState::Waiting { pool, waiter_id } => {
                let still_pending = pool.lock().register_waiter_waker(*waiter_id, cx.waker());
                if still_pending {
                    Poll::Pending
                } else {
                    this.0 = FutureState::Ready;
                    Poll::Ready(())
                }
            }
        }
    }
}
