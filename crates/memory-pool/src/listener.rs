// SPDX-License-Identifier: Apache-2.0

//! Observer registry for memory-reserved / memory-freed events.
//!
//! Grounded on the registration-order, short-and-non-blocking observer
//! contract used by the engine's admission controller: listeners are plain
//! callbacks selected by event kind, invoked in registration order, and a
//! panicking listener must not be allowed to corrupt pool state.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::task_key::{Tag, TaskKey};

/// Which class of mutation a listener wants to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Fired after any reservation (revocable or not) is applied.
    MemoryReserved,
    /// Fired after any free (revocable or not) is applied.
    MemoryFreed,
}

/// A snapshot of pool state handed to listeners, taken atomically with the
/// mutation that triggered the event while the pool's lock was held. The
/// listener is invoked after the lock is released, so this snapshot — not a
/// live reference to the pool — is all it ever sees.
#[derive(Debug, Clone)]
pub struct MemoryEvent {
    /// Which kind of mutation produced this event.
    pub kind: EventKind,
    /// The task the mutation was attributed to, if any (the global revocable
    /// forms have no task).
    pub task: Option<TaskKey>,
    /// The tag involved, if any.
    pub tag: Option<Tag>,
    /// Bytes reserved or freed by the triggering call.
    pub bytes: u64,
    /// `reserved_bytes` immediately after the mutation.
    pub reserved_bytes: u64,
    /// `reserved_revocable_bytes` immediately after the mutation.
    pub reserved_revocable_bytes: u64,
}

/// Identifies a registered listener for later deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerFn = dyn Fn(&MemoryEvent) + Send + Sync;

struct Registration {
    id: ListenerId,
    kind: EventKind,
    callback: Arc<ListenerFn>,
}

/// Holds registered listeners and fans events out to them in registration
/// order. Cloning a registry clones the `Arc`-held callbacks cheaply; the
/// pool keeps one registry behind its lock and clones the matching
/// registrations out before releasing the lock so callbacks never run while
/// the pool is held.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    registrations: Vec<Registration>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for the given event kind. Returns an id usable
    /// with [`ListenerRegistry::deregister`].
    pub fn register<F>(&mut self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&MemoryEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations.push(Registration {
            id,
            kind,
            callback: Arc::new(callback),
        });
        id
    }

    /// Removes a previously registered listener by identity. Best-effort: a
    /// stale or unknown id is silently ignored.
    pub fn deregister(&mut self, id: ListenerId) {
        self.registrations.retain(|r| r.id != id);
    }

    /// Collects the callbacks registered for `kind`, in registration order,
    /// for invocation outside the pool's lock.
    pub(crate) fn callbacks_for(&self, kind: EventKind) -> Vec<Arc<ListenerFn>> {
        self.registrations
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.callback.clone())
            .collect()
    }
}

/// Invokes each callback with `event`, isolating the pool from a panicking
/// listener: the panic is caught and logged rather than propagated, per the
/// "swallow-and-log" resolution for listener misbehavior.
pub(crate) fn notify(callbacks: &[Arc<ListenerFn>], event: &MemoryEvent) {
    for callback in callbacks {
        let callback = AssertUnwindSafe(callback.as_ref());
        let event = AssertUnwindSafe(event);
        if let Err(payload) = catch_unwind(move || (callback.0)(&event.0)) {
            let reason = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("listener panicked with a non-string payload");
            tracing::error!(panic = reason, "memory pool listener panicked; ignoring");
        }
    }
}
