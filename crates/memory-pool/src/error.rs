// SPDX-License-Identifier: Apache-2.0

//! Errors raised by the memory pool.
//!
//! Important note: it is important not to use `!Send` data types in errors
//! (e.g. avoid using `Rc`) so these errors can be propagated from any thread
//! calling into the pool.

use crate::task_key::{Tag, TaskKey};

/// Errors that can occur while operating the memory pool.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A `free` call would have driven a task's (or its tag's) non-revocable
    /// reservation negative. The ledger is left unchanged.
    #[error("tried to free more memory than is reserved by task")]
    Underflow {
        /// The task the caller attempted to free memory against.
        task: TaskKey,
        /// The tag involved, if the underflow was detected at the tag level.
        tag: Option<Tag>,
        /// Bytes the caller attempted to free.
        requested: u64,
        /// Bytes actually reserved at the time of the call.
        available: u64,
    },

    /// A `free_revocable` call would have driven a task's revocable
    /// reservation negative. The ledger is left unchanged.
    #[error("tried to free more revocable memory than is reserved by task")]
    RevocableUnderflowTask {
        /// The task the caller attempted to free revocable memory against.
        task: TaskKey,
        /// Bytes the caller attempted to free.
        requested: u64,
        /// Bytes actually reserved at the time of the call.
        available: u64,
    },

    /// A global `free_revocable` call would have driven `global_revocable_bytes`
    /// negative. The ledger is left unchanged.
    #[error("tried to free more revocable memory than is reserved globally")]
    RevocableUnderflowGlobal {
        /// Bytes the caller attempted to free.
        requested: u64,
        /// Bytes actually reserved globally at the time of the call.
        available: u64,
    },

    /// A reservation future was cancelled. Cancellation mid-queue would
    /// desynchronize the ledger (the bytes are already counted as reserved),
    /// so it is rejected rather than honored.
    #[error("cancellation is not supported")]
    CancellationNotSupported,
}

/// Convenience alias for results returned by fallible pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
