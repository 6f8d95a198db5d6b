// SPDX-License-Identifier: Apache-2.0

//! Identifiers the pool aggregates reservations by.

use std::fmt;

/// Identifies a query. The pool only ever uses this as an aggregation key; it
/// never interprets the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(u64);

impl QueryId {
    /// Creates a query id from a raw numeric value.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-{}", self.0)
    }
}

impl From<u64> for QueryId {
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

/// Identifies a single task within a query's execution. Structured as
/// `(query_id, stage_index, task_index, attempt_index)`; the pool extracts
/// `query_id` for per-query aggregation and otherwise treats the remainder as
/// an opaque disambiguator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    query_id: QueryId,
    stage_index: u32,
    task_index: u32,
    attempt_index: u32,
}

impl TaskKey {
    /// Creates a new task key.
    #[must_use]
    pub fn new(query_id: QueryId, stage_index: u32, task_index: u32, attempt_index: u32) -> Self {
        Self {
            query_id,
            stage_index,
            task_index,
            attempt_index,
        }
    }

    /// Returns the query this task belongs to.
    #[must_use]
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Returns the stage index within the query's plan.
    #[must_use]
    pub fn stage_index(&self) -> u32 {
        self.stage_index
    }

    /// Returns the task index within the stage.
    #[must_use]
    pub fn task_index(&self) -> u32 {
        self.task_index
    }

    /// Returns the attempt index, incremented on task retry.
    #[must_use]
    pub fn attempt_index(&self) -> u32 {
        self.attempt_index
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/stage-{}/task-{}/attempt-{}",
            self.query_id, self.stage_index, self.task_index, self.attempt_index
        )
    }
}

/// A caller-chosen label naming an allocation site (e.g. `"hash-build"`,
/// `"sort-run"`). The pool never interprets tags beyond grouping by equality.
pub type Tag = std::borrow::Cow<'static, str>;
