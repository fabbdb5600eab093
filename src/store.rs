//! Persistence seam for task lists. The engine owns matching semantics; the
//! store behind this trait owns durability and the conditional-write check
//! that enforces single ownership of a range lease.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::task::TaskInfo;
use crate::tasklist::TaskListId;

/// Persisted per-task-list state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskListState {
    /// Monotonic lease counter, bumped on every takeover.
    pub range_id: i64,
    /// Highest task ID below which everything is acknowledged or expired.
    pub ack_level: i64,
}

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// The conditional write lost: another process holds a newer range lease.
    /// Never retried; the manager that receives this must unload.
    #[error("condition failed: {0}")]
    ConditionFailed(String),

    /// Transient unavailability; retried under the persistence retry policy.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store is shedding load. Not retried: piling retries onto an
    /// overloaded store makes it worse, so this surfaces as ServiceBusy.
    #[error("store busy: {0}")]
    Busy(String),

    #[error("store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_condition_failed(&self) -> bool {
        matches!(self, StoreError::ConditionFailed(_))
    }
}

/// Durable task-list storage. All writes carry the caller's `range_id` and
/// fail with [`StoreError::ConditionFailed`] when it is stale.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Take (or steal) ownership of a task list, bumping its range counter.
    async fn lease_task_list(&self, id: &TaskListId) -> Result<TaskListState, StoreError>;

    /// Persist the ack level under the current lease.
    async fn update_task_list(
        &self,
        id: &TaskListId,
        range_id: i64,
        ack_level: i64,
    ) -> Result<(), StoreError>;

    /// Append a batch of tasks under the current lease.
    async fn create_tasks(
        &self,
        id: &TaskListId,
        range_id: i64,
        tasks: &[TaskInfo],
    ) -> Result<(), StoreError>;

    /// Read tasks with `read_level < task_id <= max_read_level`, oldest first.
    async fn get_tasks(
        &self,
        id: &TaskListId,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TaskInfo>, StoreError>;

    /// Delete a single task row.
    async fn complete_task(&self, id: &TaskListId, task_id: i64) -> Result<(), StoreError>;

    /// Ranged delete of every task with `task_id <= level`. Returns the count.
    async fn complete_tasks_less_than(
        &self,
        id: &TaskListId,
        level: i64,
    ) -> Result<usize, StoreError>;
}
