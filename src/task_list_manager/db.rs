//! Store access scoped to one task list. Owns the cached range ID so every
//! conditional write goes out under the lease this manager last renewed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::store::{StoreError, TaskListState, TaskStore};
use crate::task::TaskInfo;
use crate::tasklist::TaskListId;

pub(crate) struct TaskListDb {
    store: Arc<dyn TaskStore>,
    id: TaskListId,
    range_id: AtomicI64,
}

impl TaskListDb {
    pub fn new(store: Arc<dyn TaskStore>, id: TaskListId) -> Self {
        Self {
            store,
            id,
            range_id: AtomicI64::new(0),
        }
    }

    pub fn range_id(&self) -> i64 {
        self.range_id.load(Ordering::Acquire)
    }

    /// Acquire or renew the range lease, bumping the range counter in the
    /// store and remembering it for subsequent writes.
    pub async fn renew_lease(&self) -> Result<TaskListState, StoreError> {
        let state = self.store.lease_task_list(&self.id).await?;
        self.range_id.store(state.range_id, Ordering::Release);
        Ok(state)
    }

    pub async fn update_state(&self, ack_level: i64) -> Result<(), StoreError> {
        self.store
            .update_task_list(&self.id, self.range_id(), ack_level)
            .await
    }

    pub async fn create_tasks(&self, tasks: &[TaskInfo]) -> Result<(), StoreError> {
        self.store
            .create_tasks(&self.id, self.range_id(), tasks)
            .await
    }

    pub async fn get_tasks(
        &self,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TaskInfo>, StoreError> {
        self.store
            .get_tasks(&self.id, read_level, max_read_level, batch_size)
            .await
    }

    pub async fn complete_task(&self, task_id: i64) -> Result<(), StoreError> {
        self.store.complete_task(&self.id, task_id).await
    }

    pub async fn complete_tasks_less_than(&self, level: i64) -> Result<usize, StoreError> {
        self.store.complete_tasks_less_than(&self.id, level).await
    }
}
