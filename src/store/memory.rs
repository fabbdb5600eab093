//! In-process reference store. Backs the simulation binary and the test
//! suite; a production deployment plugs a real database in behind the same
//! trait.

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crossbeam_skiplist::SkipMap;

use crate::store::{StoreError, TaskListState, TaskStore};
use crate::task::TaskInfo;
use crate::tasklist::TaskListId;

struct ListEntry {
    meta: Mutex<TaskListState>,
    // Sorted by task ID so backlog reads are a range scan, like the key order
    // a real store would give us.
    tasks: SkipMap<i64, TaskInfo>,
}

impl ListEntry {
    fn new() -> Self {
        Self {
            meta: Mutex::new(TaskListState {
                range_id: 0,
                ack_level: 0,
            }),
            tasks: SkipMap::new(),
        }
    }
}

#[derive(Default)]
struct Faults {
    lease_unavailable: usize,
    create_unavailable: usize,
    create_busy: usize,
}

/// In-memory [`TaskStore`] with optional fault injection for tests.
pub struct MemoryTaskStore {
    lists: Mutex<HashMap<TaskListId, Arc<ListEntry>>>,
    faults: Mutex<Faults>,
}

impl MemoryTaskStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lists: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
        })
    }

    fn entry(&self, id: &TaskListId) -> Arc<ListEntry> {
        let mut lists = self.lists.lock().unwrap();
        lists
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ListEntry::new()))
            .clone()
    }

    fn check_range(&self, entry: &ListEntry, range_id: i64) -> Result<(), StoreError> {
        let meta = entry.meta.lock().unwrap();
        if meta.range_id != range_id {
            return Err(StoreError::ConditionFailed(format!(
                "range id mismatch: held {}, current {}",
                range_id, meta.range_id
            )));
        }
        Ok(())
    }

    /// Fail the next `n` lease calls with `Unavailable`.
    pub fn fail_next_leases(&self, n: usize) {
        self.faults.lock().unwrap().lease_unavailable = n;
    }

    /// Fail the next `n` create calls with `Unavailable`.
    pub fn fail_next_creates(&self, n: usize) {
        self.faults.lock().unwrap().create_unavailable = n;
    }

    /// Fail the next `n` create calls with `Busy`.
    pub fn shed_next_creates(&self, n: usize) {
        self.faults.lock().unwrap().create_busy = n;
    }

    /// Number of task rows currently persisted for a task list.
    pub fn task_count(&self, id: &TaskListId) -> usize {
        let lists = self.lists.lock().unwrap();
        lists.get(id).map(|e| e.tasks.len()).unwrap_or(0)
    }

    /// Current persisted state, if the task list has ever been leased.
    pub fn state(&self, id: &TaskListId) -> Option<TaskListState> {
        let lists = self.lists.lock().unwrap();
        lists.get(id).map(|e| *e.meta.lock().unwrap())
    }

    fn take_fault(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn lease_task_list(&self, id: &TaskListId) -> Result<TaskListState, StoreError> {
        if Self::take_fault(&mut self.faults.lock().unwrap().lease_unavailable) {
            return Err(StoreError::Unavailable("injected lease failure".into()));
        }
        let entry = self.entry(id);
        let mut meta = entry.meta.lock().unwrap();
        meta.range_id += 1;
        Ok(*meta)
    }

    async fn update_task_list(
        &self,
        id: &TaskListId,
        range_id: i64,
        ack_level: i64,
    ) -> Result<(), StoreError> {
        let entry = self.entry(id);
        let mut meta = entry.meta.lock().unwrap();
        if meta.range_id != range_id {
            return Err(StoreError::ConditionFailed(format!(
                "range id mismatch: held {}, current {}",
                range_id, meta.range_id
            )));
        }
        meta.ack_level = ack_level;
        Ok(())
    }

    async fn create_tasks(
        &self,
        id: &TaskListId,
        range_id: i64,
        tasks: &[TaskInfo],
    ) -> Result<(), StoreError> {
        {
            let mut faults = self.faults.lock().unwrap();
            if Self::take_fault(&mut faults.create_unavailable) {
                return Err(StoreError::Unavailable("injected create failure".into()));
            }
            if Self::take_fault(&mut faults.create_busy) {
                return Err(StoreError::Busy("injected create shed".into()));
            }
        }
        let entry = self.entry(id);
        self.check_range(&entry, range_id)?;
        for task in tasks {
            entry.tasks.insert(task.task_id, task.clone());
        }
        Ok(())
    }

    async fn get_tasks(
        &self,
        id: &TaskListId,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TaskInfo>, StoreError> {
        let entry = self.entry(id);
        let mut out = Vec::new();
        for kv in entry
            .tasks
            .range((Bound::Excluded(read_level), Bound::Included(max_read_level)))
        {
            if out.len() >= batch_size {
                break;
            }
            out.push(kv.value().clone());
        }
        Ok(out)
    }

    async fn complete_task(&self, id: &TaskListId, task_id: i64) -> Result<(), StoreError> {
        let entry = self.entry(id);
        entry.tasks.remove(&task_id);
        Ok(())
    }

    async fn complete_tasks_less_than(
        &self,
        id: &TaskListId,
        level: i64,
    ) -> Result<usize, StoreError> {
        let entry = self.entry(id);
        let doomed: Vec<i64> = entry
            .tasks
            .range((Bound::Unbounded, Bound::Included(level)))
            .map(|kv| *kv.key())
            .collect();
        let mut count = 0;
        for task_id in doomed {
            if entry.tasks.remove(&task_id).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasklist::{TaskListKind, TaskListType};

    fn tl() -> TaskListId {
        TaskListId::new("dom", "tl", TaskListType::Activity, TaskListKind::Normal)
    }

    fn task(task_id: i64) -> TaskInfo {
        TaskInfo::new("dom", "wf", "run", 1, task_id, None)
    }

    #[tokio::test]
    async fn lease_bumps_range_and_invalidates_stale_writers() {
        let store = MemoryTaskStore::new();
        let id = tl();

        let first = store.lease_task_list(&id).await.unwrap();
        assert_eq!(first.range_id, 1);
        let second = store.lease_task_list(&id).await.unwrap();
        assert_eq!(second.range_id, 2);

        let err = store
            .create_tasks(&id, first.range_id, &[task(1)])
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());

        store
            .create_tasks(&id, second.range_id, &[task(1)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn get_tasks_is_a_half_open_scan() {
        let store = MemoryTaskStore::new();
        let id = tl();
        let state = store.lease_task_list(&id).await.unwrap();
        let batch: Vec<TaskInfo> = (1..=5).map(task).collect();
        store
            .create_tasks(&id, state.range_id, &batch)
            .await
            .unwrap();

        let page = store.get_tasks(&id, 2, 4, 10).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![3, 4]);

        store.complete_task(&id, 4).await.unwrap();
        assert_eq!(store.task_count(&id), 4);

        let deleted = store.complete_tasks_less_than(&id, 3).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.task_count(&id), 1);
    }
}
