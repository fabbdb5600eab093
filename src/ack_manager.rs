//! Read-level / ack-level bookkeeping for tasks delivered out of the backlog.
//! Completions arrive out of order; the ack level only advances over the
//! contiguous prefix of completed task IDs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::warn;

struct Levels {
    // task_id -> completed, ordered, for everything delivered but not yet
    // covered by ack_level.
    outstanding: BTreeMap<i64, bool>,
    read_level: i64,
    ack_level: i64,
}

#[derive(Default)]
pub struct AckManager {
    inner: Mutex<Levels>,
}

impl Default for Levels {
    fn default() -> Self {
        Self {
            outstanding: BTreeMap::new(),
            read_level: 0,
            ack_level: 0,
        }
    }
}

impl AckManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a task handed to the matcher. Task IDs must arrive in strictly
    /// increasing order; the reader guarantees this by pumping in store order.
    pub fn add_task(&self, task_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if task_id <= inner.read_level {
            warn!(
                task_id,
                read_level = inner.read_level,
                "task ID not larger than current read level"
            );
        }
        inner.outstanding.insert(task_id, false);
        if task_id > inner.read_level {
            inner.read_level = task_id;
        }
    }

    /// Mark a task complete and return the (possibly advanced) ack level.
    pub fn complete_task(&self, task_id: i64) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(done) = inner.outstanding.get_mut(&task_id) {
            *done = true;
        }
        while let Some((&first, &done)) = inner.outstanding.iter().next() {
            if !done {
                break;
            }
            inner.outstanding.remove(&first);
            inner.ack_level = first;
        }
        inner.ack_level
    }

    /// Initialize from persisted state at manager start.
    pub fn set_ack_level(&self, level: i64) {
        let mut inner = self.inner.lock().unwrap();
        if level > inner.ack_level {
            inner.ack_level = level;
        }
        if level > inner.read_level {
            inner.read_level = level;
        }
    }

    pub fn read_level(&self) -> i64 {
        self.inner.lock().unwrap().read_level
    }

    /// Move the read level without tracking a task, used when the reader
    /// skips over rows it completes directly (expired tasks).
    pub fn set_read_level(&self, level: i64) {
        let mut inner = self.inner.lock().unwrap();
        if level > inner.read_level {
            inner.read_level = level;
        }
    }

    pub fn ack_level(&self) -> i64 {
        self.inner.lock().unwrap().ack_level
    }

    /// Count of delivered-but-unacked tasks. Monitoring only.
    pub fn backlog_count_hint(&self) -> i64 {
        self.inner.lock().unwrap().outstanding.len() as i64
    }
}
