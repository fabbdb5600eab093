//! Garbage collection of acknowledged task ranges. Deletion is batched: a
//! single ranged delete up to the ack level, at most once per interval or
//! once per N completions. Failures wait for the next trigger; they are
//! never fatal.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::settings::MatchingConfig;
use crate::task_list_manager::db::TaskListDb;

struct GcState {
    last_run: Instant,
    completions_since: usize,
    deleted_up_to: i64,
}

pub(crate) struct TaskGc {
    db: Arc<TaskListDb>,
    config: Arc<MatchingConfig>,
    metrics: Metrics,
    state: Mutex<GcState>,
}

impl TaskGc {
    pub fn new(db: Arc<TaskListDb>, config: Arc<MatchingConfig>, metrics: Metrics) -> Self {
        Self {
            db,
            config,
            metrics,
            state: Mutex::new(GcState {
                last_run: Instant::now(),
                completions_since: 0,
                deleted_up_to: 0,
            }),
        }
    }

    /// Called on every ack-level advancement; decides internally whether this
    /// trigger actually deletes.
    pub async fn run(&self, ack_level: i64) {
        {
            let mut state = self.state.lock().unwrap();
            state.completions_since += 1;
            if ack_level <= state.deleted_up_to {
                return;
            }
            let due = state.completions_since >= self.config.gc_completions_threshold
                || state.last_run.elapsed() >= self.config.gc_interval();
            if !due {
                return;
            }
        }
        match self.db.complete_tasks_less_than(ack_level).await {
            Ok(count) => {
                let mut state = self.state.lock().unwrap();
                state.last_run = Instant::now();
                state.completions_since = 0;
                state.deleted_up_to = ack_level;
                self.metrics.record_gc_deleted(count as u64);
                debug!(ack_level, count, "task gc deleted acked range");
            }
            Err(err) => {
                warn!(error = %err, "task gc failed, will retry on next trigger");
            }
        }
    }
}
