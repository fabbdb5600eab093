//! Serialized persistence of produced tasks. A single pump drains a bounded
//! append channel in FIFO order, assigns task IDs from the current range
//! block, and renews the lease when the block runs out.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::retry::{self, RetryPolicy};
use crate::settings::MatchingConfig;
use crate::store::StoreError;
use crate::task::TaskInfo;
use crate::task_list_manager::db::TaskListDb;
use crate::tasklist::TaskIdBlock;

struct AppendRequest {
    info: TaskInfo,
    resp: oneshot::Sender<Result<i64, StoreError>>,
}

pub(crate) struct TaskWriter {
    append_tx: mpsc::Sender<AppendRequest>,
    append_rx: Mutex<Option<mpsc::Receiver<AppendRequest>>>,
    max_read_level: Arc<AtomicI64>,
    db: Arc<TaskListDb>,
    config: Arc<MatchingConfig>,
    fatal_tx: mpsc::UnboundedSender<()>,
}

impl TaskWriter {
    pub fn new(
        db: Arc<TaskListDb>,
        config: Arc<MatchingConfig>,
        fatal_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        let (append_tx, append_rx) = mpsc::channel(config.outstanding_task_append_limit);
        Self {
            append_tx,
            append_rx: Mutex::new(Some(append_rx)),
            max_read_level: Arc::new(AtomicI64::new(0)),
            db,
            config,
            fatal_tx,
        }
    }

    /// Start the dispatcher with the block belonging to the freshly renewed
    /// lease.
    pub fn start(&self, block: TaskIdBlock, shutdown: broadcast::Receiver<()>) {
        let rx = self
            .append_rx
            .lock()
            .unwrap()
            .take()
            .expect("task writer started twice");
        self.max_read_level
            .store(block.start - 1, Ordering::Release);
        let pump = WriterPump {
            db: self.db.clone(),
            config: self.config.clone(),
            max_read_level: self.max_read_level.clone(),
            fatal_tx: self.fatal_tx.clone(),
        };
        tokio::spawn(pump.run(rx, block, shutdown));
    }

    /// Enqueue a task for persistence and wait for its assigned task ID.
    /// Blocks while the append channel is full, which is the producer-side
    /// back-pressure.
    pub async fn append(&self, info: TaskInfo) -> Result<i64, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.append_tx
            .send(AppendRequest { info, resp: tx })
            .await
            .map_err(|_| StoreError::Internal("task writer is stopped".into()))?;
        rx.await
            .map_err(|_| StoreError::Internal("task writer dropped the append".into()))?
    }

    /// Highest task ID persisted so far; upper bound for the reader.
    pub fn max_read_level(&self) -> i64 {
        self.max_read_level.load(Ordering::Acquire)
    }
}

struct WriterPump {
    db: Arc<TaskListDb>,
    config: Arc<MatchingConfig>,
    max_read_level: Arc<AtomicI64>,
    fatal_tx: mpsc::UnboundedSender<()>,
}

impl WriterPump {
    async fn run(
        self,
        mut rx: mpsc::Receiver<AppendRequest>,
        mut block: TaskIdBlock,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut next_id = block.start;
        loop {
            let first = tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };
            let mut batch = vec![first];
            while batch.len() < self.config.task_batch_size {
                match rx.try_recv() {
                    Ok(req) => batch.push(req),
                    Err(_) => break,
                }
            }

            // Assign IDs, renewing the lease when the block is exhausted.
            let mut assigned: Vec<(TaskInfo, oneshot::Sender<Result<i64, StoreError>>)> =
                Vec::with_capacity(batch.len());
            let mut fatal = false;
            for req in batch {
                if next_id > block.end {
                    match self.alloc_block(block.end).await {
                        Ok(new_block) => {
                            block = new_block;
                            next_id = block.start;
                        }
                        Err(err) => {
                            let is_fatal = err.is_condition_failed();
                            let _ = req.resp.send(Err(err));
                            if is_fatal {
                                fatal = true;
                                break;
                            }
                            continue;
                        }
                    }
                }
                let mut info = req.info;
                info.task_id = next_id;
                next_id += 1;
                assigned.push((info, req.resp));
            }
            if fatal {
                for (_, resp) in assigned {
                    let _ = resp.send(Err(StoreError::ConditionFailed("range lease lost".into())));
                }
                self.fail_remaining(rx).await;
                return;
            }
            if assigned.is_empty() {
                continue;
            }

            let infos: Vec<TaskInfo> = assigned.iter().map(|(info, _)| info.clone()).collect();
            let write = retry::retry(&RetryPolicy::persistence(), StoreError::is_transient, || {
                self.db.create_tasks(&infos)
            })
            .await;
            match write {
                Ok(()) => {
                    let last = infos.last().map(|t| t.task_id).unwrap_or(next_id - 1);
                    self.max_read_level.store(last, Ordering::Release);
                    for (info, resp) in assigned {
                        let _ = resp.send(Ok(info.task_id));
                    }
                }
                Err(err) => {
                    warn!(error = %err, "task append failed");
                    let fatal = err.is_condition_failed();
                    for (_, resp) in assigned {
                        let _ = resp.send(Err(err.clone()));
                    }
                    if fatal {
                        self.fail_remaining(rx).await;
                        return;
                    }
                }
            }
        }
        debug!("task writer stopped");
    }

    /// Allocate the next task-ID block by renewing the lease. The previous
    /// block must be fully consumed; the renewed range derives the new block.
    async fn alloc_block(&self, prev_block_end: i64) -> Result<TaskIdBlock, StoreError> {
        let state = retry::retry(&RetryPolicy::persistence(), StoreError::is_transient, || {
            self.db.renew_lease()
        })
        .await?;
        let new_block = TaskIdBlock::for_range(state.range_id, self.config.range_size);
        if new_block.start != prev_block_end + 1 {
            // Another process held the lease in between; IDs jump but stay
            // monotonic.
            warn!(
                prev_block_end,
                new_start = new_block.start,
                "task ID block is not contiguous after lease renewal"
            );
        }
        Ok(new_block)
    }

    /// The lease is gone: unload the manager and fail whatever producers are
    /// still queued so they can retry against a fresh one.
    async fn fail_remaining(&self, mut rx: mpsc::Receiver<AppendRequest>) {
        error!("task writer lost the range lease, unloading");
        let _ = self.fatal_tx.send(());
        rx.close();
        while let Some(req) = rx.recv().await {
            let _ = req
                .resp
                .send(Err(StoreError::ConditionFailed("range lease lost".into())));
        }
    }
}
