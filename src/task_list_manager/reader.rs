//! Backlog pump: pages persisted tasks into the rendezvous and tracks their
//! completions. Two loops per task list: the dispatch pump (store order,
//! blocking offers) and the outcome loop (acks, GC, failure re-appends).

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, warn};

use crate::ack_manager::AckManager;
use crate::matcher::{MatchError, TaskMatcher};
use crate::retry::{self, RetryPolicy};
use crate::settings::MatchingConfig;
use crate::store::StoreError;
use crate::task::{InternalTask, TaskOutcome};
use crate::task_list_manager::db::TaskListDb;
use crate::task_list_manager::gc::TaskGc;
use crate::task_list_manager::writer::TaskWriter;

const IDLE_RESCAN_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct TaskReader {
    signal: Arc<Notify>,
    outcomes_tx: mpsc::UnboundedSender<TaskOutcome>,
    outcomes_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskOutcome>>>,
}

pub(crate) struct ReaderDeps {
    pub db: Arc<TaskListDb>,
    pub ack: Arc<AckManager>,
    pub matcher: Arc<TaskMatcher>,
    pub writer: Arc<TaskWriter>,
    pub gc: Arc<TaskGc>,
    pub config: Arc<MatchingConfig>,
    pub fatal_tx: mpsc::UnboundedSender<()>,
}

impl TaskReader {
    pub fn new() -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            signal: Arc::new(Notify::new()),
            outcomes_tx,
            outcomes_rx: Mutex::new(Some(outcomes_rx)),
        }
    }

    /// Wake the pump; called after every successful append.
    pub fn signal(&self) {
        self.signal.notify_one();
    }

    pub fn start(&self, deps: ReaderDeps, shutdown: broadcast::Sender<()>) {
        let outcomes_rx = self
            .outcomes_rx
            .lock()
            .unwrap()
            .take()
            .expect("task reader started twice");

        let pump = DispatchPump {
            db: deps.db.clone(),
            ack: deps.ack.clone(),
            matcher: deps.matcher,
            writer: deps.writer.clone(),
            gc: deps.gc.clone(),
            config: deps.config.clone(),
            signal: self.signal.clone(),
            outcomes_tx: self.outcomes_tx.clone(),
        };
        let outcomes = OutcomeLoop {
            db: deps.db,
            ack: deps.ack,
            writer: deps.writer,
            gc: deps.gc,
            config: deps.config,
            signal: self.signal.clone(),
            fatal_tx: deps.fatal_tx,
        };

        tokio::spawn(pump.run(shutdown.subscribe()));
        tokio::spawn(outcomes.run(outcomes_rx, shutdown.subscribe()));
    }
}

struct DispatchPump {
    db: Arc<TaskListDb>,
    ack: Arc<AckManager>,
    matcher: Arc<TaskMatcher>,
    writer: Arc<TaskWriter>,
    gc: Arc<TaskGc>,
    config: Arc<MatchingConfig>,
    signal: Arc<Notify>,
    outcomes_tx: mpsc::UnboundedSender<TaskOutcome>,
}

impl DispatchPump {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.signal.notified() => {}
                _ = tokio::time::sleep(IDLE_RESCAN_INTERVAL) => {}
                _ = shutdown.recv() => break,
            }
            if self.drain(&mut shutdown).await.is_err() {
                break;
            }
        }
        debug!("task reader pump stopped");
    }

    /// Offer everything between the read level and the writer's high
    /// watermark, in store order. Blocking offers are the back-pressure: the
    /// pump runs at poller consumption rate.
    async fn drain(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), MatchError> {
        loop {
            let read_level = self.ack.read_level();
            let max_read_level = self.writer.max_read_level();
            if read_level >= max_read_level {
                return Ok(());
            }
            let page = retry::retry(&RetryPolicy::persistence(), StoreError::is_transient, || {
                self.db
                    .get_tasks(read_level, max_read_level, self.config.get_tasks_batch_size)
            })
            .await;
            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, "backlog read failed, will rescan");
                    return Ok(());
                }
            };
            if page.is_empty() {
                // Nothing left in the window (IDs can be skipped by failed
                // appends); jump the read level forward.
                self.ack.set_read_level(max_read_level);
                return Ok(());
            }

            let now = SystemTime::now();
            for info in page {
                let task_id = info.task_id;
                self.ack.add_task(task_id);
                if info.is_expired(now) {
                    // Expired rows never reach a poller: delete in place and
                    // ack over them. A failed delete is left for the ranged
                    // GC delete to catch up on.
                    if let Err(err) = self.db.complete_task(task_id).await {
                        warn!(error = %err, task_id, "failed to delete expired task");
                    }
                    let ack_level = self.ack.complete_task(task_id);
                    self.gc.run(ack_level).await;
                    continue;
                }
                let task = InternalTask::new_backlog(info, self.outcomes_tx.clone());
                self.matcher.must_offer(task, shutdown).await?;
            }
        }
    }
}

struct OutcomeLoop {
    db: Arc<TaskListDb>,
    ack: Arc<AckManager>,
    writer: Arc<TaskWriter>,
    gc: Arc<TaskGc>,
    config: Arc<MatchingConfig>,
    signal: Arc<Notify>,
    fatal_tx: mpsc::UnboundedSender<()>,
}

impl OutcomeLoop {
    async fn run(
        self,
        mut outcomes: mpsc::UnboundedReceiver<TaskOutcome>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ack_tick = tokio::time::interval(self.config.update_ack_interval());
        ack_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        ack_tick.tick().await;

        loop {
            tokio::select! {
                outcome = outcomes.recv() => match outcome {
                    Some(outcome) => {
                        if self.handle(outcome).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ack_tick.tick() => {
                    if self.persist_ack_level().await.is_err() {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("task reader outcome loop stopped");
    }

    async fn handle(&self, outcome: TaskOutcome) -> Result<(), ()> {
        if let Err(err) = outcome.result {
            // The task reached a poller but was not completed. It cannot just
            // be dropped; write it back with a fresh, higher task ID so the
            // backlog keeps making progress.
            debug!(
                task_id = outcome.info.task_id,
                error = %err,
                "task dispatch failed, re-appending"
            );
            match self.writer.append(outcome.info.clone()).await {
                Ok(_) => self.signal.notify_one(),
                Err(append_err) => {
                    // Persistence is down too. The old task must not be lost,
                    // so the whole task list unloads and starts over.
                    warn!(error = %append_err, "failed to re-append task, unloading task list");
                    let _ = self.fatal_tx.send(());
                    return Err(());
                }
            }
        }
        let ack_level = self.ack.complete_task(outcome.info.task_id);
        self.gc.run(ack_level).await;
        Ok(())
    }

    async fn persist_ack_level(&self) -> Result<(), ()> {
        let ack_level = self.ack.ack_level();
        let result = retry::retry(&RetryPolicy::persistence(), StoreError::is_transient, || {
            self.db.update_state(ack_level)
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_condition_failed() => {
                warn!(error = %err, "ack level flush lost the lease, unloading task list");
                let _ = self.fatal_tx.send(());
                Err(())
            }
            Err(err) => {
                warn!(error = %err, "ack level flush failed, will retry");
                Ok(())
            }
        }
    }
}
