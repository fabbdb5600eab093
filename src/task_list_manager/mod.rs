//! Task list manager - the in-memory owner of one task list.
//!
//! Composes the pieces of the matching pipeline, split across submodules:
//!
//! - `db`: store access under the cached range lease
//! - `writer`: serialized appends and task-ID allocation
//! - `reader`: backlog pump and completion tracking
//! - `gc`: batched deletion of acked ranges

mod db;
mod gc;
mod reader;
mod writer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::ack_manager::AckManager;
use crate::api::{DescribeTaskListResponse, QueryFailedError, TaskListStatus, WorkflowExecution};
use crate::checks::{self, BacklogScanReport};
use crate::domain::DomainCache;
use crate::forwarder::{Forwarder, MatchingClient};
use crate::matcher::{MatchError, TaskMatcher};
use crate::metrics::Metrics;
use crate::poller_history::PollerHistory;
use crate::rate_limiter::RateLimiter;
use crate::retry::{self, RetryPolicy};
use crate::settings::MatchingConfig;
use crate::store::{StoreError, TaskStore};
use crate::task::{InternalTask, TaskInfo};
use crate::tasklist::{TaskIdBlock, TaskListId};

use self::db::TaskListDb;
use self::gc::TaskGc;
use self::reader::{ReaderDeps, TaskReader};
use self::writer::TaskWriter;

/// Producer-side parameters for adding a task.
#[derive(Debug, Clone)]
pub struct AddTaskParams {
    pub execution: WorkflowExecution,
    pub schedule_id: i64,
    pub schedule_to_start_timeout: Option<Duration>,
    pub forwarded_from: Option<String>,
}

/// Poller-side parameters for a long poll.
#[derive(Debug, Clone, Default)]
pub struct PollParams {
    pub identity: String,
    pub poller_id: Option<String>,
    pub max_tasks_per_second: Option<f64>,
    pub timeout: Option<Duration>,
}

/// In-memory owner of a single task list: holds the range lease, runs the
/// writer/reader/gc pipeline, and fronts the matcher.
pub struct TaskListManager {
    id: TaskListId,
    config: Arc<MatchingConfig>,
    db: Arc<TaskListDb>,
    ack: Arc<AckManager>,
    matcher: Arc<TaskMatcher>,
    writer: Arc<TaskWriter>,
    reader: TaskReader,
    gc: Arc<TaskGc>,
    domain_cache: Arc<dyn DomainCache>,
    poller_history: PollerHistory,
    metrics: Metrics,
    outstanding_polls: Mutex<HashMap<String, oneshot::Sender<()>>>,
    shutdown: broadcast::Sender<()>,
    fatal_tx: mpsc::UnboundedSender<()>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    stopped: AtomicBool,
    on_unload: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    last_activity: Mutex<Instant>,
}

impl TaskListManager {
    pub fn new(
        id: TaskListId,
        store: Arc<dyn TaskStore>,
        domain_cache: Arc<dyn DomainCache>,
        client: Option<Arc<dyn MatchingClient>>,
        config: Arc<MatchingConfig>,
        metrics: Metrics,
    ) -> Arc<Self> {
        let db = Arc::new(TaskListDb::new(store, id.clone()));
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);

        let limiter = Arc::new(RateLimiter::new(config.dispatch_rps_ceiling()));
        let fwdr =
            client.and_then(|client| Forwarder::new(&config, &id, client, metrics.clone()));
        let matcher = Arc::new(TaskMatcher::new(
            limiter,
            fwdr,
            config.forwarder_retry_interval(),
        ));

        let writer = Arc::new(TaskWriter::new(db.clone(), config.clone(), fatal_tx.clone()));
        let gc = Arc::new(TaskGc::new(db.clone(), config.clone(), metrics.clone()));
        let reader = TaskReader::new();

        let ack = Arc::new(AckManager::new());
        Arc::new(Self {
            id,
            config,
            db,
            ack,
            matcher,
            writer,
            reader,
            gc,
            domain_cache,
            poller_history: PollerHistory::new(),
            metrics,
            outstanding_polls: Mutex::new(HashMap::new()),
            shutdown,
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            stopped: AtomicBool::new(false),
            on_unload: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    /// Register the engine callback run exactly once when this manager
    /// unloads.
    pub fn set_on_unload(&self, callback: Box<dyn FnOnce() + Send>) {
        *self.on_unload.lock().unwrap() = Some(callback);
    }

    pub fn id(&self) -> &TaskListId {
        &self.id
    }

    /// Renew the lease, prime the ack manager from persisted state, and start
    /// the pipeline. A manager that fails to start unloads itself.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        let state = match self.renew_lease_with_retry().await {
            Ok(state) => state,
            Err(err) => {
                self.stop();
                return Err(err);
            }
        };
        self.ack.set_ack_level(state.ack_level);
        let block = TaskIdBlock::for_range(state.range_id, self.config.range_size);
        self.writer.start(block, self.shutdown.subscribe());

        self.reader.start(
            ReaderDeps {
                db: self.db.clone(),
                ack: self.ack.clone(),
                matcher: self.matcher.clone(),
                writer: self.writer.clone(),
                gc: self.gc.clone(),
                config: self.config.clone(),
                fatal_tx: self.fatal_tx.clone(),
            },
            self.shutdown.clone(),
        );

        self.spawn_fatal_supervisor();
        self.spawn_idle_watcher();
        info!(task_list = %self.id, range_id = state.range_id, "task list manager started");
        Ok(())
    }

    /// Idempotent teardown: stops the pipeline, cancels pollers, and removes
    /// this manager from the engine.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        let mut polls = self.outstanding_polls.lock().unwrap();
        for (_, cancel) in polls.drain() {
            let _ = cancel.send(());
        }
        drop(polls);
        if let Some(callback) = self.on_unload.lock().unwrap().take() {
            callback();
        }
        info!(task_list = %self.id, "task list manager stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Add a task: sync match first, persistence on miss. Returns whether the
    /// task was matched synchronously.
    pub async fn add_task(&self, params: AddTaskParams) -> Result<bool, StoreError> {
        self.touch();
        if self.is_stopped() {
            // A stopped manager no longer owns its lease; the engine reloads
            // a fresh one on this error.
            return Err(StoreError::ConditionFailed(
                "task list manager is stopped".into(),
            ));
        }

        let expiry = params
            .schedule_to_start_timeout
            .map(|timeout| SystemTime::now() + timeout);
        let info = TaskInfo {
            domain_id: self.id.domain_id.clone(),
            workflow_id: params.execution.workflow_id.clone(),
            run_id: params.execution.run_id.clone(),
            schedule_id: params.schedule_id,
            task_id: 0,
            expiry,
            created: SystemTime::now(),
        };

        if self.domain_cache.is_active(&self.id.domain_id) {
            let task = InternalTask::new_sync_match(info.clone(), params.forwarded_from.clone());
            if self
                .matcher
                .offer(task, self.config.sync_match_wait())
                .await
            {
                self.metrics.record_task_added(&self.id.name, true);
                return Ok(true);
            }
        }

        match self.writer.append(info).await {
            Ok(task_id) => {
                debug!(task_list = %self.id, task_id, "task persisted");
                self.metrics.record_task_added(&self.id.name, false);
                self.reader.signal();
                Ok(false)
            }
            Err(err) => {
                if err.is_condition_failed() {
                    self.metrics.record_condition_failure();
                    self.stop();
                }
                Err(err)
            }
        }
    }

    /// Sync-match-only path: hand the task to a waiting poller or fail.
    /// Nothing is ever persisted here, and exactly one poller can receive it.
    pub async fn add_in_memory_task(&self, params: AddTaskParams) -> Result<(), MatchError> {
        self.touch();
        let info = TaskInfo {
            domain_id: self.id.domain_id.clone(),
            workflow_id: params.execution.workflow_id.clone(),
            run_id: params.execution.run_id.clone(),
            schedule_id: params.schedule_id,
            task_id: 0,
            expiry: None,
            created: SystemTime::now(),
        };
        let task = InternalTask::new_sync_match(info, params.forwarded_from);
        if self
            .matcher
            .offer(task, self.config.sync_match_wait())
            .await
        {
            Ok(())
        } else {
            Err(MatchError::NoPoller)
        }
    }

    /// Long poll for a task. A timeout is reported as `None`, never as an
    /// error, so the caller can return an empty response quickly.
    pub async fn get_task(&self, params: PollParams) -> Option<InternalTask> {
        self.touch();
        if self.is_stopped() {
            return None;
        }

        // Leave tailroom under the caller's budget so the empty response can
        // travel back before the caller's own deadline fires.
        let mut wait = self.config.long_poll_expiration();
        if let Some(timeout) = params.timeout {
            let trimmed = timeout.saturating_sub(self.config.return_empty_task_budget());
            wait = wait.min(trimmed.max(Duration::from_millis(10)));
        }

        let cancel = params.poller_id.as_ref().map(|poller_id| {
            let (tx, rx) = oneshot::channel();
            self.outstanding_polls
                .lock()
                .unwrap()
                .insert(poller_id.clone(), tx);
            rx
        });

        self.poller_history
            .update(&params.identity, params.max_tasks_per_second);
        // One limiter for the whole task list; the latest poller's reported
        // rate wins.
        self.matcher.update_rate(params.max_tasks_per_second);

        let started = Instant::now();
        let task = if self.domain_cache.is_active(&self.id.domain_id) {
            self.matcher.poll(wait, cancel).await
        } else {
            self.matcher.poll_for_query(wait, cancel).await
        };

        if let Some(poller_id) = &params.poller_id {
            self.outstanding_polls.lock().unwrap().remove(poller_id);
        }
        self.metrics
            .record_poll_latency(&self.id.name, started.elapsed().as_secs_f64());

        match task {
            Some(mut task) => {
                task.domain_name = self.domain_cache.domain_name(&self.id.domain_id);
                task.backlog_count_hint = self.ack.backlog_count_hint();
                self.metrics
                    .set_backlog_hint(&self.id.name, task.backlog_count_hint);
                self.metrics.record_poll(
                    &self.id.name,
                    if task.is_query() { "query" } else { "task" },
                );
                Some(task)
            }
            None => {
                self.metrics.record_poll(&self.id.name, "empty");
                None
            }
        }
    }

    /// Bypass path for tasks forwarded in from a child partition: block until
    /// a poller takes the task. Never persists.
    pub async fn dispatch_task(&self, task: InternalTask) -> Result<(), MatchError> {
        self.touch();
        let mut shutdown = self.shutdown.subscribe();
        self.matcher.must_offer(task, &mut shutdown).await
    }

    /// Dispatch a query task and wait for its answer.
    pub async fn dispatch_query_task(
        &self,
        task: InternalTask,
        timeout: Duration,
    ) -> Result<Bytes, QueryFailedError> {
        self.touch();
        match self.matcher.offer_query(task, timeout).await {
            Ok(answer) => {
                self.metrics.record_query_task(&self.id.name, "answered");
                Ok(answer)
            }
            Err(MatchError::DeadlineExceeded) | Err(MatchError::NoPoller) => {
                self.metrics.record_query_task(&self.id.name, "timeout");
                Err(QueryFailedError::new(
                    "query timeout: no worker is polling for the task list",
                ))
            }
            // Forwarded failures carry the original message; pass it through
            // untouched.
            Err(MatchError::QueryFailed(failed)) => {
                self.metrics.record_query_task(&self.id.name, "failed");
                Err(failed)
            }
            Err(other) => {
                self.metrics.record_query_task(&self.id.name, "failed");
                Err(QueryFailedError::new(other.to_string()))
            }
        }
    }

    /// Cancel exactly the outstanding poll registered under this poller ID.
    pub fn cancel_poller(&self, poller_id: &str) {
        let cancel = self.outstanding_polls.lock().unwrap().remove(poller_id);
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
            debug!(task_list = %self.id, poller_id, "outstanding poll cancelled");
        }
    }

    /// Pollers seen recently, plus ack-manager and rate state when asked.
    pub fn describe(&self, include_status: bool) -> DescribeTaskListResponse {
        let mut response = DescribeTaskListResponse {
            pollers: self.poller_history.all(),
            status: None,
        };
        if include_status {
            response.status = Some(TaskListStatus {
                read_level: self.ack.read_level(),
                ack_level: self.ack.ack_level(),
                backlog_count_hint: self.ack.backlog_count_hint(),
                rate_per_second: self.matcher.rate(),
                task_id_block: TaskIdBlock::for_range(self.db.range_id(), self.config.range_size),
            });
        }
        response
    }

    /// Run the backlog integrity checks over a page of persisted tasks.
    pub async fn scan_backlog(&self) -> Result<BacklogScanReport, StoreError> {
        let read_level = self.ack.read_level();
        let page = self
            .db
            .get_tasks(0, i64::MAX, self.config.get_tasks_batch_size)
            .await?;
        Ok(checks::scan_backlog(
            &page,
            self.ack.ack_level(),
            read_level,
        ))
    }

    async fn renew_lease_with_retry(&self) -> Result<crate::store::TaskListState, StoreError> {
        self.metrics.record_lease_request();
        let result = retry::retry(&RetryPolicy::persistence(), StoreError::is_transient, || {
            self.db.renew_lease()
        })
        .await;
        if let Err(err) = &result {
            warn!(task_list = %self.id, error = %err, "lease renewal failed");
        }
        result
    }

    fn spawn_fatal_supervisor(self: &Arc<Self>) {
        let mut fatal_rx = self
            .fatal_rx
            .lock()
            .unwrap()
            .take()
            .expect("fatal supervisor already running");
        let weak: Weak<TaskListManager> = Arc::downgrade(self);
        tokio::spawn(async move {
            if fatal_rx.recv().await.is_some() {
                if let Some(manager) = weak.upgrade() {
                    manager.metrics.record_condition_failure();
                    manager.stop();
                }
            }
        });
    }

    fn spawn_idle_watcher(self: &Arc<Self>) {
        let weak: Weak<TaskListManager> = Arc::downgrade(self);
        let interval = self.config.idle_tasklist_check_interval();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.recv() => return,
                }
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                let idle_for = manager.last_activity.lock().unwrap().elapsed();
                if idle_for >= interval {
                    info!(task_list = %manager.id, "task list idle, unloading");
                    manager.stop();
                    return;
                }
            }
        });
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}
