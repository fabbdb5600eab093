//! Task data as it moves through the matching core: the persisted record and
//! the transient wrapper that carries a task from a producer or the backlog
//! pump to a poller.

use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::api::{QueryFailedError, QueryWorkflowRequest};

/// Persisted task record. `task_id` is allocated by the writer from the
/// current range block and is strictly monotonic per task list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub schedule_id: i64,
    pub task_id: i64,
    pub expiry: Option<SystemTime>,
    pub created: SystemTime,
}

impl TaskInfo {
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        schedule_id: i64,
        task_id: i64,
        expiry: Option<SystemTime>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            schedule_id,
            task_id,
            expiry,
            created: SystemTime::now(),
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.expiry {
            Some(expiry) => expiry <= now,
            None => false,
        }
    }
}

/// Why a delivered task did not complete.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("poller abandoned the task before completing it")]
    PollerLost,
    #[error("task dispatch failed: {0}")]
    Failed(String),
}

pub type DispatchResult = Result<(), DispatchError>;

/// Response to a dispatched query task, produced by
/// `respond_query_task_completed` or a forwarding peer.
pub type QueryResponse = Result<bytes::Bytes, QueryFailedError>;

/// Outcome report for a backlog task, drained by the task reader.
#[derive(Debug)]
pub struct TaskOutcome {
    pub info: TaskInfo,
    pub result: DispatchResult,
}

/// A query riding the decision-task rendezvous.
#[derive(Debug, Clone)]
pub struct QueryTask {
    pub task_id: String,
    pub request: QueryWorkflowRequest,
}

enum Completion {
    /// Producer is blocked in offer; resolves when the poller side finishes.
    SyncMatch(oneshot::Sender<DispatchResult>),
    /// Reader owns the receiving end; failures are re-appended.
    Backlog(mpsc::UnboundedSender<TaskOutcome>),
}

/// Transient wrapper around a task between production and delivery. Dropping
/// an unfinished task reports the loss, so a task can never silently vanish
/// between the rendezvous and the poller.
pub struct InternalTask {
    info: Option<TaskInfo>,
    query: Option<QueryTask>,
    pub domain_name: String,
    pub forwarded_from: Option<String>,
    pub backlog_count_hint: i64,
    completion: Option<Completion>,
    sync_response_rx: Option<oneshot::Receiver<DispatchResult>>,
    query_response_rx: Option<oneshot::Receiver<QueryResponse>>,
}

impl InternalTask {
    /// Task a producer offers for synchronous handoff. The matcher holds the
    /// response side until a poller finishes the task.
    pub fn new_sync_match(info: TaskInfo, forwarded_from: Option<String>) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            info: Some(info),
            query: None,
            domain_name: String::new(),
            forwarded_from,
            backlog_count_hint: 0,
            completion: Some(Completion::SyncMatch(tx)),
            sync_response_rx: Some(rx),
            query_response_rx: None,
        }
    }

    /// Backlog task pumped out of the store by the reader.
    pub fn new_backlog(info: TaskInfo, outcomes: mpsc::UnboundedSender<TaskOutcome>) -> Self {
        Self {
            info: Some(info),
            query: None,
            domain_name: String::new(),
            forwarded_from: None,
            backlog_count_hint: 0,
            completion: Some(Completion::Backlog(outcomes)),
            sync_response_rx: None,
            query_response_rx: None,
        }
    }

    /// Task received from a forwarding peer; its bookkeeping lives upstream.
    pub fn new_forwarded(info: TaskInfo, forwarded_from: String) -> Self {
        Self {
            info: Some(info),
            query: None,
            domain_name: String::new(),
            forwarded_from: Some(forwarded_from),
            backlog_count_hint: 0,
            completion: None,
            sync_response_rx: None,
            query_response_rx: None,
        }
    }

    /// Query task received from a forwarding peer. The answer travels back
    /// through the peer that issued the query task ID.
    pub fn new_forwarded_query(
        task_id: String,
        request: QueryWorkflowRequest,
        forwarded_from: String,
    ) -> Self {
        Self {
            info: None,
            query: Some(QueryTask { task_id, request }),
            domain_name: String::new(),
            forwarded_from: Some(forwarded_from),
            backlog_count_hint: 0,
            completion: None,
            sync_response_rx: None,
            query_response_rx: None,
        }
    }

    /// Query task. Returns the response sender the engine registers under the
    /// query task ID; the matcher awaits the receiving side.
    pub fn new_query(
        task_id: String,
        request: QueryWorkflowRequest,
        forwarded_from: Option<String>,
    ) -> (Self, oneshot::Sender<QueryResponse>) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            info: None,
            query: Some(QueryTask { task_id, request }),
            domain_name: String::new(),
            forwarded_from,
            backlog_count_hint: 0,
            completion: None,
            sync_response_rx: None,
            query_response_rx: Some(rx),
        };
        (task, tx)
    }

    pub fn is_query(&self) -> bool {
        self.query.is_some()
    }

    pub fn info(&self) -> Option<&TaskInfo> {
        self.info.as_ref()
    }

    pub fn query(&self) -> Option<&QueryTask> {
        self.query.as_ref()
    }

    pub(crate) fn take_sync_response(&mut self) -> Option<oneshot::Receiver<DispatchResult>> {
        self.sync_response_rx.take()
    }

    pub(crate) fn take_query_response(&mut self) -> Option<oneshot::Receiver<QueryResponse>> {
        self.query_response_rx.take()
    }

    /// Report the dispatch outcome. A sync-match producer unblocks with the
    /// result; a backlog outcome flows to the reader, which acks or
    /// re-appends. Subsequent calls are no-ops.
    pub fn finish(&mut self, result: DispatchResult) {
        let Some(completion) = self.completion.take() else {
            return;
        };
        match completion {
            Completion::SyncMatch(tx) => {
                let _ = tx.send(result);
            }
            Completion::Backlog(tx) => {
                if let Some(info) = self.info.clone() {
                    let _ = tx.send(TaskOutcome { info, result });
                }
            }
        }
    }
}

impl Drop for InternalTask {
    fn drop(&mut self) {
        self.finish(Err(DispatchError::PollerLost));
    }
}

impl std::fmt::Debug for InternalTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalTask")
            .field("info", &self.info)
            .field("query", &self.query.as_ref().map(|q| &q.task_id))
            .field("forwarded_from", &self.forwarded_from)
            .finish()
    }
}
