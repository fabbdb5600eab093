//! Request and response types of the public matching surface. Wire transport
//! and schema live outside this crate; peers and frontends exchange these
//! shapes through whatever RPC layer hosts the engine.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use thiserror::Error;

use crate::tasklist::{TaskIdBlock, TaskListKind, TaskListType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskList {
    pub name: String,
    pub kind: TaskListKind,
}

impl TaskList {
    pub fn normal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskListKind::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

#[derive(Debug, Clone)]
pub struct AddActivityTaskRequest {
    pub domain_id: String,
    pub task_list: TaskList,
    pub execution: WorkflowExecution,
    pub schedule_id: i64,
    pub schedule_to_start_timeout: Option<Duration>,
    pub forwarded_from: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AddDecisionTaskRequest {
    pub domain_id: String,
    pub task_list: TaskList,
    pub execution: WorkflowExecution,
    pub schedule_id: i64,
    pub schedule_to_start_timeout: Option<Duration>,
    pub forwarded_from: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AddInMemoryDecisionTaskRequest {
    pub domain_id: String,
    pub task_list: TaskList,
    pub execution: WorkflowExecution,
    pub schedule_id: i64,
    pub forwarded_from: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AddTaskResponse {
    /// True when the task was handed to a waiting poller without touching
    /// persistence.
    pub sync_matched: bool,
}

#[derive(Debug, Clone)]
pub struct PollRequest {
    pub domain_id: String,
    pub task_list: TaskList,
    pub identity: String,
    pub poller_id: Option<String>,
    pub max_tasks_per_second: Option<f64>,
    /// Caller budget for the long poll; bounded by the configured expiration.
    pub timeout: Option<Duration>,
    pub forwarded_from: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PollForActivityTaskResponse {
    pub workflow_execution: Option<WorkflowExecution>,
    pub schedule_id: i64,
    pub task_id: i64,
    pub domain_name: String,
    pub backlog_count_hint: i64,
}

impl PollForActivityTaskResponse {
    /// An empty response is how a long-poll timeout is reported.
    pub fn is_empty(&self) -> bool {
        self.workflow_execution.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PollForDecisionTaskResponse {
    pub workflow_execution: Option<WorkflowExecution>,
    pub schedule_id: i64,
    pub task_id: i64,
    pub domain_name: String,
    pub backlog_count_hint: i64,
    /// Set when this decision task carries a query instead of persisted work.
    pub query: Option<QueryInput>,
    pub query_task_id: Option<String>,
    /// Buffered queries for the same workflow riding along with this decision
    /// task, keyed by query task ID. Answered individually through
    /// respond_query_task_completed.
    pub queries: HashMap<String, QueryInput>,
}

impl PollForDecisionTaskResponse {
    pub fn is_empty(&self) -> bool {
        self.workflow_execution.is_none() && self.query.is_none()
    }
}

/// A user query as handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryInput {
    pub query_type: String,
    pub query_args: Bytes,
}

#[derive(Debug, Clone)]
pub struct QueryWorkflowRequest {
    pub domain_id: String,
    pub task_list: TaskList,
    pub execution: WorkflowExecution,
    pub query_type: String,
    pub query_args: Bytes,
    pub forwarded_from: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryWorkflowResponse {
    pub query_result: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTaskCompletedType {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RespondQueryTaskCompletedRequest {
    pub task_id: String,
    pub completed_type: QueryTaskCompletedType,
    pub query_result: Bytes,
    pub error_message: String,
}

#[derive(Debug, Clone)]
pub struct CancelOutstandingPollRequest {
    pub domain_id: String,
    pub task_list: TaskList,
    pub task_list_type: TaskListType,
    pub poller_id: String,
}

#[derive(Debug, Clone)]
pub struct DescribeTaskListRequest {
    pub domain_id: String,
    pub task_list: TaskList,
    pub task_list_type: TaskListType,
    pub include_task_list_status: bool,
}

#[derive(Debug, Clone)]
pub struct DescribeTaskListResponse {
    pub pollers: Vec<PollerInfo>,
    pub status: Option<TaskListStatus>,
}

#[derive(Debug, Clone)]
pub struct PollerInfo {
    pub identity: String,
    pub last_access_time: SystemTime,
    pub rate_per_second: f64,
}

#[derive(Debug, Clone)]
pub struct TaskListStatus {
    pub read_level: i64,
    pub ack_level: i64,
    pub backlog_count_hint: i64,
    pub rate_per_second: f64,
    pub task_id_block: TaskIdBlock,
}

/// Query could not be answered: no worker polled in time, or the worker
/// reported a failure. Forwarded instances are surfaced verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct QueryFailedError {
    pub message: String,
}

impl QueryFailedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
