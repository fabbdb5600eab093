//! Relaying of unmatched tasks and idle polls from a child partition to its
//! parent, so a partitioned task list behaves like one logical queue even
//! when producers and pollers land on different partitions.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::api::{
    AddActivityTaskRequest, AddDecisionTaskRequest, AddTaskResponse, PollForActivityTaskResponse,
    PollForDecisionTaskResponse, PollRequest, QueryWorkflowRequest, QueryWorkflowResponse,
    TaskList,
};
use crate::engine::EngineError;
use crate::metrics::Metrics;
use crate::settings::MatchingConfig;
use crate::task::{InternalTask, TaskInfo};
use crate::tasklist::{TaskListId, TaskListKind, TaskListType};

/// Client for a peer partition of the same logical task list. In production
/// this is an RPC stub; the engine also implements it directly for
/// same-process partition trees.
#[async_trait]
pub trait MatchingClient: Send + Sync {
    async fn add_activity_task(
        &self,
        request: AddActivityTaskRequest,
    ) -> Result<AddTaskResponse, EngineError>;

    async fn add_decision_task(
        &self,
        request: AddDecisionTaskRequest,
    ) -> Result<AddTaskResponse, EngineError>;

    async fn poll_for_activity_task(
        &self,
        request: PollRequest,
    ) -> Result<PollForActivityTaskResponse, EngineError>;

    async fn poll_for_decision_task(
        &self,
        request: PollRequest,
    ) -> Result<PollForDecisionTaskResponse, EngineError>;

    async fn query_workflow(
        &self,
        request: QueryWorkflowRequest,
    ) -> Result<QueryWorkflowResponse, EngineError>;
}

#[derive(Debug, Error)]
pub enum ForwardError {
    /// All forwarding capacity is in flight; try again later.
    #[error("forwarder out of capacity")]
    SlowDown,
    /// The task already crossed one partition hop and must not cross another.
    #[error("task was already forwarded")]
    AlreadyForwarded,
    #[error("task cannot be forwarded")]
    NotForwardable,
    #[error("forward failed: {0}")]
    Remote(#[from] EngineError),
}

pub struct Forwarder {
    id: TaskListId,
    parent: TaskListId,
    client: Arc<dyn MatchingClient>,
    task_slots: Semaphore,
    poll_slots: Semaphore,
    metrics: Metrics,
}

impl Forwarder {
    /// Build a forwarder for a task list, or None when forwarding is not
    /// allowed: root partitions have nowhere to go and sticky lists are
    /// pinned to one worker.
    pub fn new(
        config: &MatchingConfig,
        id: &TaskListId,
        client: Arc<dyn MatchingClient>,
        metrics: Metrics,
    ) -> Option<Self> {
        if id.kind == TaskListKind::Sticky {
            return None;
        }
        let parent = id.parent(config.forwarder_max_children)?;
        Some(Self {
            id: id.clone(),
            parent,
            client,
            task_slots: Semaphore::new(config.forwarder_max_outstanding_tasks),
            poll_slots: Semaphore::new(config.forwarder_max_outstanding_polls),
            metrics,
        })
    }

    fn parent_task_list(&self) -> TaskList {
        TaskList {
            name: self.parent.name.clone(),
            kind: self.parent.kind,
        }
    }

    /// Relay an unmatched task to the parent partition.
    pub async fn forward_task(&self, task: &InternalTask) -> Result<(), ForwardError> {
        if task.forwarded_from.is_some() {
            return Err(ForwardError::AlreadyForwarded);
        }
        let info = task.info().ok_or(ForwardError::NotForwardable)?;
        let _permit = self
            .task_slots
            .try_acquire()
            .map_err(|_| ForwardError::SlowDown)?;
        match self.id.task_type {
            TaskListType::Activity => {
                self.client
                    .add_activity_task(AddActivityTaskRequest {
                        domain_id: info.domain_id.clone(),
                        task_list: self.parent_task_list(),
                        execution: crate::api::WorkflowExecution {
                            workflow_id: info.workflow_id.clone(),
                            run_id: info.run_id.clone(),
                        },
                        schedule_id: info.schedule_id,
                        schedule_to_start_timeout: None,
                        forwarded_from: Some(self.id.name.clone()),
                    })
                    .await?;
            }
            TaskListType::Decision => {
                self.client
                    .add_decision_task(AddDecisionTaskRequest {
                        domain_id: info.domain_id.clone(),
                        task_list: self.parent_task_list(),
                        execution: crate::api::WorkflowExecution {
                            workflow_id: info.workflow_id.clone(),
                            run_id: info.run_id.clone(),
                        },
                        schedule_id: info.schedule_id,
                        schedule_to_start_timeout: None,
                        forwarded_from: Some(self.id.name.clone()),
                    })
                    .await?;
            }
        }
        self.metrics.record_forwarded(&self.id.name, "task");
        Ok(())
    }

    /// Relay a query to the parent partition and return its answer.
    pub async fn forward_query(
        &self,
        task: &InternalTask,
    ) -> Result<QueryWorkflowResponse, ForwardError> {
        if task.forwarded_from.is_some() {
            return Err(ForwardError::AlreadyForwarded);
        }
        let query = task.query().ok_or(ForwardError::NotForwardable)?;
        let _permit = self
            .task_slots
            .try_acquire()
            .map_err(|_| ForwardError::SlowDown)?;
        let response = self
            .client
            .query_workflow(QueryWorkflowRequest {
                domain_id: query.request.domain_id.clone(),
                task_list: self.parent_task_list(),
                execution: query.request.execution.clone(),
                query_type: query.request.query_type.clone(),
                query_args: query.request.query_args.clone(),
                forwarded_from: Some(self.id.name.clone()),
            })
            .await?;
        self.metrics.record_forwarded(&self.id.name, "query");
        Ok(response)
    }

    /// Issue one long poll upstream on behalf of a locally idle poller.
    /// Returns None when the parent also had no work.
    pub async fn forward_poll(&self) -> Result<Option<InternalTask>, ForwardError> {
        let _permit = self
            .poll_slots
            .try_acquire()
            .map_err(|_| ForwardError::SlowDown)?;
        let request = PollRequest {
            domain_id: self.id.domain_id.clone(),
            task_list: self.parent_task_list(),
            identity: format!("forwarder:{}", self.id.name),
            poller_id: None,
            max_tasks_per_second: None,
            timeout: None,
            forwarded_from: Some(self.id.name.clone()),
        };
        self.metrics.record_forwarded(&self.id.name, "poll");
        match self.id.task_type {
            TaskListType::Activity => {
                let response = self.client.poll_for_activity_task(request).await?;
                let Some(execution) = response.workflow_execution else {
                    return Ok(None);
                };
                let info = TaskInfo::new(
                    self.id.domain_id.clone(),
                    execution.workflow_id,
                    execution.run_id,
                    response.schedule_id,
                    response.task_id,
                    None,
                );
                Ok(Some(InternalTask::new_forwarded(
                    info,
                    self.parent.name.clone(),
                )))
            }
            TaskListType::Decision => {
                let response = self.client.poll_for_decision_task(request).await?;
                if let (Some(query), Some(task_id)) = (&response.query, &response.query_task_id) {
                    let task = InternalTask::new_forwarded_query(
                        task_id.clone(),
                        QueryWorkflowRequest {
                            domain_id: self.id.domain_id.clone(),
                            task_list: self.parent_task_list(),
                            // Query tasks travel without their execution; the
                            // upstream registry keeps the real binding.
                            execution: response
                                .workflow_execution
                                .clone()
                                .unwrap_or(crate::api::WorkflowExecution {
                                    workflow_id: String::new(),
                                    run_id: String::new(),
                                }),
                            query_type: query.query_type.clone(),
                            query_args: query.query_args.clone(),
                            forwarded_from: Some(self.id.name.clone()),
                        },
                        self.parent.name.clone(),
                    );
                    return Ok(Some(task));
                }
                let Some(execution) = response.workflow_execution else {
                    return Ok(None);
                };
                let info = TaskInfo::new(
                    self.id.domain_id.clone(),
                    execution.workflow_id,
                    execution.run_id,
                    response.schedule_id,
                    response.task_id,
                    None,
                );
                Ok(Some(InternalTask::new_forwarded(
                    info,
                    self.parent.name.clone(),
                )))
            }
        }
    }
}
