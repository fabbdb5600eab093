//! Process-wide matching engine: routes the public surface to per-task-list
//! managers, creating them lazily and dropping them when they unload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::api::{
    AddActivityTaskRequest, AddDecisionTaskRequest, AddInMemoryDecisionTaskRequest,
    AddTaskResponse, CancelOutstandingPollRequest, DescribeTaskListRequest,
    DescribeTaskListResponse, PollForActivityTaskResponse, PollForDecisionTaskResponse,
    PollRequest, QueryFailedError, QueryInput, QueryTaskCompletedType, QueryWorkflowRequest,
    QueryWorkflowResponse, RespondQueryTaskCompletedRequest, TaskList, WorkflowExecution,
};
use crate::domain::DomainCache;
use crate::forwarder::MatchingClient;
use crate::metrics::Metrics;
use crate::query::{
    QueryEvent, QueryHandle, QueryLifecycle, QueryRegistry, QueryResult, QueryState,
};
use crate::settings::MatchingConfig;
use crate::store::{StoreError, TaskStore};
use crate::task::{InternalTask, QueryResponse};
use crate::task_list_manager::{AddTaskParams, PollParams, TaskListManager};
use crate::tasklist::{TaskListId, TaskListType};

#[derive(Debug, Error)]
pub enum EngineError {
    /// The system is shedding load; the caller should back off and retry.
    #[error("service busy: {0}")]
    ServiceBusy(String),

    #[error("entity not found: {0}")]
    EntityNotExists(String),

    #[error(transparent)]
    QueryFailed(#[from] QueryFailedError),

    #[error(transparent)]
    Store(StoreError),

    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Busy(message) => EngineError::ServiceBusy(message),
            other => EngineError::Store(other),
        }
    }
}

/// Identity of a workflow execution, keying its query registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WorkflowKey {
    domain_id: String,
    workflow_id: String,
    run_id: String,
}

/// A live query's state machine handle plus the workflow that owns it.
#[derive(Clone)]
struct QueryAttachment {
    handle: QueryHandle,
    workflow: WorkflowKey,
}

/// Registry of task-list managers plus the query-result rendezvous. One per
/// process; everything it hands out is internally synchronized.
pub struct MatchingEngine {
    store: Arc<dyn TaskStore>,
    domain_cache: Arc<dyn DomainCache>,
    config: Arc<MatchingConfig>,
    metrics: Metrics,
    client: Mutex<Option<Arc<dyn MatchingClient>>>,
    task_lists: Mutex<HashMap<TaskListId, Arc<TaskListManager>>>,
    // Serializes lazy creation so two callers racing on the same task list
    // produce one manager.
    create_lock: tokio::sync::Mutex<()>,
    query_results: Mutex<HashMap<String, oneshot::Sender<QueryResponse>>>,
    query_registries: Mutex<HashMap<WorkflowKey, Arc<QueryRegistry>>>,
    query_handles: Mutex<HashMap<String, QueryAttachment>>,
}

impl MatchingEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        domain_cache: Arc<dyn DomainCache>,
        config: Arc<MatchingConfig>,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            domain_cache,
            config,
            metrics,
            client: Mutex::new(None),
            task_lists: Mutex::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
            query_results: Mutex::new(HashMap::new()),
            query_registries: Mutex::new(HashMap::new()),
            query_handles: Mutex::new(HashMap::new()),
        })
    }

    /// Install the peer client used for partition forwarding. Managers pick
    /// it up on creation.
    pub fn set_matching_client(&self, client: Arc<dyn MatchingClient>) {
        *self.client.lock().unwrap() = Some(client);
    }

    /// Number of live managers; monitoring and tests.
    pub fn task_list_count(&self) -> usize {
        self.task_lists.lock().unwrap().len()
    }

    fn live_manager(&self, id: &TaskListId) -> Option<Arc<TaskListManager>> {
        let managers = self.task_lists.lock().unwrap();
        managers.get(id).filter(|m| !m.is_stopped()).cloned()
    }

    /// Get or lazily create the manager for a task list. A freshly created
    /// manager has renewed its lease before anyone can use it.
    async fn manager(
        self: &Arc<Self>,
        id: &TaskListId,
    ) -> Result<Arc<TaskListManager>, EngineError> {
        if let Some(manager) = self.live_manager(id) {
            return Ok(manager);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(manager) = self.live_manager(id) {
            return Ok(manager);
        }

        let client = self.client.lock().unwrap().clone();
        let manager = TaskListManager::new(
            id.clone(),
            self.store.clone(),
            self.domain_cache.clone(),
            client,
            self.config.clone(),
            self.metrics.clone(),
        );

        let engine: Weak<MatchingEngine> = Arc::downgrade(self);
        let unload_id = id.clone();
        let unload_manager = Arc::downgrade(&manager);
        manager.set_on_unload(Box::new(move || {
            if let Some(engine) = engine.upgrade() {
                let mut managers = engine.task_lists.lock().unwrap();
                // Only remove the exact manager that is unloading; a fresh
                // one may already have taken the slot.
                let matches = managers
                    .get(&unload_id)
                    .and_then(|current| unload_manager.upgrade().map(|m| Arc::ptr_eq(current, &m)))
                    .unwrap_or(false);
                if matches {
                    managers.remove(&unload_id);
                    debug!(task_list = %unload_id, "task list manager removed from engine");
                }
            }
        }));

        manager.start().await?;
        self.task_lists
            .lock()
            .unwrap()
            .insert(id.clone(), manager.clone());
        Ok(manager)
    }

    fn task_list_id(
        &self,
        domain_id: &str,
        task_list: &TaskList,
        task_type: TaskListType,
    ) -> TaskListId {
        TaskListId::new(domain_id, task_list.name.clone(), task_type, task_list.kind)
    }

    pub async fn add_activity_task(
        self: &Arc<Self>,
        request: AddActivityTaskRequest,
    ) -> Result<AddTaskResponse, EngineError> {
        let id = self.task_list_id(&request.domain_id, &request.task_list, TaskListType::Activity);
        self.add_task_on(
            id,
            AddTaskParams {
                execution: request.execution,
                schedule_id: request.schedule_id,
                schedule_to_start_timeout: request.schedule_to_start_timeout,
                forwarded_from: request.forwarded_from,
            },
        )
        .await
    }

    pub async fn add_decision_task(
        self: &Arc<Self>,
        request: AddDecisionTaskRequest,
    ) -> Result<AddTaskResponse, EngineError> {
        let id = self.task_list_id(&request.domain_id, &request.task_list, TaskListType::Decision);
        self.add_task_on(
            id,
            AddTaskParams {
                execution: request.execution,
                schedule_id: request.schedule_id,
                schedule_to_start_timeout: request.schedule_to_start_timeout,
                forwarded_from: request.forwarded_from,
            },
        )
        .await
    }

    /// Sync-match-only decision task; fails rather than persisting when no
    /// poller is waiting.
    pub async fn add_in_memory_decision_task(
        self: &Arc<Self>,
        request: AddInMemoryDecisionTaskRequest,
    ) -> Result<(), EngineError> {
        let id = self.task_list_id(&request.domain_id, &request.task_list, TaskListType::Decision);
        let manager = self.manager(&id).await?;
        manager
            .add_in_memory_task(AddTaskParams {
                execution: request.execution,
                schedule_id: request.schedule_id,
                schedule_to_start_timeout: None,
                forwarded_from: request.forwarded_from,
            })
            .await
            .map_err(|err| EngineError::Internal(err.to_string()))
    }

    async fn add_task_on(
        self: &Arc<Self>,
        id: TaskListId,
        params: AddTaskParams,
    ) -> Result<AddTaskResponse, EngineError> {
        // One retry after a lease-theft failure: the stale manager has
        // removed itself, so the second pass loads a fresh one.
        for attempt in 0..2 {
            let manager = self.manager(&id).await?;
            match manager.add_task(params.clone()).await {
                Ok(sync_matched) => return Ok(AddTaskResponse { sync_matched }),
                Err(err) if err.is_condition_failed() && attempt == 0 => {
                    debug!(task_list = %id, "add_task lost the lease, retrying on a fresh manager");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("add_task retry loop always returns")
    }

    pub async fn poll_for_activity_task(
        self: &Arc<Self>,
        request: PollRequest,
    ) -> Result<PollForActivityTaskResponse, EngineError> {
        let id = self.task_list_id(&request.domain_id, &request.task_list, TaskListType::Activity);
        let manager = self.manager(&id).await?;
        let task = manager
            .get_task(PollParams {
                identity: request.identity,
                poller_id: request.poller_id,
                max_tasks_per_second: request.max_tasks_per_second,
                timeout: request.timeout,
            })
            .await;
        let Some(mut task) = task else {
            return Ok(PollForActivityTaskResponse::default());
        };
        let info = task
            .info()
            .cloned()
            .ok_or_else(|| EngineError::Internal("activity poll received a query task".into()))?;
        let response = PollForActivityTaskResponse {
            workflow_execution: Some(WorkflowExecution {
                workflow_id: info.workflow_id,
                run_id: info.run_id,
            }),
            schedule_id: info.schedule_id,
            task_id: info.task_id,
            domain_name: task.domain_name.clone(),
            backlog_count_hint: task.backlog_count_hint,
        };
        task.finish(Ok(()));
        Ok(response)
    }

    pub async fn poll_for_decision_task(
        self: &Arc<Self>,
        request: PollRequest,
    ) -> Result<PollForDecisionTaskResponse, EngineError> {
        let id = self.task_list_id(&request.domain_id, &request.task_list, TaskListType::Decision);
        let manager = self.manager(&id).await?;
        let task = manager
            .get_task(PollParams {
                identity: request.identity,
                poller_id: request.poller_id,
                max_tasks_per_second: request.max_tasks_per_second,
                timeout: request.timeout,
            })
            .await;
        let Some(mut task) = task else {
            return Ok(PollForDecisionTaskResponse::default());
        };

        if let Some(query) = task.query() {
            // The decision task carrying this query has started; every
            // buffered query for the workflow moves to the started state.
            self.start_buffered_queries(&query.task_id);
            return Ok(PollForDecisionTaskResponse {
                workflow_execution: None,
                schedule_id: 0,
                task_id: 0,
                domain_name: task.domain_name.clone(),
                backlog_count_hint: task.backlog_count_hint,
                query: Some(QueryInput {
                    query_type: query.request.query_type.clone(),
                    query_args: query.request.query_args.clone(),
                }),
                query_task_id: Some(query.task_id.clone()),
                queries: HashMap::new(),
            });
        }

        let info = task
            .info()
            .cloned()
            .ok_or_else(|| EngineError::Internal("decision task carries no payload".into()))?;
        let queries =
            self.start_workflow_queries(&request.domain_id, &info.workflow_id, &info.run_id);
        let response = PollForDecisionTaskResponse {
            workflow_execution: Some(WorkflowExecution {
                workflow_id: info.workflow_id,
                run_id: info.run_id,
            }),
            schedule_id: info.schedule_id,
            task_id: info.task_id,
            domain_name: task.domain_name.clone(),
            backlog_count_hint: task.backlog_count_hint,
            query: None,
            query_task_id: None,
            queries,
        };
        task.finish(Ok(()));
        Ok(response)
    }

    /// Start the buffered queries of the workflow a dispatched query task
    /// belongs to. A task without a local attachment was forwarded in from a
    /// peer; its registry lives upstream.
    fn start_buffered_queries(&self, task_id: &str) {
        let attachment = self.query_handles.lock().unwrap().get(task_id).cloned();
        let Some(attachment) = attachment else {
            return;
        };
        let registry = self
            .query_registries
            .lock()
            .unwrap()
            .get(&attachment.workflow)
            .cloned();
        if let Some(registry) = registry {
            if let Err(err) = registry.start_buffered() {
                debug!(task_id, error = %err, "buffered queries could not start");
            }
        }
    }

    /// Buffered queries for a workflow ride along in its next decision task;
    /// returns their inputs keyed by query task ID.
    fn start_workflow_queries(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> HashMap<String, QueryInput> {
        let key = WorkflowKey {
            domain_id: domain_id.to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
        };
        let registry = self.query_registries.lock().unwrap().get(&key).cloned();
        let Some(registry) = registry else {
            return HashMap::new();
        };
        match registry.start_buffered() {
            Ok(inputs) => inputs
                .into_iter()
                .map(|(id, input)| (id.to_string(), input))
                .collect(),
            Err(err) => {
                debug!(workflow_id, error = %err, "buffered queries could not start");
                HashMap::new()
            }
        }
    }

    /// Dispatch a query through the decision-task rendezvous and wait for the
    /// worker's answer. The query lives in the owning workflow's registry for
    /// its whole life; the answer is released only once the state machine
    /// reaches Completed.
    pub async fn query_workflow(
        self: &Arc<Self>,
        request: QueryWorkflowRequest,
    ) -> Result<QueryWorkflowResponse, EngineError> {
        let id = self.task_list_id(&request.domain_id, &request.task_list, TaskListType::Decision);
        let manager = self.manager(&id).await?;

        let workflow = WorkflowKey {
            domain_id: request.domain_id.clone(),
            workflow_id: request.execution.workflow_id.clone(),
            run_id: request.execution.run_id.clone(),
        };
        let registry = self.registry_for(&workflow);
        let handle = registry.buffer_query(QueryInput {
            query_type: request.query_type.clone(),
            query_args: request.query_args.clone(),
        });
        // The TTL matches the dispatch window; an undelivered or unanswered
        // query expires out of the registry on its own.
        let _lifecycle = QueryLifecycle::new(handle.clone(), self.config.long_poll_expiration());

        let task_id = handle.id().to_string();
        let gate = handle.clone();
        let forwarded_from = request.forwarded_from.clone();
        let (task, response_tx) =
            InternalTask::new_query(task_id.clone(), request.clone(), forwarded_from);
        self.query_results
            .lock()
            .unwrap()
            .insert(task_id.clone(), response_tx);
        self.query_handles.lock().unwrap().insert(
            task_id.clone(),
            QueryAttachment {
                handle,
                workflow: workflow.clone(),
            },
        );

        let result = manager
            .dispatch_query_task(task, self.config.long_poll_expiration())
            .await;

        self.query_results.lock().unwrap().remove(&task_id);
        self.query_handles.lock().unwrap().remove(&task_id);
        // The dispatch outcome is final for this query: expire whatever is
        // not already terminal (answered upstream, or timed out) so the
        // registry drains now instead of at the ttl.
        let _ = gate.apply(QueryEvent::Expire);
        self.prune_registry(&workflow);

        match result {
            Ok(answer) => Ok(QueryWorkflowResponse {
                query_result: answer,
            }),
            Err(failed) => Err(EngineError::QueryFailed(failed)),
        }
    }

    /// Worker-side completion of a dispatched query task. Records the result
    /// and the persistence condition on the query's state machine; the
    /// waiting producer sees the answer only after the query is Completed.
    pub fn respond_query_task_completed(
        &self,
        request: RespondQueryTaskCompletedRequest,
    ) -> Result<(), EngineError> {
        let attachment = self
            .query_handles
            .lock()
            .unwrap()
            .get(&request.task_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::EntityNotExists(format!("query task {}", request.task_id))
            })?;

        let result = match request.completed_type {
            QueryTaskCompletedType::Completed => {
                QueryResult::Answered(request.query_result.clone())
            }
            QueryTaskCompletedType::Failed => QueryResult::Failed {
                reason: request.error_message.clone(),
            },
        };
        if let Err(err) = attachment.handle.apply(QueryEvent::RecordResult(result)) {
            // A response landing after the query expired looks the same to
            // the worker as an unknown task.
            if attachment.handle.state().is_terminal() {
                self.query_handles.lock().unwrap().remove(&request.task_id);
                return Err(EngineError::EntityNotExists(format!(
                    "query task {}",
                    request.task_id
                )));
            }
            return Err(EngineError::Internal(err.to_string()));
        }
        // The query dispatch path itself persists nothing; the dependent
        // events live with the history service that called in here, so the
        // condition is applied as an explicit event once the result lands.
        attachment
            .handle
            .apply(QueryEvent::PersistenceConditionSatisfied)
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        if attachment.handle.state() != QueryState::Completed {
            return Err(EngineError::Internal(
                "query result recorded before the query task was started".into(),
            ));
        }

        self.query_handles.lock().unwrap().remove(&request.task_id);
        let sender = self
            .query_results
            .lock()
            .unwrap()
            .remove(&request.task_id)
            .ok_or_else(|| {
                EngineError::EntityNotExists(format!("query task {}", request.task_id))
            })?;
        let response: QueryResponse = match attachment.handle.result() {
            Some(QueryResult::Answered(answer)) => Ok(answer),
            Some(QueryResult::Failed { reason }) => Err(QueryFailedError::new(reason)),
            None => Err(QueryFailedError::new("query completed without a result")),
        };
        let _ = sender.send(response);
        self.prune_registry(&attachment.workflow);
        Ok(())
    }

    /// Outstanding queries across all workflows; monitoring and tests.
    pub fn live_query_count(&self) -> usize {
        let registries = self.query_registries.lock().unwrap();
        registries
            .values()
            .map(|registry| registry.buffered_count() + registry.started_count())
            .sum()
    }

    fn registry_for(&self, workflow: &WorkflowKey) -> Arc<QueryRegistry> {
        self.query_registries
            .lock()
            .unwrap()
            .entry(workflow.clone())
            .or_insert_with(|| Arc::new(QueryRegistry::new()))
            .clone()
    }

    /// Drop a workflow's registry once it holds no live queries.
    fn prune_registry(&self, workflow: &WorkflowKey) {
        let mut registries = self.query_registries.lock().unwrap();
        let empty = registries
            .get(workflow)
            .map(|registry| registry.buffered_count() == 0 && registry.started_count() == 0)
            .unwrap_or(false);
        if empty {
            registries.remove(workflow);
        }
    }

    /// Cancel the outstanding poll registered under a poller ID. A no-op when
    /// the task list is not loaded.
    pub fn cancel_outstanding_poll(
        &self,
        request: CancelOutstandingPollRequest,
    ) -> Result<(), EngineError> {
        let id = self.task_list_id(&request.domain_id, &request.task_list, request.task_list_type);
        if let Some(manager) = self.live_manager(&id) {
            manager.cancel_poller(&request.poller_id);
        }
        Ok(())
    }

    pub async fn describe_task_list(
        self: &Arc<Self>,
        request: DescribeTaskListRequest,
    ) -> Result<DescribeTaskListResponse, EngineError> {
        let id = self.task_list_id(&request.domain_id, &request.task_list, request.task_list_type);
        let manager = self.manager(&id).await?;
        Ok(manager.describe(request.include_task_list_status))
    }
}

/// Forwarding client for a partition tree hosted by this same engine: no RPC
/// hop, just a re-entrant call. Deployments with remote peers install an
/// RPC-backed client instead. Holds the engine weakly so the client can be
/// installed into the engine it fronts.
pub struct LocalMatchingClient {
    engine: Weak<MatchingEngine>,
}

impl LocalMatchingClient {
    pub fn install(engine: &Arc<MatchingEngine>) {
        engine.set_matching_client(Arc::new(LocalMatchingClient {
            engine: Arc::downgrade(engine),
        }));
    }

    fn engine(&self) -> Result<Arc<MatchingEngine>, EngineError> {
        self.engine
            .upgrade()
            .ok_or_else(|| EngineError::Internal("matching engine is gone".into()))
    }
}

#[async_trait]
impl MatchingClient for LocalMatchingClient {
    async fn add_activity_task(
        &self,
        request: AddActivityTaskRequest,
    ) -> Result<AddTaskResponse, EngineError> {
        self.engine()?.add_activity_task(request).await
    }

    async fn add_decision_task(
        &self,
        request: AddDecisionTaskRequest,
    ) -> Result<AddTaskResponse, EngineError> {
        self.engine()?.add_decision_task(request).await
    }

    async fn poll_for_activity_task(
        &self,
        request: PollRequest,
    ) -> Result<PollForActivityTaskResponse, EngineError> {
        self.engine()?.poll_for_activity_task(request).await
    }

    async fn poll_for_decision_task(
        &self,
        request: PollRequest,
    ) -> Result<PollForDecisionTaskResponse, EngineError> {
        self.engine()?.poll_for_decision_task(request).await
    }

    async fn query_workflow(
        &self,
        request: QueryWorkflowRequest,
    ) -> Result<QueryWorkflowResponse, EngineError> {
        self.engine()?.query_workflow(request).await
    }
}
