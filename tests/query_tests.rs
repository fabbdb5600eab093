mod test_helpers;

use std::time::Duration;

use bytes::Bytes;
use switchyard::api::{
    AddDecisionTaskRequest, QueryInput, QueryTaskCompletedType, QueryWorkflowRequest,
    RespondQueryTaskCompletedRequest, TaskList, WorkflowExecution,
};
use switchyard::engine::EngineError;
use switchyard::query::{QueryLifecycle, QueryRegistry, QueryResult, QueryState};

use test_helpers::*;

fn query_request(task_list: &str) -> QueryWorkflowRequest {
    QueryWorkflowRequest {
        domain_id: DOMAIN.to_string(),
        task_list: TaskList::normal(task_list),
        execution: WorkflowExecution {
            workflow_id: "wf-7".to_string(),
            run_id: "run-1".to_string(),
        },
        query_type: "current-state".to_string(),
        query_args: Bytes::from_static(b"{\"depth\":1}"),
        forwarded_from: None,
    }
}

#[switchyard::test]
async fn query_rides_a_decision_poll_and_returns_the_answer() {
    with_timeout!(15_000, {
        let env = test_env();
        let engine = env.engine.clone();

        // Worker side: receive the query task and answer it.
        let worker = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let polled = engine
                    .poll_for_decision_task(poll_request("wf-tasks", "worker-1", Duration::from_secs(5)))
                    .await
                    .expect("poll");
                let query = polled.query.expect("decision task carries the query");
                assert_eq!(query.query_type, "current-state");
                let task_id = polled.query_task_id.expect("query task id");
                engine
                    .respond_query_task_completed(RespondQueryTaskCompletedRequest {
                        task_id,
                        completed_type: QueryTaskCompletedType::Completed,
                        query_result: Bytes::from_static(b"\"running\""),
                        error_message: String::new(),
                    })
                    .expect("respond");
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let response = engine
            .query_workflow(query_request("wf-tasks"))
            .await
            .expect("query");
        assert_eq!(response.query_result, Bytes::from_static(b"\"running\""));
        worker.await.unwrap();

        // Queries never touch the store, and the completed query has left
        // the workflow's registry.
        let id = task_list_id(
            "wf-tasks",
            switchyard::tasklist::TaskListType::Decision,
        );
        assert_eq!(env.store.task_count(&id), 0);
        assert_eq!(engine.live_query_count(), 0);
    });
}

#[switchyard::test]
async fn buffered_query_rides_the_next_decision_task() {
    with_timeout!(15_000, {
        let env = test_env();
        let engine = env.engine.clone();

        // Nobody polls the query's own task list, so the query sits buffered
        // in its workflow's registry.
        let producer = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.query_workflow(query_request("wf-tasks")).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.live_query_count(), 1);

        // A decision task for the same workflow lands on another of its task
        // lists; the buffered query is started and rides along with it.
        engine
            .add_decision_task(AddDecisionTaskRequest {
                domain_id: DOMAIN.to_string(),
                task_list: TaskList::normal("wf-sticky"),
                execution: WorkflowExecution {
                    workflow_id: "wf-7".to_string(),
                    run_id: "run-1".to_string(),
                },
                schedule_id: 11,
                schedule_to_start_timeout: Some(Duration::from_secs(60)),
                forwarded_from: None,
            })
            .await
            .expect("add decision task");

        let polled = engine
            .poll_for_decision_task(poll_request("wf-sticky", "worker-1", Duration::from_secs(5)))
            .await
            .expect("poll");
        assert_eq!(
            polled.workflow_execution.as_ref().unwrap().workflow_id,
            "wf-7"
        );
        assert_eq!(polled.queries.len(), 1, "the buffered query rides along");
        let (task_id, input) = polled.queries.iter().next().unwrap();
        assert_eq!(input.query_type, "current-state");

        engine
            .respond_query_task_completed(RespondQueryTaskCompletedRequest {
                task_id: task_id.clone(),
                completed_type: QueryTaskCompletedType::Completed,
                query_result: Bytes::from_static(b"\"riding\""),
                error_message: String::new(),
            })
            .expect("respond");

        let answer = producer.await.unwrap().expect("query answered");
        assert_eq!(answer.query_result, Bytes::from_static(b"\"riding\""));
        assert_eq!(engine.live_query_count(), 0);
    });
}

#[switchyard::test]
async fn late_response_to_an_expired_query_is_rejected() {
    with_timeout!(15_000, {
        let mut config = test_config();
        config.long_poll_expiration_ms = 400;
        let env = test_env_with(config);
        let engine = env.engine.clone();

        let worker = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let polled = engine
                    .poll_for_decision_task(poll_request("wf-tasks", "worker-1", Duration::from_secs(5)))
                    .await
                    .expect("poll");
                let task_id = polled.query_task_id.expect("query task id");
                // Sit on the answer until the query's ttl has fired.
                tokio::time::sleep(Duration::from_millis(900)).await;
                engine
                    .respond_query_task_completed(RespondQueryTaskCompletedRequest {
                        task_id,
                        completed_type: QueryTaskCompletedType::Completed,
                        query_result: Bytes::from_static(b"\"late\""),
                        error_message: String::new(),
                    })
                    .expect_err("expired query must reject the result")
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = engine
            .query_workflow(query_request("wf-tasks"))
            .await
            .expect_err("nobody answered in time");
        assert!(matches!(err, EngineError::QueryFailed(_)));

        let late = worker.await.unwrap();
        assert!(matches!(late, EngineError::EntityNotExists(_)));

        // The expired query drains out of the registry.
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while engine.live_query_count() != 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(engine.live_query_count(), 0);
    });
}

#[switchyard::test]
async fn worker_reported_failure_is_surfaced_verbatim() {
    with_timeout!(15_000, {
        let env = test_env();
        let engine = env.engine.clone();

        let worker = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let polled = engine
                    .poll_for_decision_task(poll_request("wf-tasks", "worker-1", Duration::from_secs(5)))
                    .await
                    .expect("poll");
                let task_id = polled.query_task_id.expect("query task id");
                engine
                    .respond_query_task_completed(RespondQueryTaskCompletedRequest {
                        task_id,
                        completed_type: QueryTaskCompletedType::Failed,
                        query_result: Bytes::new(),
                        error_message: "unknown query type".to_string(),
                    })
                    .expect("respond");
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = engine
            .query_workflow(query_request("wf-tasks"))
            .await
            .expect_err("worker failed the query");
        match err {
            EngineError::QueryFailed(failed) => {
                assert_eq!(failed.message, "unknown query type");
            }
            other => panic!("expected QueryFailed, got {other:?}"),
        }
        worker.await.unwrap();
    });
}

#[switchyard::test]
async fn unanswered_query_times_out_as_query_failed() {
    with_timeout!(15_000, {
        let mut config = test_config();
        // Keep the dispatch window short so the timeout path is fast.
        config.long_poll_expiration_ms = 500;
        let env = test_env_with(config);

        let err = env
            .engine
            .query_workflow(query_request("wf-tasks"))
            .await
            .expect_err("nobody is polling");
        assert!(matches!(err, EngineError::QueryFailed(_)));
    });
}

#[switchyard::test]
async fn responding_to_an_unknown_query_task_is_entity_not_exists() {
    with_timeout!(5_000, {
        let env = test_env();
        let err = env
            .engine
            .respond_query_task_completed(RespondQueryTaskCompletedRequest {
                task_id: "no-such-task".to_string(),
                completed_type: QueryTaskCompletedType::Completed,
                query_result: Bytes::new(),
                error_message: String::new(),
            })
            .expect_err("unknown task id");
        assert!(matches!(err, EngineError::EntityNotExists(_)));
    });
}

#[switchyard::test]
async fn registry_lifecycle_runs_buffered_to_completed() {
    with_timeout!(10_000, {
        let registry = QueryRegistry::new();
        let handle = registry.buffer_query(QueryInput {
            query_type: "current-state".to_string(),
            query_args: Bytes::new(),
        });
        let lifecycle = QueryLifecycle::new(handle.clone(), Duration::from_secs(30));

        // The decision task embedding the query goes out.
        let inputs = registry.start_buffered().expect("start");
        assert_eq!(inputs.len(), 1);
        assert_eq!(handle.state(), QueryState::Started);

        // Worker answers, then history becomes durable.
        lifecycle
            .record_result(QueryResult::Answered(Bytes::from_static(b"\"done\"")))
            .expect("record");
        assert_eq!(handle.state(), QueryState::Started);
        lifecycle
            .satisfy_persistence_condition()
            .expect("persistence latch");
        assert_eq!(handle.state(), QueryState::Completed);

        // The terminal callback removed it from the registry.
        assert!(registry.get_query(handle.id()).is_err());
        assert_eq!(registry.started_count(), 0);
    });
}

#[switchyard::test]
async fn unstarted_query_expires_after_its_ttl() {
    with_timeout!(10_000, {
        let registry = QueryRegistry::new();
        let handle = registry.buffer_query(QueryInput {
            query_type: "current-state".to_string(),
            query_args: Bytes::new(),
        });
        let _lifecycle = QueryLifecycle::new(handle.clone(), Duration::from_millis(150));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handle.state() != QueryState::Expired && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(handle.state(), QueryState::Expired);
        assert_eq!(registry.buffered_count(), 0);
        assert!(registry.get_query(handle.id()).is_err());
    });
}

#[switchyard::test]
async fn completed_queries_ignore_the_ttl() {
    with_timeout!(10_000, {
        let registry = QueryRegistry::new();
        let handle = registry.buffer_query(QueryInput {
            query_type: "current-state".to_string(),
            query_args: Bytes::new(),
        });
        let lifecycle = QueryLifecycle::new(handle.clone(), Duration::from_millis(150));

        registry.start_buffered().expect("start");
        lifecycle
            .record_result(QueryResult::Answered(Bytes::new()))
            .expect("record");
        lifecycle.satisfy_persistence_condition().expect("latch");
        assert_eq!(handle.state(), QueryState::Completed);

        tokio::time::sleep(Duration::from_millis(300)).await;
        // The expiry timer fired and was rejected by the state machine.
        assert_eq!(handle.state(), QueryState::Completed);
    });
}
