mod test_helpers;

use std::time::Duration;

use switchyard::api::{
    AddInMemoryDecisionTaskRequest, CancelOutstandingPollRequest, DescribeTaskListRequest,
    TaskList, WorkflowExecution,
};
use switchyard::engine::EngineError;
use switchyard::store::TaskStore;
use switchyard::tasklist::TaskListType;

use test_helpers::*;

#[switchyard::test]
async fn sync_match_skips_persistence() {
    with_timeout!(10_000, {
        let env = test_env();
        let engine = env.engine.clone();

        let poller = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .poll_for_activity_task(poll_request("orders", "worker-1", Duration::from_secs(5)))
                    .await
                    .expect("poll")
            })
        };
        // Let the poller park before producing.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let response = engine
            .add_activity_task(add_activity_request("orders", 1))
            .await
            .expect("add");
        assert!(response.sync_matched, "poller was waiting, expected a sync match");

        let polled = poller.await.unwrap();
        assert!(!polled.is_empty());
        assert_eq!(
            polled.workflow_execution.as_ref().unwrap().workflow_id,
            "wf-1"
        );
        assert_eq!(polled.domain_name, "test");

        // The fast path never touched the store.
        let id = task_list_id("orders", TaskListType::Activity);
        assert_eq!(env.store.task_count(&id), 0);
    });
}

#[switchyard::test]
async fn backlog_is_persisted_and_drained_in_order() {
    with_timeout!(20_000, {
        let env = test_env();
        let engine = env.engine.clone();
        let id = task_list_id("orders", TaskListType::Activity);

        // No poller: both adds fall back to the store.
        for schedule_id in 1..=2 {
            let response = engine
                .add_activity_task(add_activity_request("orders", schedule_id))
                .await
                .expect("add");
            assert!(!response.sync_matched);
        }
        assert_eq!(env.store.task_count(&id), 2);

        let first = engine
            .poll_for_activity_task(poll_request("orders", "worker-1", Duration::from_secs(5)))
            .await
            .expect("poll");
        let second = engine
            .poll_for_activity_task(poll_request("orders", "worker-1", Duration::from_secs(5)))
            .await
            .expect("poll");
        assert_eq!(first.task_id, 1);
        assert_eq!(second.task_id, 2);

        // Both were acked on delivery; GC runs eagerly under the test config.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while env.store.task_count(&id) > 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(env.store.task_count(&id), 0, "gc should delete acked rows");
    });
}

#[switchyard::test]
async fn empty_poll_returns_instead_of_erroring() {
    with_timeout!(10_000, {
        let env = test_env();
        let started = std::time::Instant::now();
        let response = env
            .engine
            .poll_for_activity_task(poll_request("idle", "worker-1", Duration::from_millis(600)))
            .await
            .expect("poll");
        assert!(response.is_empty());
        // Returned within the caller budget, leaving tailroom.
        assert!(started.elapsed() < Duration::from_millis(600));
    });
}

#[switchyard::test]
async fn cancel_poller_unblocks_exactly_that_poll() {
    with_timeout!(10_000, {
        let env = test_env();
        let engine = env.engine.clone();

        let mut request = poll_request("orders", "worker-1", Duration::from_secs(30));
        request.poller_id = Some("poller-abc".to_string());
        let poll = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.poll_for_activity_task(request).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        engine
            .cancel_outstanding_poll(CancelOutstandingPollRequest {
                domain_id: DOMAIN.to_string(),
                task_list: TaskList::normal("orders"),
                task_list_type: TaskListType::Activity,
                poller_id: "poller-abc".to_string(),
            })
            .expect("cancel");

        let response = with_timeout!(2_000, { poll.await.unwrap().expect("poll") });
        assert!(response.is_empty(), "cancelled poll reports no work");
    });
}

#[switchyard::test]
async fn in_memory_task_requires_a_waiting_poller() {
    with_timeout!(10_000, {
        let env = test_env();
        let request = AddInMemoryDecisionTaskRequest {
            domain_id: DOMAIN.to_string(),
            task_list: TaskList::normal("sticky-ish"),
            execution: WorkflowExecution {
                workflow_id: "wf-mem".to_string(),
                run_id: "run-1".to_string(),
            },
            schedule_id: 9,
            forwarded_from: None,
        };
        let err = env
            .engine
            .add_in_memory_decision_task(request.clone())
            .await
            .expect_err("no poller, must fail");
        assert!(matches!(err, EngineError::Internal(_)));

        // Nothing was persisted on the failed path.
        let id = task_list_id("sticky-ish", TaskListType::Decision);
        assert_eq!(env.store.task_count(&id), 0);

        // With a poller parked, the same request succeeds.
        let engine = env.engine.clone();
        let poller = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .poll_for_decision_task(poll_request(
                        "sticky-ish",
                        "worker-1",
                        Duration::from_secs(5),
                    ))
                    .await
                    .expect("poll")
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine
            .add_in_memory_decision_task(request)
            .await
            .expect("sync-match-only add");
        let polled = poller.await.unwrap();
        assert_eq!(
            polled.workflow_execution.as_ref().unwrap().workflow_id,
            "wf-mem"
        );
        assert_eq!(env.store.task_count(&id), 0, "in-memory path never persists");
    });
}

#[switchyard::test]
async fn overloaded_store_surfaces_service_busy() {
    with_timeout!(10_000, {
        let env = test_env();
        env.store.shed_next_creates(1);

        let err = env
            .engine
            .add_activity_task(add_activity_request("orders", 1))
            .await
            .expect_err("store is shedding load");
        assert!(matches!(err, EngineError::ServiceBusy(_)));
    });
}

#[switchyard::test]
async fn describe_reports_pollers_and_status() {
    with_timeout!(10_000, {
        let env = test_env();
        let engine = env.engine.clone();

        // A couple of polls to seed poller history and the rate limiter.
        let mut request = poll_request("orders", "worker-7", Duration::from_millis(600));
        request.max_tasks_per_second = Some(25.0);
        let _ = engine.poll_for_activity_task(request).await.expect("poll");

        let described = engine
            .describe_task_list(DescribeTaskListRequest {
                domain_id: DOMAIN.to_string(),
                task_list: TaskList::normal("orders"),
                task_list_type: TaskListType::Activity,
                include_task_list_status: true,
            })
            .await
            .expect("describe");

        assert_eq!(described.pollers.len(), 1);
        assert_eq!(described.pollers[0].identity, "worker-7");
        let status = described.status.expect("status requested");
        assert_eq!(status.ack_level, 0);
        assert_eq!(status.rate_per_second, 25.0);
        assert_eq!(status.task_id_block.start, 1);
    });
}

#[switchyard::test]
async fn manager_registry_reuses_and_rebuilds() {
    with_timeout!(10_000, {
        let env = test_env();
        let engine = env.engine.clone();

        engine
            .add_activity_task(add_activity_request("orders", 1))
            .await
            .expect("add");
        assert_eq!(engine.task_list_count(), 1);
        engine
            .add_activity_task(add_activity_request("orders", 2))
            .await
            .expect("add reuses the same manager");
        assert_eq!(engine.task_list_count(), 1);

        // Steal the lease behind the engine's back; the next add fails once
        // internally, unloads the stale manager, and succeeds on a fresh one.
        let id = task_list_id("orders", TaskListType::Activity);
        env.store.lease_task_list(&id).await.expect("steal lease");
        engine
            .add_activity_task(add_activity_request("orders", 3))
            .await
            .expect("engine retry picks up a fresh manager");
        let state = env.store.state(&id).expect("state");
        assert_eq!(state.range_id, 3);
    });
}
