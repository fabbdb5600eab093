mod test_helpers;

use std::sync::Arc;
use std::time::Duration;

use switchyard::api::WorkflowExecution;
use switchyard::domain::StaticDomainCache;
use switchyard::settings::MatchingConfig;
use switchyard::store::memory::MemoryTaskStore;
use switchyard::task_list_manager::{AddTaskParams, PollParams, TaskListManager};
use switchyard::tasklist::{TaskListId, TaskListType};

use test_helpers::*;

fn add_params(schedule_id: i64) -> AddTaskParams {
    AddTaskParams {
        execution: WorkflowExecution {
            workflow_id: format!("wf-{schedule_id}"),
            run_id: "run-1".to_string(),
        },
        schedule_id,
        schedule_to_start_timeout: Some(Duration::from_secs(60)),
        forwarded_from: None,
    }
}

fn poll_params(identity: &str, timeout: Duration) -> PollParams {
    PollParams {
        identity: identity.to_string(),
        poller_id: None,
        max_tasks_per_second: None,
        timeout: Some(timeout),
    }
}

struct ManagerEnv {
    store: Arc<MemoryTaskStore>,
    domains: Arc<StaticDomainCache>,
    id: TaskListId,
}

impl ManagerEnv {
    fn new(name: &str) -> Self {
        let domains = Arc::new(StaticDomainCache::new());
        domains.set_name(DOMAIN, "test");
        Self {
            store: MemoryTaskStore::new(),
            domains,
            id: task_list_id(name, TaskListType::Activity),
        }
    }

    async fn manager(&self, config: MatchingConfig) -> Arc<TaskListManager> {
        let manager = TaskListManager::new(
            self.id.clone(),
            self.store.clone(),
            self.domains.clone(),
            None,
            Arc::new(config),
            switchyard::metrics::init().expect("metrics"),
        );
        manager.start().await.expect("manager start");
        manager
    }
}

#[switchyard::test]
async fn out_of_order_completions_advance_ack_over_the_contiguous_prefix() {
    with_timeout!(20_000, {
        let env = ManagerEnv::new("ooo");
        let manager = env.manager(test_config()).await;

        for schedule_id in 1..=5 {
            let sync = manager.add_task(add_params(schedule_id)).await.expect("add");
            assert!(!sync);
        }

        // Collect all five tasks without finishing them.
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let task = manager
                .get_task(poll_params("worker-1", Duration::from_secs(5)))
                .await
                .expect("task");
            tasks.push(task);
        }
        let ids: Vec<i64> = tasks.iter().map(|t| t.info().unwrap().task_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let expectations = [(3usize, 0i64), (1, 1), (2, 3), (5, 3), (4, 5)];
        for (task_id, expected_ack) in expectations {
            let task = tasks
                .iter_mut()
                .find(|t| t.info().unwrap().task_id == task_id as i64)
                .unwrap();
            task.finish(Ok(()));
            // Completions flow through the reader's outcome loop.
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            loop {
                let ack = manager.describe(true).status.unwrap().ack_level;
                if ack == expected_ack {
                    break;
                }
                assert!(
                    std::time::Instant::now() < deadline,
                    "ack level never reached {expected_ack} after completing {task_id}"
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        manager.stop();
    });
}

#[switchyard::test]
async fn lease_theft_unloads_the_stale_manager() {
    with_timeout!(20_000, {
        let env = ManagerEnv::new("stolen");
        let first = env.manager(test_config()).await;
        // A second manager for the same task list takes the lease over.
        let second = env.manager(test_config()).await;

        let err = first
            .add_task(add_params(1))
            .await
            .expect_err("stale lease must fail the append");
        assert!(err.is_condition_failed());
        assert!(first.is_stopped());

        // The thief keeps working.
        let sync = second.add_task(add_params(2)).await.expect("add");
        assert!(!sync);
        assert_eq!(env.store.task_count(&env.id), 1);

        second.stop();
    });
}

#[switchyard::test]
async fn failed_dispatch_reappends_with_a_fresh_task_id() {
    with_timeout!(20_000, {
        let env = ManagerEnv::new("retry");
        let manager = env.manager(test_config()).await;

        assert!(!manager.add_task(add_params(1)).await.expect("add"));
        let mut task = manager
            .get_task(poll_params("worker-1", Duration::from_secs(5)))
            .await
            .expect("task");
        let original_id = task.info().unwrap().task_id;
        task.finish(Err(switchyard::task::DispatchError::Failed(
            "worker lost".to_string(),
        )));
        drop(task);

        // The task comes back under a higher ID; it is never lost.
        let redelivered = manager
            .get_task(poll_params("worker-1", Duration::from_secs(5)))
            .await
            .expect("redelivered task");
        let info = redelivered.info().unwrap();
        assert!(info.task_id > original_id);
        assert_eq!(info.workflow_id, "wf-1");

        manager.stop();
    });
}

#[switchyard::test]
async fn expired_tasks_are_dropped_without_dispatch() {
    with_timeout!(20_000, {
        use switchyard::store::TaskStore;
        use switchyard::task::TaskInfo;

        let env = ManagerEnv::new("expired");
        // A leftover row from a previous owner, already past its expiry.
        let state = env.store.lease_task_list(&env.id).await.expect("lease");
        let stale = TaskInfo::new(
            DOMAIN,
            "wf-1",
            "run-1",
            1,
            1,
            Some(std::time::SystemTime::now() - Duration::from_secs(5)),
        );
        env.store
            .create_tasks(&env.id, state.range_id, &[stale])
            .await
            .expect("seed backlog");

        let manager = env.manager(test_config()).await;
        let polled = manager
            .get_task(poll_params("worker-1", Duration::from_millis(2_000)))
            .await;
        assert!(polled.is_none(), "expired task must not be dispatched");

        // The expired row is acked over and collected.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while env.store.task_count(&env.id) > 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(env.store.task_count(&env.id), 0);

        manager.stop();
    });
}

#[switchyard::test]
async fn inactive_domains_skip_the_sync_match_path() {
    with_timeout!(20_000, {
        let env = ManagerEnv::new("standby");
        env.domains.set_active(DOMAIN, false);
        let manager = env.manager(test_config()).await;

        // A poller is already waiting, but the domain is not active here, so
        // the task must be persisted instead of sync matched.
        let manager_for_poll = manager.clone();
        let poll = tokio::spawn(async move {
            manager_for_poll
                .get_task(poll_params("worker-1", Duration::from_millis(1_500)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sync = manager.add_task(add_params(1)).await.expect("add");
        assert!(!sync);
        assert_eq!(env.store.task_count(&env.id), 1);

        // The poll only listens for queries while the domain is passive.
        assert!(poll.await.unwrap().is_none());

        manager.stop();
    });
}

#[switchyard::test]
async fn dispatch_task_hands_forwarded_work_to_a_poller_without_persisting() {
    with_timeout!(20_000, {
        use switchyard::task::{InternalTask, TaskInfo};

        let env = ManagerEnv::new("inbound");
        let manager = env.manager(test_config()).await;

        let manager_for_poll = manager.clone();
        let poll = tokio::spawn(async move {
            manager_for_poll
                .get_task(poll_params("worker-1", Duration::from_secs(5)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let info = TaskInfo::new(DOMAIN, "wf-fwd", "run-1", 4, 0, None);
        let task = InternalTask::new_forwarded(info, "/__switchyard_sys/inbound/2".to_string());
        manager.dispatch_task(task).await.expect("dispatch");

        let received = poll.await.unwrap().expect("poller receives the task");
        assert_eq!(received.info().unwrap().workflow_id, "wf-fwd");
        assert_eq!(
            received.forwarded_from.as_deref(),
            Some("/__switchyard_sys/inbound/2")
        );
        assert_eq!(env.store.task_count(&env.id), 0);

        manager.stop();
    });
}

#[switchyard::test]
async fn idle_task_lists_unload_themselves() {
    with_timeout!(10_000, {
        let env = ManagerEnv::new("idle");
        let mut config = test_config();
        config.idle_tasklist_check_interval_ms = 150;
        let manager = env.manager(config).await;

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !manager.is_stopped() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(manager.is_stopped(), "idle manager should evict itself");
    });
}

#[switchyard::test]
async fn task_ids_stay_monotonic_across_block_exhaustion() {
    with_timeout!(20_000, {
        let env = ManagerEnv::new("blocks");
        let mut config = test_config();
        // Tiny blocks so a handful of appends forces lease renewals.
        config.range_size = 2;
        let manager = env.manager(config).await;

        for schedule_id in 1..=5 {
            assert!(!manager.add_task(add_params(schedule_id)).await.expect("add"));
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            let mut task = manager
                .get_task(poll_params("worker-1", Duration::from_secs(5)))
                .await
                .expect("task");
            seen.push(task.info().unwrap().task_id);
            task.finish(Ok(()));
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);

        // Two renewals happened on the way: blocks {1,2}, {3,4}, {5,6}.
        let state = env.store.state(&env.id).expect("state");
        assert_eq!(state.range_id, 3);

        manager.stop();
    });
}

#[switchyard::test]
async fn restart_reclaims_ownership_without_redelivery() {
    with_timeout!(20_000, {
        let env = ManagerEnv::new("restart");
        let first = env.manager(test_config()).await;

        for schedule_id in 1..=2 {
            assert!(!first.add_task(add_params(schedule_id)).await.expect("add"));
        }
        for _ in 0..2 {
            let mut task = first
                .get_task(poll_params("worker-1", Duration::from_secs(5)))
                .await
                .expect("task");
            task.finish(Ok(()));
        }

        // Wait for the periodic ack flush to persist ack_level = 2.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if env.store.state(&env.id).map(|s| s.ack_level) == Some(2) {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "ack level was never persisted"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        first.stop();

        // A fresh manager starts from the persisted ack level: nothing at or
        // below it is ever redelivered.
        let second = env.manager(test_config()).await;
        let polled = second
            .get_task(poll_params("worker-1", Duration::from_millis(1_500)))
            .await;
        assert!(polled.is_none(), "acked tasks must not be redelivered");

        second.stop();
    });
}

#[switchyard::test]
async fn backlog_scan_reports_healthy_rows() {
    with_timeout!(20_000, {
        let env = ManagerEnv::new("scan");
        let manager = env.manager(test_config()).await;

        for schedule_id in 1..=3 {
            assert!(!manager.add_task(add_params(schedule_id)).await.expect("add"));
        }
        let report = manager.scan_backlog().await.expect("scan");
        assert_eq!(report.checked, 3);
        assert_eq!(report.healthy, 3);
        assert!(report.corrupted.is_empty());

        manager.stop();
    });
}
