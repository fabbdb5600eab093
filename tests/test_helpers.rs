use std::sync::Arc;
use std::time::Duration;

use switchyard::api::{AddActivityTaskRequest, PollRequest, TaskList, WorkflowExecution};
use switchyard::domain::StaticDomainCache;
use switchyard::engine::MatchingEngine;
use switchyard::settings::MatchingConfig;
use switchyard::store::memory::MemoryTaskStore;
use switchyard::tasklist::{TaskListId, TaskListKind, TaskListType};

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

pub const DOMAIN: &str = "test-domain";

/// Config tuned for tests: short sync-match window, eager GC, frequent ack
/// flushes, and a small empty-response budget so short poll timeouts are
/// honored.
pub fn test_config() -> MatchingConfig {
    MatchingConfig {
        sync_match_wait_ms: 100,
        return_empty_task_budget_ms: 100,
        gc_completions_threshold: 1,
        gc_interval_ms: 50,
        update_ack_interval_ms: 100,
        forwarder_retry_interval_ms: 20,
        ..MatchingConfig::default()
    }
}

pub struct TestEnv {
    pub store: Arc<MemoryTaskStore>,
    pub domains: Arc<StaticDomainCache>,
    pub engine: Arc<MatchingEngine>,
}

pub fn test_env() -> TestEnv {
    test_env_with(test_config())
}

pub fn test_env_with(config: MatchingConfig) -> TestEnv {
    let store = MemoryTaskStore::new();
    let domains = Arc::new(StaticDomainCache::new());
    domains.set_name(DOMAIN, "test");
    let metrics = switchyard::metrics::init().expect("metrics");
    let engine = MatchingEngine::new(
        store.clone(),
        domains.clone(),
        Arc::new(config),
        metrics,
    );
    TestEnv {
        store,
        domains,
        engine,
    }
}

pub fn task_list_id(name: &str, task_type: TaskListType) -> TaskListId {
    TaskListId::new(DOMAIN, name, task_type, TaskListKind::Normal)
}

pub fn add_activity_request(task_list: &str, schedule_id: i64) -> AddActivityTaskRequest {
    AddActivityTaskRequest {
        domain_id: DOMAIN.to_string(),
        task_list: TaskList::normal(task_list),
        execution: WorkflowExecution {
            workflow_id: format!("wf-{schedule_id}"),
            run_id: "run-1".to_string(),
        },
        schedule_id,
        schedule_to_start_timeout: Some(Duration::from_secs(60)),
        forwarded_from: None,
    }
}

pub fn poll_request(task_list: &str, identity: &str, timeout: Duration) -> PollRequest {
    PollRequest {
        domain_id: DOMAIN.to_string(),
        task_list: TaskList::normal(task_list),
        identity: identity.to_string(),
        poller_id: None,
        max_tasks_per_second: None,
        timeout: Some(timeout),
        forwarded_from: None,
    }
}
