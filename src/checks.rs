//! Integrity checks over a task list's persisted backlog. Each checker
//! verifies one invariant for a single task; a scan runs the fixed pipeline
//! over a page of rows and tallies the results.

use std::time::SystemTime;

use crate::task::TaskInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResultType {
    /// The check could not be run.
    Failed,
    /// The check ran and found the invariant violated.
    Corrupted,
    /// The check ran and found no violation.
    Healthy,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub result_type: CheckResultType,
    pub note: String,
    pub details: String,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            result_type: CheckResultType::Healthy,
            note: String::new(),
            details: String::new(),
        }
    }

    fn corrupted(note: &str, details: String) -> Self {
        Self {
            result_type: CheckResultType::Corrupted,
            note: note.to_string(),
            details,
        }
    }
}

/// One persisted task under examination.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub task: TaskInfo,
    pub ack_level: i64,
    pub read_level: i64,
}

/// Resources produced by one check for the benefit of dependent checks.
/// Only populated when the producing check comes back healthy.
#[derive(Debug, Default)]
pub struct RequestResources {
    pub now: Option<SystemTime>,
}

impl RequestResources {
    fn now(&mut self) -> SystemTime {
        *self.now.get_or_insert_with(SystemTime::now)
    }
}

pub trait Checker: Send + Sync {
    /// Check one invariant for a single task.
    fn check(&self, request: CheckRequest, resources: &mut RequestResources) -> CheckResult;
    /// Stable name of this check, used in reports.
    fn check_type(&self) -> &'static str;
}

/// No persisted row may sit at or below the ack level: everything there was
/// acknowledged and should have been deleted.
pub struct AckLevelChecker;

impl Checker for AckLevelChecker {
    fn check(&self, request: CheckRequest, _resources: &mut RequestResources) -> CheckResult {
        if request.task.task_id <= request.ack_level {
            return CheckResult::corrupted(
                "task at or below ack level",
                format!(
                    "task_id {} <= ack_level {}",
                    request.task.task_id, request.ack_level
                ),
            );
        }
        CheckResult::healthy()
    }

    fn check_type(&self) -> &'static str {
        "ack_level"
    }
}

/// A row past its expiry is dead weight the reader will drop on its next
/// pass; flag it so operators can see schedule-to-start timeouts piling up.
pub struct ExpiryChecker;

impl Checker for ExpiryChecker {
    fn check(&self, request: CheckRequest, resources: &mut RequestResources) -> CheckResult {
        let now = resources.now();
        if request.task.is_expired(now) {
            return CheckResult::corrupted(
                "task past its expiry",
                format!("task_id {} expired", request.task.task_id),
            );
        }
        CheckResult::healthy()
    }

    fn check_type(&self) -> &'static str {
        "expiry"
    }
}

/// Outcome of scanning one page of backlog.
#[derive(Debug, Default)]
pub struct BacklogScanReport {
    pub checked: usize,
    pub healthy: usize,
    pub failed: usize,
    pub corrupted: Vec<(TaskInfo, CheckResult)>,
}

/// Run the standard checker pipeline over a page of persisted tasks. A task
/// stops at its first non-healthy result.
pub fn scan_backlog(tasks: &[TaskInfo], ack_level: i64, read_level: i64) -> BacklogScanReport {
    let checkers: Vec<Box<dyn Checker>> = vec![Box::new(AckLevelChecker), Box::new(ExpiryChecker)];
    let mut report = BacklogScanReport::default();
    for task in tasks {
        report.checked += 1;
        let mut resources = RequestResources::default();
        let mut bad: Option<CheckResult> = None;
        for checker in &checkers {
            let result = checker.check(
                CheckRequest {
                    task: task.clone(),
                    ack_level,
                    read_level,
                },
                &mut resources,
            );
            match result.result_type {
                CheckResultType::Healthy => continue,
                CheckResultType::Corrupted | CheckResultType::Failed => {
                    bad = Some(result);
                    break;
                }
            }
        }
        match bad {
            None => report.healthy += 1,
            Some(result) if result.result_type == CheckResultType::Failed => report.failed += 1,
            Some(result) => report.corrupted.push((task.clone(), result)),
        }
    }
    report
}
