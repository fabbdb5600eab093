use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    /// Enable the /metrics HTTP endpoint
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Metrics listen address (e.g., "127.0.0.1:9090")
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}

/// Tunables for task-list matching. Fields marked "hot" are read at each use
/// site, so swapping in a new config takes effect without reloading managers.
#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    /// Number of task IDs covered by a single range lease. Immutable per run:
    /// changing it across restarts would make previously persisted task IDs
    /// collide with newly allocated blocks.
    #[serde(default = "default_range_size")]
    pub range_size: i64,

    /// Maximum duration a poller long-polls before an empty response (hot).
    #[serde(default = "default_long_poll_expiration_ms")]
    pub long_poll_expiration_ms: u64,

    /// Ceiling over poller-reported dispatch rates (hot). Unset means no cap.
    #[serde(default)]
    pub max_task_dispatch_rps: Option<f64>,

    /// Page size for reading persisted backlog (hot).
    #[serde(default = "default_get_tasks_batch_size")]
    pub get_tasks_batch_size: usize,

    /// How often the current ack level is flushed to the store (hot).
    #[serde(default = "default_update_ack_interval_ms")]
    pub update_ack_interval_ms: u64,

    /// How often to check whether the task list has gone idle (hot).
    /// A manager with no producer or poller activity for a full interval
    /// unloads itself.
    #[serde(default = "default_idle_tasklist_check_interval_ms")]
    pub idle_tasklist_check_interval_ms: u64,

    /// Maximum producer appends queued on the writer channel.
    #[serde(default = "default_outstanding_task_append_limit")]
    pub outstanding_task_append_limit: usize,

    /// Maximum tasks written to the store in one append round-trip.
    #[serde(default = "default_task_batch_size")]
    pub task_batch_size: usize,

    /// How long a producer waits for a synchronous match before falling back
    /// to persistence.
    #[serde(default = "default_sync_match_wait_ms")]
    pub sync_match_wait_ms: u64,

    /// Budget left under the poll deadline so an empty response reaches the
    /// caller before its own deadline fires.
    #[serde(default = "default_return_empty_task_budget_ms")]
    pub return_empty_task_budget_ms: u64,

    /// Delete acked ranges at most once per this interval.
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,

    /// Or once this many completions have accumulated since the last delete.
    #[serde(default = "default_gc_completions_threshold")]
    pub gc_completions_threshold: usize,

    /// Fan-out degree of the partition tree used for forwarding.
    #[serde(default = "default_forwarder_max_children")]
    pub forwarder_max_children: usize,

    /// Concurrent forwarded polls a partition may keep outstanding.
    #[serde(default = "default_forwarder_max_outstanding_polls")]
    pub forwarder_max_outstanding_polls: usize,

    /// Concurrent forwarded task adds a partition may keep outstanding.
    #[serde(default = "default_forwarder_max_outstanding_tasks")]
    pub forwarder_max_outstanding_tasks: usize,

    /// How long must_offer waits locally between forwarding attempts.
    #[serde(default = "default_forwarder_retry_interval_ms")]
    pub forwarder_retry_interval_ms: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            range_size: default_range_size(),
            long_poll_expiration_ms: default_long_poll_expiration_ms(),
            max_task_dispatch_rps: None,
            get_tasks_batch_size: default_get_tasks_batch_size(),
            update_ack_interval_ms: default_update_ack_interval_ms(),
            idle_tasklist_check_interval_ms: default_idle_tasklist_check_interval_ms(),
            outstanding_task_append_limit: default_outstanding_task_append_limit(),
            task_batch_size: default_task_batch_size(),
            sync_match_wait_ms: default_sync_match_wait_ms(),
            return_empty_task_budget_ms: default_return_empty_task_budget_ms(),
            gc_interval_ms: default_gc_interval_ms(),
            gc_completions_threshold: default_gc_completions_threshold(),
            forwarder_max_children: default_forwarder_max_children(),
            forwarder_max_outstanding_polls: default_forwarder_max_outstanding_polls(),
            forwarder_max_outstanding_tasks: default_forwarder_max_outstanding_tasks(),
            forwarder_retry_interval_ms: default_forwarder_retry_interval_ms(),
        }
    }
}

fn default_range_size() -> i64 {
    100_000
}

fn default_long_poll_expiration_ms() -> u64 {
    60_000
}

fn default_get_tasks_batch_size() -> usize {
    1_000
}

fn default_update_ack_interval_ms() -> u64 {
    60_000
}

fn default_idle_tasklist_check_interval_ms() -> u64 {
    300_000
}

fn default_outstanding_task_append_limit() -> usize {
    250
}

fn default_task_batch_size() -> usize {
    100
}

fn default_sync_match_wait_ms() -> u64 {
    200
}

fn default_return_empty_task_budget_ms() -> u64 {
    1_000
}

fn default_gc_interval_ms() -> u64 {
    60_000
}

fn default_gc_completions_threshold() -> usize {
    100
}

fn default_forwarder_max_children() -> usize {
    20
}

fn default_forwarder_max_outstanding_polls() -> usize {
    1
}

fn default_forwarder_max_outstanding_tasks() -> usize {
    1
}

fn default_forwarder_retry_interval_ms() -> u64 {
    50
}

impl MatchingConfig {
    pub fn long_poll_expiration(&self) -> Duration {
        Duration::from_millis(self.long_poll_expiration_ms)
    }

    pub fn update_ack_interval(&self) -> Duration {
        Duration::from_millis(self.update_ack_interval_ms)
    }

    pub fn idle_tasklist_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_tasklist_check_interval_ms)
    }

    pub fn sync_match_wait(&self) -> Duration {
        Duration::from_millis(self.sync_match_wait_ms)
    }

    pub fn return_empty_task_budget(&self) -> Duration {
        Duration::from_millis(self.return_empty_task_budget_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn forwarder_retry_interval(&self) -> Duration {
        Duration::from_millis(self.forwarder_retry_interval_ms)
    }

    /// Effective dispatch-rate ceiling; poller-reported values are clamped to it.
    pub fn dispatch_rps_ceiling(&self) -> f64 {
        self.max_task_dispatch_rps.unwrap_or(f64::INFINITY)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Text,
            metrics: MetricsConfig::default(),
            matching: MatchingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}
