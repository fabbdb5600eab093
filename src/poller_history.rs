//! Recent-poller bookkeeping, surfaced by describe_task_list.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use crate::api::PollerInfo;

const POLLER_RETENTION: Duration = Duration::from_secs(5 * 60);

struct PollerRecord {
    seen: Instant,
    seen_wall: SystemTime,
    rate_per_second: f64,
}

/// Pollers observed on a task list in the last few minutes.
#[derive(Default)]
pub struct PollerHistory {
    pollers: Mutex<HashMap<String, PollerRecord>>,
}

impl PollerHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, identity: &str, rate_per_second: Option<f64>) {
        if identity.is_empty() {
            return;
        }
        let mut pollers = self.pollers.lock().unwrap();
        pollers.insert(
            identity.to_string(),
            PollerRecord {
                seen: Instant::now(),
                seen_wall: SystemTime::now(),
                rate_per_second: rate_per_second.unwrap_or(f64::INFINITY),
            },
        );
    }

    pub fn all(&self) -> Vec<PollerInfo> {
        let now = Instant::now();
        let mut pollers = self.pollers.lock().unwrap();
        pollers.retain(|_, rec| now.duration_since(rec.seen) < POLLER_RETENTION);
        let mut out: Vec<PollerInfo> = pollers
            .iter()
            .map(|(identity, rec)| PollerInfo {
                identity: identity.clone(),
                last_access_time: rec.seen_wall,
                rate_per_second: rec.rate_per_second,
            })
            .collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }
}
