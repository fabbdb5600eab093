//! Domain lookups consumed by the matching core. The authoritative cache
//! lives elsewhere in the deployment; the core only asks two questions.

use std::collections::HashMap;
use std::sync::Mutex;

/// Lookup seam for domain metadata.
pub trait DomainCache: Send + Sync {
    /// Whether the domain is active in this cluster. Tasks for a non-active
    /// domain skip the sync-match path and go straight to persistence.
    fn is_active(&self, domain_id: &str) -> bool;

    /// Human-readable domain name, for logs and poll responses.
    fn domain_name(&self, domain_id: &str) -> String;
}

/// Cache that treats every domain as active, with optional per-domain
/// overrides. Suits single-cluster deployments and tests.
#[derive(Default)]
pub struct StaticDomainCache {
    names: Mutex<HashMap<String, String>>,
    inactive: Mutex<HashMap<String, bool>>,
}

impl StaticDomainCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_name(&self, domain_id: impl Into<String>, name: impl Into<String>) {
        self.names
            .lock()
            .unwrap()
            .insert(domain_id.into(), name.into());
    }

    pub fn set_active(&self, domain_id: impl Into<String>, active: bool) {
        self.inactive
            .lock()
            .unwrap()
            .insert(domain_id.into(), !active);
    }
}

impl DomainCache for StaticDomainCache {
    fn is_active(&self, domain_id: &str) -> bool {
        !self
            .inactive
            .lock()
            .unwrap()
            .get(domain_id)
            .copied()
            .unwrap_or(false)
    }

    fn domain_name(&self, domain_id: &str) -> String {
        self.names
            .lock()
            .unwrap()
            .get(domain_id)
            .cloned()
            .unwrap_or_else(|| domain_id.to_string())
    }
}
