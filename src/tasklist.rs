//! Task-list identity and the task-ID block math derived from range leases.

use std::fmt;

use serde::Deserialize;

/// Prefix marking a non-root partition of a logical task list.
pub const PARTITION_PREFIX: &str = "/__switchyard_sys/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskListType {
    Activity,
    Decision,
}

impl fmt::Display for TaskListType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskListType::Activity => write!(f, "activity"),
            TaskListType::Decision => write!(f, "decision"),
        }
    }
}

/// Sticky task lists are pinned to a single worker and never forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskListKind {
    #[default]
    Normal,
    Sticky,
}

/// Identity of a task list: routing and persistence key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskListId {
    pub domain_id: String,
    pub name: String,
    pub task_type: TaskListType,
    pub kind: TaskListKind,
}

impl TaskListId {
    pub fn new(
        domain_id: impl Into<String>,
        name: impl Into<String>,
        task_type: TaskListType,
        kind: TaskListKind,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            name: name.into(),
            task_type,
            kind,
        }
    }

    /// True when this is the root of its partition tree. Names outside the
    /// partition namespace are always roots.
    pub fn is_root(&self) -> bool {
        self.partition() == 0
    }

    /// Logical name with any partition suffix stripped.
    pub fn base_name(&self) -> &str {
        match self.suffix_parts() {
            Some((base, _)) => base,
            None => &self.name,
        }
    }

    /// Partition ordinal; 0 for the root.
    pub fn partition(&self) -> usize {
        match self.suffix_parts() {
            Some((_, p)) => p,
            None => 0,
        }
    }

    /// Identity of the parent partition in a tree of the given fan-out degree.
    /// Returns None for the root.
    pub fn parent(&self, degree: usize) -> Option<TaskListId> {
        let p = self.partition();
        if p == 0 || degree == 0 {
            return None;
        }
        let parent = (p + degree - 1) / degree - 1;
        let name = if parent == 0 {
            self.base_name().to_string()
        } else {
            format!("{}{}/{}", PARTITION_PREFIX, self.base_name(), parent)
        };
        Some(TaskListId {
            domain_id: self.domain_id.clone(),
            name,
            task_type: self.task_type,
            kind: self.kind,
        })
    }

    fn suffix_parts(&self) -> Option<(&str, usize)> {
        let rest = self.name.strip_prefix(PARTITION_PREFIX)?;
        let (base, suffix) = rest.rsplit_once('/')?;
        let p = suffix.parse::<usize>().ok()?;
        if p == 0 {
            return None;
        }
        Some((base, p))
    }
}

impl fmt::Display for TaskListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.domain_id, self.name, self.task_type)
    }
}

/// Inclusive range of task IDs owned by the current lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskIdBlock {
    pub start: i64,
    pub end: i64,
}

impl TaskIdBlock {
    /// Block covered by a given range lease.
    pub fn for_range(range_id: i64, range_size: i64) -> Self {
        Self {
            start: (range_id - 1) * range_size + 1,
            end: range_id * range_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> TaskListId {
        TaskListId::new("dom", name, TaskListType::Decision, TaskListKind::Normal)
    }

    #[test]
    fn root_names_have_no_partition() {
        let tl = id("orders");
        assert!(tl.is_root());
        assert_eq!(tl.partition(), 0);
        assert_eq!(tl.base_name(), "orders");
        assert!(tl.parent(4).is_none());
    }

    #[test]
    fn partition_parents_walk_toward_the_root() {
        let tl = id("/__switchyard_sys/orders/5");
        assert!(!tl.is_root());
        assert_eq!(tl.partition(), 5);
        assert_eq!(tl.base_name(), "orders");

        let parent = tl.parent(4).unwrap();
        assert_eq!(parent.name, "/__switchyard_sys/orders/1");
        let grandparent = parent.parent(4).unwrap();
        assert_eq!(grandparent.name, "orders");
        assert!(grandparent.is_root());
    }

    #[test]
    fn malformed_partition_suffix_is_treated_as_root() {
        assert!(id("/__switchyard_sys/orders/x").is_root());
        assert!(id("/__switchyard_sys/orders/0").is_root());
    }

    #[test]
    fn block_math_matches_the_lease_counter() {
        assert_eq!(
            TaskIdBlock::for_range(1, 100_000),
            TaskIdBlock {
                start: 1,
                end: 100_000
            }
        );
        assert_eq!(
            TaskIdBlock::for_range(3, 100_000),
            TaskIdBlock {
                start: 200_001,
                end: 300_000
            }
        );
    }
}
