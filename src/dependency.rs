//! Dependency relationships between unresolved tasks.
//!
//! A task records each dependency as a `dep_<uuid>` key with an empty value.
//! Only edges between two pending tasks count: finishing or deleting either
//! end resolves the dependency.

use uuid::Uuid;

use crate::storage::TaskStorage;
use crate::working_set::is_eligible;

pub(crate) const DEPENDENCY_PREFIX: &str = "dep_";

/// Edges `(task, depends_on)` among pending tasks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyMap {
    edges: Vec<(Uuid, Uuid)>,
}

impl DependencyMap {
    pub(crate) fn build(tasks: &TaskStorage) -> Self {
        let mut edges = Vec::new();
        for (uuid, taskmap) in tasks.all().filter(|(_, task)| is_eligible(task)) {
            for key in taskmap.keys() {
                let Some(dep) = key
                    .strip_prefix(DEPENDENCY_PREFIX)
                    .and_then(|s| Uuid::parse_str(s).ok())
                else {
                    continue;
                };
                if tasks.get(&dep).map(is_eligible).unwrap_or(false) {
                    edges.push((*uuid, dep));
                }
            }
        }
        edges.sort();
        tracing::trace!(edges = edges.len(), "built dependency map");
        Self { edges }
    }

    /// Unresolved tasks `uuid` waits on
    pub fn dependencies(&self, uuid: Uuid) -> impl Iterator<Item = Uuid> + '_ {
        self.edges
            .iter()
            .filter(move |(from, _)| *from == uuid)
            .map(|(_, to)| *to)
    }

    /// Unresolved tasks waiting on `uuid`
    pub fn dependents(&self, uuid: Uuid) -> impl Iterator<Item = Uuid> + '_ {
        self.edges
            .iter()
            .filter(move |(_, to)| *to == uuid)
            .map(|(from, _)| *from)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}
