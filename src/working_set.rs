//! Working set: small, stable integer ids for pending tasks.
//!
//! Index 0 is reserved and always empty. An index keeps pointing at the same
//! task until an explicit rebuild; a task that stops being pending leaves a
//! hole instead of shifting its neighbours.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{TaskMap, TaskStorage};
use crate::task::{Prop, Status};

/// The persisted index table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkingSetTable {
    slots: Vec<Option<Uuid>>,
}

impl Default for WorkingSetTable {
    fn default() -> Self {
        Self { slots: vec![None] }
    }
}

/// Whether a task belongs in the working set
pub(crate) fn is_eligible(task: &TaskMap) -> bool {
    task.get(Prop::Status.as_str())
        .map(|s| Status::from_taskmap(s) == Status::Pending)
        .unwrap_or(false)
}

impl WorkingSetTable {
    pub fn get(&self, index: usize) -> Option<Uuid> {
        if index == 0 {
            return None;
        }
        self.slots.get(index).copied().flatten()
    }

    pub fn index_of(&self, uuid: &Uuid) -> Option<usize> {
        self.slots.iter().position(|slot| slot.as_ref() == Some(uuid))
    }

    /// Give `uuid` the next free index at the end, unless it already has one.
    pub fn add(&mut self, uuid: Uuid) -> usize {
        if let Some(index) = self.index_of(&uuid) {
            return index;
        }
        if self.slots.is_empty() {
            self.slots.push(None);
        }
        self.slots.push(Some(uuid));
        self.slots.len() - 1
    }

    /// Turn the slot holding `uuid` into a hole.
    pub(crate) fn clear(&mut self, uuid: &Uuid) {
        if let Some(index) = self.index_of(uuid) {
            self.slots[index] = None;
        }
    }

    /// Recompute the table from task storage.
    ///
    /// With `renumber`, eligible tasks get contiguous indices from 1. Without
    /// it, existing bindings for still-eligible tasks are kept, ineligible
    /// ones become holes, and newly eligible tasks are appended; holes are
    /// never filled.
    pub fn rebuild(&mut self, tasks: &TaskStorage, renumber: bool) {
        let mut slots: Vec<Option<Uuid>> = vec![None];

        if !renumber {
            for slot in self.slots.iter().skip(1) {
                let keep = slot.filter(|uuid| tasks.get(uuid).map(is_eligible).unwrap_or(false));
                slots.push(keep);
            }
        }

        let mut newcomers: Vec<(&Uuid, &TaskMap)> = tasks
            .all()
            .filter(|(uuid, task)| is_eligible(task) && !slots.contains(&Some(**uuid)))
            .collect();
        // Oldest first so fresh ids follow creation order.
        newcomers.sort_by_key(|(uuid, task)| (entry_of(task), **uuid));
        slots.extend(newcomers.into_iter().map(|(uuid, _)| Some(*uuid)));

        tracing::debug!(renumber, size = slots.len() - 1, "rebuilt working set");
        self.slots = slots;
    }

    /// An immutable view for lookups
    pub fn snapshot(&self) -> WorkingSet {
        WorkingSet::new(self.slots.clone())
    }
}

fn entry_of(task: &TaskMap) -> i64 {
    task.get(Prop::Entry.as_str())
        .and_then(|v| v.parse().ok())
        .unwrap_or(i64::MAX)
}

/// A point-in-time copy of the working set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingSet {
    by_index: Vec<Option<Uuid>>,
    by_uuid: HashMap<Uuid, usize>,
}

impl WorkingSet {
    pub(crate) fn new(by_index: Vec<Option<Uuid>>) -> Self {
        let by_uuid = by_index
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.map(|uuid| (uuid, index)))
            .collect();
        Self { by_index, by_uuid }
    }

    /// Number of live entries (holes excluded)
    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }

    /// Highest index in use, holes included; 0 when empty
    pub fn largest_index(&self) -> usize {
        self.by_index.len().saturating_sub(1)
    }

    pub fn by_index(&self, index: usize) -> Option<Uuid> {
        if index == 0 {
            return None;
        }
        self.by_index.get(index).copied().flatten()
    }

    /// Index of `uuid`, or 0 when it is not in the set
    pub fn by_uuid(&self, uuid: Uuid) -> usize {
        self.by_uuid.get(&uuid).copied().unwrap_or(0)
    }

    /// Live `(index, uuid)` pairs in index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, Uuid)> + '_ {
        self.by_index
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.map(|uuid| (index, uuid)))
    }
}
