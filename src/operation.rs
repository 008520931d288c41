//! Operations: the atomic units of change recorded in the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::TaskMap;

/// One recorded change to the task set.
///
/// Every variant carries enough prior state to be inverted, which is what
/// makes undo a matter of replaying inverses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// The task did not exist; afterward it exists with no properties.
    Create { uuid: Uuid },

    /// The task existed with `old_task`; afterward it does not exist.
    Delete { uuid: Uuid, old_task: TaskMap },

    /// One property transition. `None` means unset.
    Update {
        uuid: Uuid,
        property: String,
        old_value: Option<String>,
        value: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Delimits one undoable unit. Never synced.
    UndoPoint,
}

impl Operation {
    /// The task this operation touches, if any.
    pub fn uuid(&self) -> Option<Uuid> {
        match self {
            Operation::Create { uuid }
            | Operation::Delete { uuid, .. }
            | Operation::Update { uuid, .. } => Some(*uuid),
            Operation::UndoPoint => None,
        }
    }

    pub fn is_undo_point(&self) -> bool {
        matches!(self, Operation::UndoPoint)
    }

    /// Operations that, applied in order, exactly reverse this one.
    pub fn inverse(&self) -> Vec<Operation> {
        match self {
            Operation::Create { uuid } => vec![Operation::Delete {
                uuid: *uuid,
                old_task: TaskMap::new(),
            }],
            Operation::Delete { uuid, old_task } => {
                let now = Utc::now();
                let mut ops = vec![Operation::Create { uuid: *uuid }];
                let mut props: Vec<_> = old_task.iter().collect();
                props.sort();
                ops.extend(props.into_iter().map(|(property, value)| Operation::Update {
                    uuid: *uuid,
                    property: property.clone(),
                    old_value: None,
                    value: Some(value.clone()),
                    timestamp: now,
                }));
                ops
            }
            Operation::Update {
                uuid,
                property,
                old_value,
                value,
                timestamp,
            } => vec![Operation::Update {
                uuid: *uuid,
                property: property.clone(),
                old_value: value.clone(),
                value: old_value.clone(),
                timestamp: *timestamp,
            }],
            Operation::UndoPoint => Vec::new(),
        }
    }
}

/// An operation with its position in the local log.
///
/// Sequence numbers are assigned once and never reused, so they stay valid
/// as markers across undo and prefix truncation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub op: Operation,
}
