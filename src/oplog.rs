//! The local operation log.
//!
//! Holds every operation recorded since the last successful sync, in append
//! order. The replica persists it two ways: new batches go to the journal
//! (`oplog.jsonl`) before they take effect, and the whole log is part of each
//! checkpoint (`state.json`). Undo and prefix truncation only change the
//! in-memory log, so callers checkpoint afterwards to make them durable.

use serde::{Deserialize, Serialize};

use crate::operation::{LogEntry, Operation};

/// Ordered, sequence-numbered operations not yet confirmed by a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpLog {
    next_seq: u64,
    #[serde(default)]
    entries: Vec<LogEntry>,
}

impl Default for OpLog {
    fn default() -> Self {
        Self {
            next_seq: 1,
            entries: Vec::new(),
        }
    }
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence number ever assigned (0 if none).
    pub fn high_water(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    /// Number the given operations as the next entries without recording them.
    pub(crate) fn number(&self, ops: Vec<Operation>) -> Vec<LogEntry> {
        ops.into_iter()
            .zip(self.next_seq..)
            .map(|(op, seq)| LogEntry { seq, op })
            .collect()
    }

    /// Record already-numbered entries as the newest in the log.
    ///
    /// Entries at or below the high-water mark are ignored; this is what
    /// makes journal replay after a checkpoint safe.
    pub(crate) fn extend(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        for entry in entries {
            if entry.seq < self.next_seq {
                continue;
            }
            self.next_seq = entry.seq + 1;
            self.entries.push(entry);
        }
    }

    /// Record one operation and return its entry.
    pub fn append(&mut self, op: Operation) -> &LogEntry {
        let entries = self.number(vec![op]);
        self.extend(entries);
        &self.entries[self.entries.len() - 1]
    }

    /// Entries newer than `marker`, oldest first.
    ///
    /// Pass 0 to iterate the whole log. Each call starts a fresh iterator.
    pub fn operations_since(&self, marker: u64) -> impl Iterator<Item = &LogEntry> + '_ {
        let start = self.entries.partition_point(|e| e.seq <= marker);
        self.entries[start..].iter()
    }

    /// Drop every entry at or before `upto`.
    ///
    /// Returns false and leaves the log untouched when no entry has that
    /// sequence number.
    pub fn truncate_synced_prefix(&mut self, upto: u64) -> bool {
        match self.entries.iter().position(|e| e.seq == upto) {
            Some(pos) => {
                self.entries.drain(..=pos);
                true
            }
            None => false,
        }
    }

    /// Remove the most recent undoable unit and return it, oldest first.
    ///
    /// Trailing undo points with nothing after them are skipped, then
    /// everything back to and including the previous undo point is removed.
    /// Returns an empty vec, leaving the log untouched, when nothing is
    /// undoable.
    pub(crate) fn pop_undo_unit(&mut self) -> Vec<LogEntry> {
        let mut end = self.entries.len();
        while end > 0 && self.entries[end - 1].op.is_undo_point() {
            end -= 1;
        }
        if end == 0 {
            return Vec::new();
        }

        let mut start = end;
        while start > 0 && !self.entries[start - 1].op.is_undo_point() {
            start -= 1;
        }
        self.entries.split_off(start.saturating_sub(1))
    }

    /// Count of recorded operations, excluding undo points
    pub fn num_operations(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.op.is_undo_point())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn set(uuid: Uuid, value: &str) -> Operation {
        Operation::Update {
            uuid,
            property: "description".to_string(),
            old_value: None,
            value: Some(value.to_string()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn append_assigns_increasing_seqs() {
        let mut log = OpLog::new();
        let uuid = Uuid::new_v4();
        assert_eq!(log.append(Operation::Create { uuid }).seq, 1);
        assert_eq!(log.append(set(uuid, "a")).seq, 2);
        assert_eq!(log.high_water(), 2);
        assert_eq!(log.num_operations(), 2);
    }

    #[test]
    fn operations_since_is_restartable() {
        let mut log = OpLog::new();
        let uuid = Uuid::new_v4();
        log.append(Operation::Create { uuid });
        log.append(Operation::UndoPoint);
        log.append(set(uuid, "a"));

        let seqs: Vec<u64> = log.operations_since(1).map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(log.operations_since(1).count(), 2);
        assert_eq!(log.operations_since(0).count(), 3);
        assert_eq!(log.operations_since(3).count(), 0);
    }

    #[test]
    fn truncate_unknown_marker_is_noop() {
        let mut log = OpLog::new();
        let uuid = Uuid::new_v4();
        log.append(Operation::Create { uuid });
        log.append(set(uuid, "a"));
        let before = log.clone();

        assert!(!log.truncate_synced_prefix(99));
        assert_eq!(log, before);

        assert!(log.truncate_synced_prefix(1));
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].seq, 2);
        // seqs are never reused after truncation
        assert_eq!(log.append(set(uuid, "b")).seq, 3);
    }

    #[test]
    fn pop_undo_unit_stops_at_undo_point() {
        let mut log = OpLog::new();
        let uuid = Uuid::new_v4();
        log.append(Operation::Create { uuid });
        log.append(set(uuid, "x"));
        log.append(Operation::UndoPoint);
        log.append(set(uuid, "y"));

        let popped = log.pop_undo_unit();
        assert_eq!(popped.len(), 2);
        assert!(popped[0].op.is_undo_point());
        assert_eq!(log.entries().len(), 2);

        let popped = log.pop_undo_unit();
        assert_eq!(popped.len(), 2);
        assert!(log.is_empty());
        assert!(log.pop_undo_unit().is_empty());
    }

    #[test]
    fn pop_undo_unit_skips_empty_points() {
        let mut log = OpLog::new();
        let uuid = Uuid::new_v4();
        log.append(Operation::UndoPoint);
        log.append(Operation::Create { uuid });
        log.append(Operation::UndoPoint);
        log.append(Operation::UndoPoint);

        let popped = log.pop_undo_unit();
        assert_eq!(popped.len(), 4);
        assert!(log.is_empty());

        let mut only_points = OpLog::new();
        only_points.append(Operation::UndoPoint);
        assert!(only_points.pop_undo_unit().is_empty());
        assert_eq!(only_points.entries().len(), 1);
    }

    #[test]
    fn extend_ignores_already_recorded_entries() {
        let mut log = OpLog::new();
        let uuid = Uuid::new_v4();
        log.append(Operation::Create { uuid });
        let replay = vec![
            LogEntry {
                seq: 1,
                op: Operation::Create { uuid },
            },
            LogEntry {
                seq: 2,
                op: set(uuid, "a"),
            },
        ];
        log.extend(replay);
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.high_water(), 2);
    }
}
