//! Task storage and the replica's on-disk layout.
//!
//! # Directory Structure
//!
//! ```text
//! <replica dir>/
//!   state.json        # Checkpoint: tasks, working set, unsynced log, sync key
//!   oplog.jsonl       # Journal: one line per committed batch since the checkpoint
//!   replica.lock      # Held while a Replica has the directory open
//! ```
//!
//! The checkpoint is replaced atomically. The journal is appended and fsynced
//! before a batch takes effect in memory, so after a crash the replica is
//! rebuilt by loading the checkpoint and replaying newer journal entries.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lock::{self, FileLock};
use crate::operation::{LogEntry, Operation};
use crate::oplog::OpLog;
use crate::working_set::WorkingSetTable;

/// A task's properties, keyed by property name
pub type TaskMap = HashMap<String, String>;

/// Current checkpoint schema
pub const STATE_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Task storage
// =============================================================================

/// Materialized task state: the fold of every applied operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskStorage {
    tasks: BTreeMap<Uuid, TaskMap>,
}

impl TaskStorage {
    pub fn get(&self, uuid: &Uuid) -> Option<&TaskMap> {
        self.tasks.get(uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.tasks.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All tasks in uuid order
    pub fn all(&self) -> impl Iterator<Item = (&Uuid, &TaskMap)> + '_ {
        self.tasks.iter()
    }

    pub fn uuids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.tasks.keys().copied()
    }

    /// Fold one operation into storage.
    ///
    /// Creating a task that exists, or deleting/updating one that doesn't,
    /// is an error: replay must never apply the same operation twice.
    pub fn apply(&mut self, op: &Operation) -> Result<()> {
        match op {
            Operation::Create { uuid } => {
                if self.tasks.contains_key(uuid) {
                    return Err(Error::TaskExists(*uuid));
                }
                self.tasks.insert(*uuid, TaskMap::new());
            }
            Operation::Delete { uuid, .. } => {
                if self.tasks.remove(uuid).is_none() {
                    return Err(Error::TaskNotFound(*uuid));
                }
            }
            Operation::Update {
                uuid,
                property,
                value,
                ..
            } => {
                let task = self
                    .tasks
                    .get_mut(uuid)
                    .ok_or(Error::TaskNotFound(*uuid))?;
                match value {
                    Some(value) => {
                        task.insert(property.clone(), value.clone());
                    }
                    None => {
                        task.remove(property);
                    }
                }
            }
            Operation::UndoPoint => {}
        }
        Ok(())
    }

    /// Fold an operation that originated on another replica.
    ///
    /// Returns false, changing nothing, when it cannot apply here: a create
    /// for an existing task or a change to a missing one.
    pub fn apply_lenient(&mut self, op: &Operation) -> bool {
        self.apply(op).is_ok()
    }
}

impl FromIterator<(Uuid, TaskMap)> for TaskStorage {
    fn from_iter<I: IntoIterator<Item = (Uuid, TaskMap)>>(iter: I) -> Self {
        Self {
            tasks: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Checkpoint
// =============================================================================

/// Everything a replica persists in its checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub schema_version: u32,
    /// Stable identity of this replica, used to name its sync batches
    pub replica_id: Uuid,
    /// Last server version this replica has merged; nil if never synced
    pub sync_key: Uuid,
    #[serde(default)]
    pub tasks: TaskStorage,
    #[serde(default)]
    pub working_set: WorkingSetTable,
    #[serde(default)]
    pub oplog: OpLog,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            replica_id: Uuid::new_v4(),
            sync_key: Uuid::nil(),
            tasks: TaskStorage::default(),
            working_set: WorkingSetTable::default(),
            oplog: OpLog::default(),
        }
    }
}

impl Default for ReplicaState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Replica directory
// =============================================================================

/// Paths and file I/O for one on-disk replica directory
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_file(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    pub fn journal_file(&self) -> PathBuf {
        self.dir.join("oplog.jsonl")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.dir.join("replica.lock")
    }

    /// Create the directory if needed and take its exclusive lock.
    pub fn open(&self) -> Result<FileLock> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::Storage(format!(
                "cannot create replica directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;
        if !self.dir.is_dir() {
            return Err(Error::Storage(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        FileLock::try_acquire(self.lock_file())?
            .ok_or_else(|| Error::LockFailed(self.lock_file()))
    }

    // =========================================================================
    // Checkpoint
    // =========================================================================

    pub fn read_state(&self) -> Result<Option<ReplicaState>> {
        let path = self.state_file();
        if !path.exists() {
            return Ok(None);
        }
        let state: ReplicaState = read_json(&path)?;
        if state.schema_version > STATE_SCHEMA_VERSION {
            return Err(Error::Storage(format!(
                "{} has schema version {}, newer than supported {}",
                path.display(),
                state.schema_version,
                STATE_SCHEMA_VERSION
            )));
        }
        Ok(Some(state))
    }

    pub fn write_state(&self, state: &ReplicaState) -> Result<()> {
        write_json(&self.state_file(), state)
    }

    // =========================================================================
    // Journal
    // =========================================================================

    /// Durably append one batch as a single line.
    ///
    /// On failure the file is cut back to its previous length so a partial
    /// batch never survives.
    pub fn append_batch(&self, batch: &[LogEntry]) -> Result<()> {
        let path = self.journal_file();
        let mut line = serde_json::to_string(batch)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len_before = file.metadata()?.len();
        if let Err(err) = file
            .write_all(line.as_bytes())
            .and_then(|_| file.sync_all())
        {
            let _ = file.set_len(len_before);
            return Err(Error::Io(err));
        }
        Ok(())
    }

    /// Read every complete batch in the journal, in order.
    ///
    /// A malformed final line is a torn write that was never acknowledged
    /// and is skipped. A malformed line anywhere else is corruption.
    pub fn read_journal(&self) -> Result<Vec<LogEntry>> {
        let path = self.journal_file();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
        let last = lines.len().saturating_sub(1);

        let mut entries = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Vec<LogEntry>>(line) {
                Ok(batch) => entries.extend(batch),
                Err(err) if idx == last => {
                    tracing::warn!(path = %path.display(), error = %err, "discarding torn journal tail");
                }
                Err(err) => {
                    return Err(Error::Storage(format!(
                        "corrupt journal {} at line {}: {}",
                        path.display(),
                        idx + 1,
                        err
                    )));
                }
            }
        }
        Ok(entries)
    }

    /// Empty the journal once a checkpoint covers its contents.
    pub fn clear_journal(&self) -> Result<()> {
        let path = self.journal_file();
        if path.exists() {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(0)?;
            file.sync_all()?;
        }
        Ok(())
    }
}

// =============================================================================
// JSON helpers
// =============================================================================

/// Write a value as pretty JSON, atomically
pub fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)?;
    lock::write_atomic(path, json.as_bytes())
}

/// Read a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn update(uuid: Uuid, property: &str, value: Option<&str>) -> Operation {
        Operation::Update {
            uuid,
            property: property.to_string(),
            old_value: None,
            value: value.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn apply_folds_operations() {
        let mut storage = TaskStorage::default();
        let uuid = Uuid::new_v4();

        storage.apply(&Operation::Create { uuid }).unwrap();
        assert_eq!(storage.get(&uuid), Some(&TaskMap::new()));

        storage.apply(&update(uuid, "status", Some("pending"))).unwrap();
        storage.apply(&update(uuid, "wait", Some("5"))).unwrap();
        storage.apply(&update(uuid, "wait", None)).unwrap();
        let task = storage.get(&uuid).unwrap();
        assert_eq!(task.get("status").map(String::as_str), Some("pending"));
        assert!(!task.contains_key("wait"));

        storage
            .apply(&Operation::Delete {
                uuid,
                old_task: TaskMap::new(),
            })
            .unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn apply_rejects_impossible_operations() {
        let mut storage = TaskStorage::default();
        let uuid = Uuid::new_v4();

        assert!(matches!(
            storage.apply(&update(uuid, "status", Some("pending"))),
            Err(Error::TaskNotFound(_))
        ));
        storage.apply(&Operation::Create { uuid }).unwrap();
        assert!(matches!(
            storage.apply(&Operation::Create { uuid }),
            Err(Error::TaskExists(_))
        ));
    }

    #[test]
    fn state_round_trips_through_disk() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().join("replica"));
        let _lock = storage.open().unwrap();
        assert!(storage.read_state().unwrap().is_none());

        let mut state = ReplicaState::new();
        let uuid = Uuid::new_v4();
        state.tasks.apply(&Operation::Create { uuid }).unwrap();
        state.oplog.append(Operation::Create { uuid });
        storage.write_state(&state).unwrap();

        assert_eq!(storage.read_state().unwrap(), Some(state));
    }

    #[test]
    fn second_open_is_refused() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path());
        let _lock = storage.open().unwrap();
        assert!(matches!(storage.open(), Err(Error::LockFailed(_))));
    }

    #[test]
    fn journal_skips_torn_tail() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path());
        let uuid = Uuid::new_v4();

        storage
            .append_batch(&[LogEntry {
                seq: 1,
                op: Operation::Create { uuid },
            }])
            .unwrap();
        storage
            .append_batch(&[LogEntry {
                seq: 2,
                op: update(uuid, "status", Some("pending")),
            }])
            .unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(storage.journal_file())
            .unwrap();
        file.write_all(b"[{\"seq\":3,\"op\":{\"ty").unwrap();

        let entries = storage.read_journal().unwrap();
        assert_eq!(entries.len(), 2);

        storage.clear_journal().unwrap();
        assert!(storage.read_journal().unwrap().is_empty());
    }

    #[test]
    fn journal_corruption_before_tail_is_an_error() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path());
        fs::write(storage.journal_file(), "garbage\n[]\n").unwrap();
        assert!(matches!(storage.read_journal(), Err(Error::Storage(_))));
    }
}
