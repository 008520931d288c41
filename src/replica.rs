//! The replica: one local task database.
//!
//! Every mutation becomes a batch of operations that is applied to the
//! in-memory state, journaled durably (on-disk replicas), and appended to the
//! log, all or nothing. Undo, working-set rebuilds and sync compute a new
//! state off to the side and swap it in only after the checkpoint that holds
//! it has been written.

use std::cell::OnceCell;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::dependency::DependencyMap;
use crate::error::{Error, Result};
use crate::lock::FileLock;
use crate::operation::{LogEntry, Operation};
use crate::server::Server;
use crate::storage::{ReplicaState, Storage, TaskMap, TaskStorage};
use crate::sync;
use crate::task::{timestamp_to_value, Prop, Status, Task};
use crate::working_set::{is_eligible, WorkingSet, WorkingSetTable};

/// Journal batches written before the state is checkpointed again
const CHECKPOINT_INTERVAL: usize = 64;

/// Deleted tasks untouched for this long are purged by `expire_tasks`
const EXPIRY_DAYS: i64 = 180;

struct DiskReplica {
    storage: Storage,
    _lock: FileLock,
    journal_batches: usize,
}

/// A local replica of the task database
pub struct Replica {
    state: ReplicaState,
    disk: Option<DiskReplica>,
    /// Built on first use, dropped whenever tasks change
    depmap: OnceCell<Arc<DependencyMap>>,
}

/// Fold one local operation into the state, including its working-set effect.
///
/// Used both for fresh mutations and for journal replay so the two agree.
fn apply_local(state: &mut ReplicaState, op: &Operation) -> Result<()> {
    state.tasks.apply(op)?;
    match op {
        Operation::Update {
            uuid,
            property,
            value: Some(value),
            ..
        } if property == Prop::Status.as_str() && Status::from_taskmap(value) == Status::Pending => {
            state.working_set.add(*uuid);
        }
        Operation::Delete { uuid, .. } => {
            state.working_set.clear(uuid);
        }
        _ => {}
    }
    Ok(())
}

/// Bring the working set in line with storage for `uuids` after a batch was
/// folded in without [`apply_local`]: gone tasks leave holes, pending tasks
/// get an index if they lack one.
fn settle_working_set(state: &mut ReplicaState, uuids: impl IntoIterator<Item = Uuid>) {
    for uuid in uuids {
        match state.tasks.get(&uuid) {
            None => state.working_set.clear(&uuid),
            Some(task) if is_eligible(task) => {
                state.working_set.add(uuid);
            }
            Some(_) => {}
        }
    }
}

impl Replica {
    /// A replica that lives only as long as this value
    pub fn new_in_memory() -> Self {
        Self {
            state: ReplicaState::new(),
            disk: None,
            depmap: OnceCell::new(),
        }
    }

    /// Open (or create) a replica stored in `path`.
    ///
    /// Holds an exclusive lock on the directory until dropped. Journal
    /// entries newer than the last checkpoint are replayed.
    pub fn new_on_disk(path: impl AsRef<Path>) -> Result<Self> {
        let storage = Storage::new(path.as_ref());
        let lock = storage.open()?;

        let (mut state, fresh) = match storage.read_state()? {
            Some(state) => (state, false),
            None => (ReplicaState::new(), true),
        };

        let mut replayed = 0;
        for entry in storage.read_journal()? {
            if entry.seq <= state.oplog.high_water() {
                continue;
            }
            apply_local(&mut state, &entry.op).map_err(|err| {
                Error::Storage(format!(
                    "journal entry {} does not apply to checkpoint: {}",
                    entry.seq, err
                ))
            })?;
            state.oplog.extend([entry]);
            replayed += 1;
        }
        if replayed > 0 {
            tracing::warn!(path = %storage.dir().display(), replayed, "recovered operations from journal");
        }
        if fresh {
            storage.write_state(&state)?;
        }
        tracing::debug!(
            path = %storage.dir().display(),
            tasks = state.tasks.len(),
            pending_ops = state.oplog.num_operations(),
            "opened replica"
        );

        Ok(Self {
            state,
            disk: Some(DiskReplica {
                storage,
                _lock: lock,
                journal_batches: replayed,
            }),
            depmap: OnceCell::new(),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get_task(&self, uuid: Uuid) -> Option<Task> {
        self.state
            .tasks
            .get(&uuid)
            .map(|taskmap| Task::new(uuid, taskmap.clone()).with_dependencies(&self.dependency_map()))
    }

    /// All tasks in uuid order
    pub fn all_tasks(&self) -> Vec<Task> {
        let depmap = self.dependency_map();
        self.state
            .tasks
            .all()
            .map(|(uuid, taskmap)| Task::new(*uuid, taskmap.clone()).with_dependencies(&depmap))
            .collect()
    }

    /// Dependencies among pending tasks, as of the current state
    pub fn dependency_map(&self) -> Arc<DependencyMap> {
        self.depmap
            .get_or_init(|| Arc::new(DependencyMap::build(&self.state.tasks)))
            .clone()
    }

    pub fn all_task_uuids(&self) -> Vec<Uuid> {
        self.state.tasks.uuids().collect()
    }

    pub fn task_storage(&self) -> &TaskStorage {
        &self.state.tasks
    }

    /// The unsynced local log, oldest first
    pub fn operations(&self) -> &[LogEntry] {
        self.state.oplog.entries()
    }

    /// Operations recorded locally and not yet confirmed by a server
    pub fn num_local_operations(&self) -> usize {
        self.state.oplog.num_operations()
    }

    pub fn sync_key(&self) -> Uuid {
        self.state.sync_key
    }

    pub fn replica_id(&self) -> Uuid {
        self.state.replica_id
    }

    pub fn working_set(&self) -> WorkingSet {
        self.state.working_set.snapshot()
    }

    pub fn get_working_set_index(&self, uuid: Uuid) -> Option<usize> {
        self.state.working_set.index_of(&uuid)
    }

    pub fn get_working_set_task(&self, index: usize) -> Option<Task> {
        self.state
            .working_set
            .get(index)
            .and_then(|uuid| self.get_task(uuid))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create a task with a fresh uuid.
    ///
    /// Records `Create` and the initial properties as one batch.
    pub fn create_task(&mut self, status: Status, description: impl Into<String>) -> Result<Task> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "task description must not be empty".to_string(),
            ));
        }
        if let Status::Unknown(other) = &status {
            return Err(Error::InvalidArgument(format!(
                "cannot create a task with status '{}'",
                other
            )));
        }

        let uuid = Uuid::new_v4();
        let now = Utc::now();
        let props = [
            (Prop::Status, status.to_taskmap().to_string()),
            (Prop::Description, description),
            (Prop::Entry, timestamp_to_value(now)),
        ];
        let mut ops = vec![Operation::Create { uuid }];
        ops.extend(props.into_iter().map(|(prop, value)| Operation::Update {
            uuid,
            property: prop.as_str().to_string(),
            old_value: None,
            value: Some(value),
            timestamp: now,
        }));
        self.commit(ops)?;

        tracing::debug!(%uuid, "created task");
        self.get_task(uuid)
            .ok_or_else(|| Error::Storage(format!("task {} vanished after create", uuid)))
    }

    /// Create an empty task with a caller-chosen uuid.
    pub fn import_task_with_uuid(&mut self, uuid: Uuid) -> Result<Task> {
        if self.state.tasks.contains(&uuid) {
            return Err(Error::TaskExists(uuid));
        }
        self.commit(vec![Operation::Create { uuid }])?;
        Ok(Task::new(uuid, TaskMap::new()))
    }

    /// Remove a task from storage entirely.
    pub fn delete_task(&mut self, uuid: Uuid) -> Result<()> {
        let old_task = self
            .state
            .tasks
            .get(&uuid)
            .cloned()
            .ok_or(Error::TaskNotFound(uuid))?;
        self.commit(vec![Operation::Delete { uuid, old_task }])
    }

    /// Purge tasks that have sat deleted for [`EXPIRY_DAYS`] since they were
    /// last modified, as one undoable unit. Returns how many were purged.
    pub fn expire_tasks(&mut self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(EXPIRY_DAYS);
        let ops: Vec<Operation> = self
            .state
            .tasks
            .all()
            .filter(|(uuid, taskmap)| {
                let task = Task::new(**uuid, (*taskmap).clone());
                task.get_status() == Status::Deleted
                    && task.get_modified().map(|m| m < cutoff).unwrap_or(false)
            })
            .map(|(uuid, taskmap)| Operation::Delete {
                uuid: *uuid,
                old_task: taskmap.clone(),
            })
            .collect();
        if ops.is_empty() {
            return Ok(0);
        }

        let expired = ops.len();
        self.add_undo_point(false)?;
        self.commit(ops)?;
        tracing::info!(expired, "expired old deleted tasks");
        Ok(expired)
    }

    /// Record property changes on one task as a single batch.
    pub(crate) fn update_task(
        &mut self,
        uuid: Uuid,
        changes: Vec<(String, Option<String>)>,
    ) -> Result<TaskMap> {
        let mut scratch = self
            .state
            .tasks
            .get(&uuid)
            .cloned()
            .ok_or(Error::TaskNotFound(uuid))?;

        let timestamp = Utc::now();
        let mut ops = Vec::with_capacity(changes.len());
        for (property, value) in changes {
            let old_value = match &value {
                Some(v) => scratch.insert(property.clone(), v.clone()),
                None => scratch.remove(&property),
            };
            ops.push(Operation::Update {
                uuid,
                property,
                old_value,
                value,
                timestamp,
            });
        }
        self.commit(ops)?;
        Ok(scratch)
    }

    /// Mark the start of a new undoable unit.
    ///
    /// Unless `force` is set, nothing is recorded when the newest operation is
    /// already an undo point.
    pub fn add_undo_point(&mut self, force: bool) -> Result<()> {
        let redundant = self
            .state
            .oplog
            .last()
            .map(|e| e.op.is_undo_point())
            .unwrap_or(false);
        if redundant && !force {
            return Ok(());
        }
        self.commit(vec![Operation::UndoPoint])
    }

    /// Revert the most recent undoable unit of local operations.
    ///
    /// Returns false, changing nothing, when there is nothing to undo.
    pub fn undo(&mut self) -> Result<bool> {
        let mut staged = self.state.clone();
        let popped = staged.oplog.pop_undo_unit();
        if popped.is_empty() {
            return Ok(false);
        }

        let mut touched = Vec::new();
        for entry in popped.iter().rev() {
            for op in entry.op.inverse() {
                staged.tasks.apply(&op)?;
                touched.extend(op.uuid());
            }
        }
        settle_working_set(&mut staged, touched);
        self.persist_state(staged)?;

        tracing::info!(
            undone = popped.iter().filter(|e| !e.op.is_undo_point()).count(),
            "undid local operations"
        );
        Ok(true)
    }

    /// Recompute working-set indices; see [`crate::working_set::WorkingSetTable::rebuild`].
    pub fn rebuild_working_set(&mut self, renumber: bool) -> Result<()> {
        let mut rebuilt = self.state.working_set.clone();
        rebuilt.rebuild(&self.state.tasks, renumber);
        let previous = std::mem::replace(&mut self.state.working_set, rebuilt);
        if let Err(err) = self.checkpoint() {
            self.state.working_set = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Exchange local operations with `server` and merge what it sends back.
    ///
    /// On any failure the replica is left exactly as it was.
    pub fn sync(&mut self, server: &mut dyn Server, avoid_snapshots: bool) -> Result<()> {
        let staged = sync::sync(&self.state, server, avoid_snapshots)?;
        self.persist_state(staged)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write the full state and empty the journal.
    pub fn checkpoint(&mut self) -> Result<()> {
        if let Some(disk) = self.disk.as_mut() {
            disk.storage.write_state(&self.state)?;
            if let Err(err) = disk.storage.clear_journal() {
                // Entries at or below the checkpoint are skipped on replay.
                tracing::warn!(error = %err, "failed to clear journal after checkpoint");
            }
            disk.journal_batches = 0;
        }
        Ok(())
    }

    /// Replace the whole state, durably first.
    fn persist_state(&mut self, state: ReplicaState) -> Result<()> {
        self.depmap.take();
        let previous = std::mem::replace(&mut self.state, state);
        if let Err(err) = self.checkpoint() {
            self.state = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Apply, journal and log a batch of operations, all or nothing.
    fn commit(&mut self, ops: Vec<Operation>) -> Result<()> {
        self.depmap.take();
        let entries = self.state.oplog.number(ops);
        let working_set = self.state.working_set.clone();

        for (applied, entry) in entries.iter().enumerate() {
            tracing::trace!(seq = entry.seq, op = ?entry.op, "apply operation");
            if let Err(err) = apply_local(&mut self.state, &entry.op) {
                self.roll_back(&entries[..applied], working_set);
                return Err(err);
            }
        }

        let journaled = match &self.disk {
            Some(disk) => disk.storage.append_batch(&entries),
            None => Ok(()),
        };
        if let Err(err) = journaled {
            self.roll_back(&entries, working_set);
            return Err(err);
        }

        self.state.oplog.extend(entries);
        self.maybe_checkpoint();
        Ok(())
    }

    fn roll_back(&mut self, applied: &[LogEntry], working_set: WorkingSetTable) {
        for entry in applied.iter().rev() {
            for op in entry.op.inverse() {
                if let Err(err) = self.state.tasks.apply(&op) {
                    tracing::error!(seq = entry.seq, error = %err, "rollback failed");
                }
            }
        }
        self.state.working_set = working_set;
    }

    fn maybe_checkpoint(&mut self) {
        let due = match self.disk.as_mut() {
            Some(disk) => {
                disk.journal_batches += 1;
                disk.journal_batches >= CHECKPOINT_INTERVAL
            }
            None => false,
        };
        if due {
            // The batch is already durable in the journal; retry next time.
            if let Err(err) = self.checkpoint() {
                tracing::warn!(error = %err, "periodic checkpoint failed");
            }
        }
    }
}
