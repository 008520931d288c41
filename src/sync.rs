//! Sync engine: push local operations, merge remote ones.
//!
//! The server appends this replica's batch to its chain, so in chain order
//! the batch comes after every version the replica had not yet seen and
//! before anything pushed later. Merging follows that order:
//!
//! - versions before ours apply, except `Update`s to a `(task, property)`
//!   our batch also changes (ours is later, so it wins);
//! - versions after ours apply unconditionally;
//! - `Create` of an existing task and changes to a missing task are ignored.
//!
//! All of it happens on a copy of the replica state. The caller commits the
//! copy only if everything succeeded, including a snapshot upload the server
//! asked for.

use std::collections::HashSet;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::server::{ExchangeRequest, Server, Snapshot, SnapshotUrgency};
use crate::storage::{ReplicaState, TaskStorage};

/// Name a pushed batch so that resending it after a lost response is
/// recognised by the server.
fn batch_version_id(state: &ReplicaState, first_seq: u64, last_seq: u64) -> Uuid {
    let name = format!("{}:{}-{}", state.sync_key, first_seq, last_seq);
    Uuid::new_v5(&state.replica_id, name.as_bytes())
}

fn merge_remote(
    tasks: &mut TaskStorage,
    op: &Operation,
    shadowed: Option<&HashSet<(Uuid, &str)>>,
) {
    if let (Some(shadowed), Operation::Update { uuid, property, .. }) = (shadowed, op) {
        if shadowed.contains(&(*uuid, property.as_str())) {
            tracing::debug!(%uuid, %property, "remote update superseded by local change");
            return;
        }
    }
    if !tasks.apply_lenient(op) {
        match op {
            Operation::Update { uuid, property, .. } => {
                tracing::warn!(%uuid, %property, "ignoring remote update to missing task");
            }
            Operation::Create { uuid } => {
                tracing::warn!(%uuid, "ignoring remote create of existing task");
            }
            Operation::Delete { uuid, .. } => {
                tracing::debug!(%uuid, "remote delete of missing task");
            }
            Operation::UndoPoint => {}
        }
    }
}

/// Run one exchange against `server` and return the merged state.
///
/// `state` itself is never modified.
pub(crate) fn sync(
    state: &ReplicaState,
    server: &mut dyn Server,
    avoid_snapshots: bool,
) -> Result<ReplicaState> {
    let pending: Vec<_> = state.oplog.operations_since(0).collect();
    let operations: Vec<Operation> = pending
        .iter()
        .filter(|e| !e.op.is_undo_point())
        .map(|e| e.op.clone())
        .collect();
    let version_id = match (pending.first(), pending.last()) {
        (Some(first), Some(last)) if !operations.is_empty() => {
            batch_version_id(state, first.seq, last.seq)
        }
        _ => Uuid::nil(),
    };

    tracing::info!(
        sync_key = %state.sync_key,
        ops = operations.len(),
        "starting sync"
    );

    let response = server.exchange(ExchangeRequest {
        sync_key: state.sync_key,
        version_id,
        operations: operations.clone(),
        avoid_snapshots,
    })?;

    let mut staged = state.clone();

    if let Some(snapshot) = response.snapshot {
        tracing::info!(version = %snapshot.version_id, tasks = snapshot.tasks.len(), "applying snapshot");
        staged.tasks = snapshot.tasks;
        // Local changes are newer than anything in the snapshot.
        for op in &operations {
            merge_remote(&mut staged.tasks, op, None);
        }
    }

    let shadowed: HashSet<(Uuid, &str)> = operations
        .iter()
        .filter_map(|op| match op {
            Operation::Update { uuid, property, .. } => Some((*uuid, property.as_str())),
            _ => None,
        })
        .collect();

    let mut seen_own = false;
    let mut merged = 0usize;
    for version in &response.versions {
        if !operations.is_empty() && version.version_id == version_id {
            if seen_own {
                return Err(Error::Sync(format!(
                    "server returned version {} twice",
                    version_id
                )));
            }
            seen_own = true;
            continue;
        }
        let guard = if seen_own { None } else { Some(&shadowed) };
        for op in &version.operations {
            merge_remote(&mut staged.tasks, op, guard);
            merged += 1;
        }
    }

    if !operations.is_empty() && !seen_own {
        return Err(Error::Sync(
            "server response does not include the pushed operations".to_string(),
        ));
    }

    staged.sync_key = response.sync_key;
    if let Some(last) = pending.last() {
        staged.oplog.truncate_synced_prefix(last.seq);
    }
    staged.working_set.rebuild(&staged.tasks, false);

    // Replicas that avoid snapshots only help out when the server insists.
    let wanted = if avoid_snapshots {
        SnapshotUrgency::High
    } else {
        SnapshotUrgency::Low
    };
    if response.snapshot_urgency >= wanted && !staged.sync_key.is_nil() {
        tracing::info!(urgency = ?response.snapshot_urgency, "sending snapshot");
        server.add_snapshot(Snapshot {
            version_id: staged.sync_key,
            tasks: staged.tasks.clone(),
        })?;
    }
    tracing::info!(
        sync_key = %staged.sync_key,
        pushed = operations.len(),
        merged,
        "sync complete"
    );
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ExchangeResponse, ServerPolicy, VersionChain};

    struct MemoryServer {
        chain: VersionChain,
    }

    impl Server for MemoryServer {
        fn exchange(&mut self, request: ExchangeRequest) -> Result<ExchangeResponse> {
            Ok(self.chain.exchange(request, &ServerPolicy::default())?.0)
        }
    }

    #[test]
    fn batch_ids_are_deterministic() {
        let state = ReplicaState::new();
        assert_eq!(batch_version_id(&state, 1, 4), batch_version_id(&state, 1, 4));
        assert_ne!(batch_version_id(&state, 1, 4), batch_version_id(&state, 1, 5));
    }

    #[test]
    fn sync_truncates_log_and_advances_key() {
        let mut state = ReplicaState::new();
        let uuid = Uuid::new_v4();
        let op = Operation::Create { uuid };
        state.tasks.apply(&op).unwrap();
        state.oplog.append(Operation::UndoPoint);
        state.oplog.append(op);

        let mut server = MemoryServer {
            chain: VersionChain::default(),
        };
        let staged = sync(&state, &mut server, true).unwrap();
        assert!(staged.oplog.is_empty());
        assert_eq!(staged.oplog.high_water(), 2);
        assert_eq!(staged.sync_key, server.chain.head());
        assert_eq!(server.chain.versions()[0].operations.len(), 1);
        // input untouched
        assert_eq!(state.oplog.entries().len(), 2);
    }

    #[test]
    fn urgent_server_receives_snapshot() {
        struct Urgent {
            chain: VersionChain,
            urgency: SnapshotUrgency,
            snapshots: Vec<Snapshot>,
        }
        impl Server for Urgent {
            fn exchange(&mut self, request: ExchangeRequest) -> Result<ExchangeResponse> {
                let mut resp = self.chain.exchange(request, &ServerPolicy::default())?.0;
                resp.snapshot_urgency = self.urgency;
                Ok(resp)
            }
            fn add_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
                self.snapshots.push(snapshot);
                Ok(())
            }
        }

        let mut state = ReplicaState::new();
        let uuid = Uuid::new_v4();
        state.tasks.apply(&Operation::Create { uuid }).unwrap();
        state.oplog.append(Operation::Create { uuid });

        let mut server = Urgent {
            chain: VersionChain::default(),
            urgency: SnapshotUrgency::Low,
            snapshots: Vec::new(),
        };
        sync(&state, &mut server, true).unwrap();
        assert!(server.snapshots.is_empty());

        let staged = sync(&state, &mut server, false).unwrap();
        assert_eq!(server.snapshots.len(), 1);
        assert_eq!(server.snapshots[0].version_id, staged.sync_key);
        assert!(server.snapshots[0].tasks.get(&uuid).is_some());

        server.urgency = SnapshotUrgency::High;
        sync(&staged, &mut server, true).unwrap();
        assert_eq!(server.snapshots.len(), 2);
    }

    #[test]
    fn response_without_own_batch_is_an_error() {
        struct Forgetful;
        impl Server for Forgetful {
            fn exchange(&mut self, _request: ExchangeRequest) -> Result<ExchangeResponse> {
                Ok(ExchangeResponse {
                    sync_key: Uuid::new_v4(),
                    snapshot: None,
                    versions: Vec::new(),
                    snapshot_urgency: SnapshotUrgency::None,
                })
            }
        }

        let mut state = ReplicaState::new();
        let uuid = Uuid::new_v4();
        state.oplog.append(Operation::Create { uuid });
        state.tasks.apply(&Operation::Create { uuid }).unwrap();
        assert!(matches!(sync(&state, &mut Forgetful, false), Err(Error::Sync(_))));
    }
}
