//! Sync servers.
//!
//! A server keeps a single chain of versions, each holding one batch of
//! operations pushed by some replica. Replicas call [`Server::exchange`] to
//! push their unsynced operations and receive every version they have not
//! seen yet. The transport is chosen once, from a [`ServerConfig`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::storage::TaskStorage;

mod crypto;
pub mod local;
pub mod remote;

pub use local::LocalServer;
pub use remote::RemoteServer;

/// Versions in a chain before a fresh replica is offered a snapshot
pub const DEFAULT_SNAPSHOT_THRESHOLD: usize = 100;

/// What a replica sends in one exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    /// Last version the replica has merged; nil if it never synced
    pub sync_key: Uuid,
    /// Name for the pushed batch, stable across retries of the same batch
    pub version_id: Uuid,
    /// Unsynced local operations, undo points removed
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub avoid_snapshots: bool,
}

/// One batch in the server's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: Uuid,
    pub parent_version_id: Uuid,
    pub operations: Vec<Operation>,
}

/// Full task state as of `version_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version_id: Uuid,
    pub tasks: TaskStorage,
}

/// How badly the server would like replicas to start from a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotUrgency {
    #[default]
    None,
    Low,
    High,
}

/// What the server sends back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    /// Head of the chain after this exchange
    pub sync_key: Uuid,
    /// Replaces local task state before `versions` are merged, when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    /// Versions the replica has not merged, in chain order, including its own
    pub versions: Vec<Version>,
    #[serde(default)]
    pub snapshot_urgency: SnapshotUrgency,
}

/// A sync peer
pub trait Server {
    /// Push local operations and fetch everything newer than `sync_key`.
    fn exchange(&mut self, request: ExchangeRequest) -> Result<ExchangeResponse>;

    /// Store a replica-built snapshot of the state as of `snapshot.version_id`.
    ///
    /// Servers that can read their own history build snapshots themselves
    /// and ignore this.
    fn add_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let _ = snapshot;
        Ok(())
    }
}

// =============================================================================
// Version chain
// =============================================================================

/// Server-side policy knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerPolicy {
    pub snapshot_threshold: usize,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        Self {
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
        }
    }
}

impl ServerPolicy {
    pub fn urgency(&self, chain_len: usize) -> SnapshotUrgency {
        let threshold = self.snapshot_threshold.max(1);
        if chain_len < threshold {
            SnapshotUrgency::None
        } else if chain_len < threshold * 2 {
            SnapshotUrgency::Low
        } else {
            SnapshotUrgency::High
        }
    }
}

/// The server's history: a single chain of versions, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionChain {
    versions: Vec<Version>,
}

impl VersionChain {
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    /// Latest version id, or nil for an empty chain
    pub fn head(&self) -> Uuid {
        self.versions
            .last()
            .map(|v| v.version_id)
            .unwrap_or_else(Uuid::nil)
    }

    fn position(&self, version_id: Uuid) -> Option<usize> {
        self.versions.iter().position(|v| v.version_id == version_id)
    }

    /// Task state after the first `upto` versions
    pub fn fold(&self, upto: usize) -> TaskStorage {
        let mut tasks = TaskStorage::default();
        for version in &self.versions[..upto.min(self.versions.len())] {
            for op in &version.operations {
                tasks.apply_lenient(op);
            }
        }
        tasks
    }

    /// Handle one exchange. Returns the response and whether the chain grew.
    ///
    /// A batch whose `version_id` is already in the chain is not appended
    /// again, so a replica that lost a response can safely resend it.
    pub fn exchange(
        &mut self,
        request: ExchangeRequest,
        policy: &ServerPolicy,
    ) -> Result<(ExchangeResponse, bool)> {
        let mut start = if request.sync_key.is_nil() {
            0
        } else {
            self.position(request.sync_key)
                .map(|pos| pos + 1)
                .ok_or(Error::UnknownSyncKey(request.sync_key))?
        };

        let mut grew = false;
        let own = if request.operations.is_empty() {
            None
        } else if let Some(pos) = self.position(request.version_id) {
            start = start.min(pos);
            Some(pos)
        } else {
            if request.version_id.is_nil() {
                return Err(Error::Sync("version id must not be nil".to_string()));
            }
            self.versions.push(Version {
                version_id: request.version_id,
                parent_version_id: self.head(),
                operations: request.operations,
            });
            grew = true;
            Some(self.versions.len() - 1)
        };

        let before_own = own.unwrap_or(self.versions.len());
        let snapshot = if request.sync_key.is_nil()
            && !request.avoid_snapshots
            && before_own > policy.snapshot_threshold
        {
            start = before_own;
            Some(Snapshot {
                version_id: self.versions[before_own - 1].version_id,
                tasks: self.fold(before_own),
            })
        } else {
            None
        };

        let response = ExchangeResponse {
            sync_key: self.head(),
            snapshot,
            versions: self.versions[start..].to_vec(),
            snapshot_urgency: policy.urgency(self.versions.len()),
        };
        Ok((response, grew))
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// How to reach a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerConfig {
    /// A directory on this machine
    Local {
        server_dir: PathBuf,
        policy: ServerPolicy,
    },
    /// An HTTP sync service
    Remote {
        origin: String,
        client_id: Uuid,
        /// Opaque secret; any bytes, not necessarily text. Used only to
        /// derive the payload key and never sent.
        encryption_secret: Vec<u8>,
        timeout_secs: Option<u64>,
    },
}

impl ServerConfig {
    /// Construct the server this configuration describes.
    ///
    /// No network traffic happens here.
    pub fn into_server(self) -> Result<AnyServer> {
        Ok(match self {
            ServerConfig::Local { server_dir, policy } => {
                AnyServer::Local(LocalServer::new(server_dir)?.with_policy(policy))
            }
            ServerConfig::Remote {
                origin,
                client_id,
                encryption_secret,
                timeout_secs,
            } => AnyServer::Remote(RemoteServer::new(
                origin,
                client_id,
                encryption_secret,
                timeout_secs,
            )?),
        })
    }
}

/// One of the supported transports
#[derive(Debug)]
pub enum AnyServer {
    Local(LocalServer),
    Remote(RemoteServer),
}

impl Server for AnyServer {
    fn exchange(&mut self, request: ExchangeRequest) -> Result<ExchangeResponse> {
        match self {
            AnyServer::Local(server) => server.exchange(request),
            AnyServer::Remote(server) => server.exchange(request),
        }
    }

    fn add_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        match self {
            AnyServer::Local(server) => server.add_snapshot(snapshot),
            AnyServer::Remote(server) => server.add_snapshot(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(uuid: Uuid) -> Vec<Operation> {
        vec![Operation::Create { uuid }]
    }

    fn request(sync_key: Uuid, version_id: Uuid, operations: Vec<Operation>) -> ExchangeRequest {
        ExchangeRequest {
            sync_key,
            version_id,
            operations,
            avoid_snapshots: true,
        }
    }

    #[test]
    fn chain_links_parents() {
        let mut chain = VersionChain::default();
        let policy = ServerPolicy::default();
        let v1 = Uuid::new_v4();
        let v2 = Uuid::new_v4();

        let (resp, grew) = chain
            .exchange(request(Uuid::nil(), v1, create(Uuid::new_v4())), &policy)
            .unwrap();
        assert!(grew);
        assert_eq!(resp.sync_key, v1);
        assert_eq!(resp.versions.len(), 1);

        let (resp, _) = chain
            .exchange(request(v1, v2, create(Uuid::new_v4())), &policy)
            .unwrap();
        assert_eq!(resp.sync_key, v2);
        assert_eq!(resp.versions.len(), 1);
        assert_eq!(resp.versions[0].parent_version_id, v1);
        assert_eq!(chain.head(), v2);
    }

    #[test]
    fn resent_batch_is_not_duplicated() {
        let mut chain = VersionChain::default();
        let policy = ServerPolicy::default();
        let v1 = Uuid::new_v4();
        let ops = create(Uuid::new_v4());

        chain
            .exchange(request(Uuid::nil(), v1, ops.clone()), &policy)
            .unwrap();
        let (resp, grew) = chain
            .exchange(request(Uuid::nil(), v1, ops), &policy)
            .unwrap();
        assert!(!grew);
        assert_eq!(chain.len(), 1);
        assert_eq!(resp.versions[0].version_id, v1);
    }

    #[test]
    fn unknown_sync_key_is_rejected() {
        let mut chain = VersionChain::default();
        let err = chain
            .exchange(
                request(Uuid::new_v4(), Uuid::new_v4(), Vec::new()),
                &ServerPolicy::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSyncKey(_)));
    }

    #[test]
    fn fresh_replica_gets_snapshot_past_threshold() {
        let mut chain = VersionChain::default();
        let policy = ServerPolicy {
            snapshot_threshold: 2,
        };
        let mut key = Uuid::nil();
        for _ in 0..3 {
            let id = Uuid::new_v4();
            chain
                .exchange(request(key, id, create(Uuid::new_v4())), &policy)
                .unwrap();
            key = id;
        }

        let mut fresh = request(Uuid::nil(), Uuid::new_v4(), Vec::new());
        fresh.avoid_snapshots = false;
        let (resp, _) = chain.exchange(fresh.clone(), &policy).unwrap();
        let snapshot = resp.snapshot.expect("snapshot");
        assert_eq!(snapshot.version_id, key);
        assert_eq!(snapshot.tasks.len(), 3);
        assert!(resp.versions.is_empty());
        assert_eq!(resp.snapshot_urgency, SnapshotUrgency::Low);

        fresh.avoid_snapshots = true;
        let (resp, _) = chain.exchange(fresh, &policy).unwrap();
        assert!(resp.snapshot.is_none());
        assert_eq!(resp.versions.len(), 3);
    }

    #[test]
    fn urgency_grows_with_history() {
        let policy = ServerPolicy {
            snapshot_threshold: 10,
        };
        assert_eq!(policy.urgency(0), SnapshotUrgency::None);
        assert_eq!(policy.urgency(10), SnapshotUrgency::Low);
        assert_eq!(policy.urgency(25), SnapshotUrgency::High);
    }
}
