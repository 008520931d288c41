//! HTTP sync service client.
//!
//! One blocking `POST {origin}/v1/client/exchange` per exchange, JSON in and
//! out. The client id travels in `X-Client-Id`. Operations and snapshots
//! cross the wire only as sealed, base64-encoded envelopes; the server sees
//! version ids and chain structure, never task data or the secret.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::server::crypto::Cryptor;
use crate::server::{
    ExchangeRequest, ExchangeResponse, Server, Snapshot, SnapshotUrgency, Version,
};
use crate::storage::TaskStorage;

const USER_AGENT: &str = concat!("tasksync/", env!("CARGO_PKG_VERSION"));
const EXCHANGE_PATH: &str = "/v1/client/exchange";
const SNAPSHOT_PATH: &str = "/v1/client/add-snapshot";

#[derive(Serialize)]
struct WireRequest {
    sync_key: Uuid,
    version_id: Uuid,
    /// Sealed operations; absent when there is nothing to push
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    avoid_snapshots: bool,
}

#[derive(Serialize, Deserialize)]
struct WireVersion {
    version_id: Uuid,
    parent_version_id: Uuid,
    payload: String,
}

#[derive(Serialize, Deserialize)]
struct WireSnapshot {
    version_id: Uuid,
    payload: String,
}

#[derive(Deserialize)]
struct WireResponse {
    sync_key: Uuid,
    #[serde(default)]
    snapshot: Option<WireSnapshot>,
    #[serde(default)]
    versions: Vec<WireVersion>,
    #[serde(default)]
    snapshot_urgency: SnapshotUrgency,
}

pub struct RemoteServer {
    origin: String,
    client_id: Uuid,
    cryptor: Cryptor,
    agent: ureq::Agent,
}

impl fmt::Debug for RemoteServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteServer")
            .field("origin", &self.origin)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl RemoteServer {
    /// Describe a remote server. No connection is made until `exchange`.
    ///
    /// Derives the payload key from `encryption_secret` up front.
    /// `timeout_secs` bounds each request; without it a stalled server
    /// blocks the caller indefinitely.
    pub fn new(
        origin: impl Into<String>,
        client_id: Uuid,
        encryption_secret: Vec<u8>,
        timeout_secs: Option<u64>,
    ) -> Result<Self> {
        let origin = origin.into().trim_end_matches('/').to_string();
        if !(origin.starts_with("http://") || origin.starts_with("https://")) {
            return Err(Error::InvalidConfig(format!(
                "server origin must start with http:// or https://: {}",
                origin
            )));
        }
        let cryptor = Cryptor::new(client_id, &encryption_secret)?;

        let mut builder = ureq::AgentBuilder::new().user_agent(USER_AGENT);
        if let Some(secs) = timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            origin,
            client_id,
            cryptor,
            agent: builder.build(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn seal<T: Serialize>(&self, version_id: Uuid, value: &T) -> Result<String> {
        let plaintext = serde_json::to_vec(value)?;
        Ok(STANDARD.encode(self.cryptor.seal(version_id, &plaintext)?))
    }

    fn unseal<T: serde::de::DeserializeOwned>(&self, version_id: Uuid, payload: &str) -> Result<T> {
        let sealed = STANDARD.decode(payload).map_err(|e| {
            Error::Sync(format!("payload for version {} is not base64: {}", version_id, e))
        })?;
        let plaintext = self.cryptor.unseal(version_id, &sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn post<T: Serialize>(&self, path: &str, body: &T, sync_key: Uuid) -> Result<ureq::Response> {
        let url = format!("{}{}", self.origin, path);
        let response = self
            .agent
            .post(&url)
            .set("X-Client-Id", &self.client_id.to_string())
            .set("Accept", "application/json")
            .send_json(body);

        match response {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::Status(404, _)) => Err(Error::UnknownSyncKey(sync_key)),
            Err(ureq::Error::Status(401, _)) | Err(ureq::Error::Status(403, _)) => Err(
                Error::Sync(format!("server rejected client {}", self.client_id)),
            ),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(Error::Http(format!("HTTP {}: {}", code, body)))
            }
            Err(e) => Err(Error::Http(e.to_string())),
        }
    }
}

impl Server for RemoteServer {
    fn exchange(&mut self, request: ExchangeRequest) -> Result<ExchangeResponse> {
        tracing::debug!(origin = %self.origin, ops = request.operations.len(), "posting exchange");

        let payload = if request.operations.is_empty() {
            None
        } else {
            Some(self.seal(request.version_id, &request.operations)?)
        };
        let wire = WireRequest {
            sync_key: request.sync_key,
            version_id: request.version_id,
            payload,
            avoid_snapshots: request.avoid_snapshots,
        };

        let response: WireResponse = self
            .post(EXCHANGE_PATH, &wire, request.sync_key)?
            .into_json()
            .map_err(|e| Error::Http(format!("invalid exchange response: {}", e)))?;

        let snapshot = match response.snapshot {
            Some(snapshot) => Some(Snapshot {
                version_id: snapshot.version_id,
                tasks: self.unseal::<TaskStorage>(snapshot.version_id, &snapshot.payload)?,
            }),
            None => None,
        };
        let versions = response
            .versions
            .into_iter()
            .map(|version| {
                Ok(Version {
                    version_id: version.version_id,
                    parent_version_id: version.parent_version_id,
                    operations: self
                        .unseal::<Vec<Operation>>(version.version_id, &version.payload)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ExchangeResponse {
            sync_key: response.sync_key,
            snapshot,
            versions,
            snapshot_urgency: response.snapshot_urgency,
        })
    }

    fn add_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        tracing::debug!(version = %snapshot.version_id, tasks = snapshot.tasks.len(), "uploading snapshot");
        let wire = WireSnapshot {
            version_id: snapshot.version_id,
            payload: self.seal(snapshot.version_id, &snapshot.tasks)?,
        };
        self.post(SNAPSHOT_PATH, &wire, snapshot.version_id)?;
        Ok(())
    }
}
