//! A server kept in a directory on this machine.
//!
//! ```text
//! <server dir>/
//!   versions.json     # The version chain
//!   server.lock       # Held for the duration of one exchange
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::lock::{FileLock, DEFAULT_LOCK_TIMEOUT_MS};
use crate::server::{ExchangeRequest, ExchangeResponse, Server, ServerPolicy, VersionChain};
use crate::storage::{read_json, write_json};

/// Directory-backed server shared by replicas on one filesystem
#[derive(Debug, Clone)]
pub struct LocalServer {
    dir: PathBuf,
    policy: ServerPolicy,
}

impl LocalServer {
    /// Use an existing, writable directory as a server.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::Storage(format!(
                "server directory {} does not exist",
                dir.display()
            )));
        }
        tempfile::NamedTempFile::new_in(&dir).map_err(|e| {
            Error::Storage(format!(
                "server directory {} is not writable: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir,
            policy: ServerPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: ServerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn chain_file(&self) -> PathBuf {
        self.dir.join("versions.json")
    }

    fn lock_file(&self) -> PathBuf {
        self.dir.join("server.lock")
    }

    /// Read the current chain
    pub fn chain(&self) -> Result<VersionChain> {
        let path = self.chain_file();
        if !path.exists() {
            return Ok(VersionChain::default());
        }
        read_json(&path)
    }
}

impl Server for LocalServer {
    fn exchange(&mut self, request: ExchangeRequest) -> Result<ExchangeResponse> {
        let _lock = FileLock::acquire(self.lock_file(), DEFAULT_LOCK_TIMEOUT_MS)?;
        let mut chain = self.chain()?;
        let (response, grew) = chain.exchange(request, &self.policy)?;
        if grew {
            write_json(&self.chain_file(), &chain)?;
            tracing::debug!(dir = %self.dir.display(), versions = chain.len(), "appended version");
        }
        Ok(response)
    }
}
