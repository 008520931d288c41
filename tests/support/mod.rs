#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use serde_json::Value;
use tasksync::error::{Error, Result};
use tasksync::server::{
    ExchangeRequest, ExchangeResponse, Server, ServerPolicy, VersionChain,
};
use tasksync::storage::TaskMap;
use tasksync::Replica;
use tempfile::TempDir;

/// A scratch directory holding replicas, a server directory and a config file
pub struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        fs::create_dir_all(dir.path().join("server")).expect("server dir");
        // Keep the CLI away from the user's own config file.
        fs::write(dir.path().join("tasksync.toml"), "").expect("empty config");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn replica_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join("replicas").join(name)
    }

    pub fn server_dir(&self) -> PathBuf {
        self.dir.path().join("server")
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("tasksync.toml")
    }

    /// Config pointing `sync` at this env's local server directory
    pub fn write_local_sync_config(&self) -> std::io::Result<PathBuf> {
        let contents = format!(
            "[sync]\nserver = \"local\"\nlocal_dir = {:?}\n",
            self.server_dir().display().to_string()
        );
        let path = self.config_path();
        fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn open(&self, name: &str) -> Replica {
        Replica::new_on_disk(self.replica_dir(name)).expect("open replica")
    }
}

/// `tsk` with its replica in `data_dir` and config from `env`
pub fn tsk_cmd(env: &TestEnv, replica: &str) -> Command {
    let mut cmd = Command::cargo_bin("tsk").expect("binary");
    cmd.env("TSK_DATA_DIR", env.replica_dir(replica))
        .env("TSK_CONFIG", env.config_path())
        .env_remove("RUST_LOG");
    cmd
}

/// Run `tsk --json <args>` successfully and return the `data` payload.
pub fn tsk_json(env: &TestEnv, replica: &str, args: &[&str]) -> Value {
    let output = tsk_cmd(env, replica)
        .arg("--json")
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value: Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(value["status"], "success");
    value["data"].clone()
}

/// In-process server over a version chain
#[derive(Default)]
pub struct MemoryServer {
    pub chain: VersionChain,
    pub policy: ServerPolicy,
    pub exchanges: usize,
}

impl Server for MemoryServer {
    fn exchange(&mut self, request: ExchangeRequest) -> Result<ExchangeResponse> {
        self.exchanges += 1;
        Ok(self.chain.exchange(request, &self.policy)?.0)
    }
}

/// How a [`FlakyServer`] misbehaves on its next exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flake {
    /// Fail before the server records anything
    RefuseRequest,
    /// Record the batch, then lose the response
    DropResponse,
    /// Answer normally
    Healthy,
}

/// Server that follows a script of failures before behaving
pub struct FlakyServer {
    pub inner: MemoryServer,
    script: Vec<Flake>,
}

impl FlakyServer {
    pub fn new(script: Vec<Flake>) -> Self {
        Self {
            inner: MemoryServer::default(),
            script,
        }
    }
}

impl Server for FlakyServer {
    fn exchange(&mut self, request: ExchangeRequest) -> Result<ExchangeResponse> {
        let flake = if self.script.is_empty() {
            Flake::Healthy
        } else {
            self.script.remove(0)
        };
        match flake {
            Flake::RefuseRequest => Err(Error::Http("connection refused".to_string())),
            Flake::DropResponse => {
                self.inner.exchange(request)?;
                Err(Error::Http("connection reset by peer".to_string()))
            }
            Flake::Healthy => self.inner.exchange(request),
        }
    }
}

/// Every task's properties, for comparing replicas
pub fn all_taskmaps(replica: &Replica) -> Vec<(uuid::Uuid, TaskMap)> {
    let mut tasks: Vec<_> = replica
        .all_tasks()
        .into_iter()
        .map(|t| (t.uuid(), t.taskmap().clone()))
        .collect();
    tasks.sort_by_key(|(uuid, _)| *uuid);
    tasks
}
