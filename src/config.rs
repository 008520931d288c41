//! Configuration loading and management
//!
//! Handles parsing of `tasksync.toml` configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::server::{ServerConfig, ServerPolicy, DEFAULT_SNAPSHOT_THRESHOLD};

/// Config file name looked up in the platform config directory
pub const CONFIG_FILE_NAME: &str = "tasksync.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where the local replica lives
    #[serde(default)]
    pub replica: ReplicaConfig,

    /// Which server to sync with
    #[serde(default)]
    pub sync: SyncConfig,

    /// Policy for a local server directory
    #[serde(default)]
    pub server: ServerSection,
}

/// Replica-related configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Replica directory; platform data dir when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Keep everything in memory (nothing survives the process)
    #[serde(default)]
    pub in_memory: bool,
}

/// Transport kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    #[default]
    Local,
    Remote,
}

/// Sync-related configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// `local` or `remote`
    #[serde(default)]
    pub server: ServerKind,

    /// Server directory for `local`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<PathBuf>,

    /// Base URL for `remote`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Client id for `remote`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Shared secret for `remote`; its bytes are used verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_secret: Option<String>,

    /// Never ask for a snapshot, even as a fresh replica
    #[serde(default)]
    pub avoid_snapshots: bool,

    /// Per-request timeout for `remote`, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Local server policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    /// Versions in a chain before a fresh replica is sent a snapshot
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: usize,
}

fn default_snapshot_threshold() -> usize {
    DEFAULT_SNAPSHOT_THRESHOLD
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            snapshot_threshold: default_snapshot_threshold(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, or return defaults if it is missing.
    ///
    /// A file that exists but does not parse is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "tasksync")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Replica directory: configured, else the platform data directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.replica.data_dir {
            return Ok(dir.clone());
        }
        directories::ProjectDirs::from("", "", "tasksync")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| {
                Error::InvalidConfig(
                    "replica.data_dir is not set and no home directory was found".to_string(),
                )
            })
    }

    /// Describe the configured sync server.
    pub fn server_config(&self) -> Result<ServerConfig> {
        self.validate()?;
        match self.sync.server {
            ServerKind::Local => {
                let server_dir = self.sync.local_dir.clone().ok_or_else(|| {
                    Error::InvalidConfig("sync.local_dir is required for a local server".to_string())
                })?;
                Ok(ServerConfig::Local {
                    server_dir,
                    policy: ServerPolicy {
                        snapshot_threshold: self.server.snapshot_threshold,
                    },
                })
            }
            ServerKind::Remote => {
                let missing =
                    |field: &str| Error::InvalidConfig(format!("sync.{field} is required for a remote server"));
                let origin = self.sync.origin.clone().ok_or_else(|| missing("origin"))?;
                let client_id = self.sync.client_id.as_deref().ok_or_else(|| missing("client_id"))?;
                let secret = self
                    .sync
                    .encryption_secret
                    .as_deref()
                    .ok_or_else(|| missing("encryption_secret"))?;
                Ok(ServerConfig::Remote {
                    origin,
                    client_id: parse_client_id(client_id)?,
                    encryption_secret: secret.as_bytes().to_vec(),
                    timeout_secs: self.sync.timeout_secs,
                })
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server.snapshot_threshold == 0 {
            return Err(Error::InvalidConfig(
                "server.snapshot_threshold must be > 0".to_string(),
            ));
        }
        if let Some(client_id) = &self.sync.client_id {
            parse_client_id(client_id)?;
        }
        if let Some(origin) = &self.sync.origin {
            if !(origin.starts_with("http://") || origin.starts_with("https://")) {
                return Err(Error::InvalidConfig(format!(
                    "sync.origin must be an http(s) URL, got '{origin}'"
                )));
            }
        }
        if matches!(&self.sync.encryption_secret, Some(secret) if secret.is_empty()) {
            return Err(Error::InvalidConfig(
                "sync.encryption_secret cannot be empty".to_string(),
            ));
        }
        if self.sync.timeout_secs == Some(0) {
            return Err(Error::InvalidConfig(
                "sync.timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_client_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value.trim())
        .map_err(|_| Error::InvalidConfig(format!("sync.client_id is not a uuid: '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_are_expected() {
        let cfg = Config::default();
        assert!(cfg.replica.data_dir.is_none());
        assert!(!cfg.replica.in_memory);
        assert_eq!(cfg.sync.server, ServerKind::Local);
        assert!(!cfg.sync.avoid_snapshots);
        assert_eq!(cfg.server.snapshot_threshold, 100);
    }

    #[test]
    fn load_parses_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        let content = r#"
[replica]
data_dir = "/tmp/tasks"

[sync]
server = "remote"
origin = "https://sync.example.com"
client_id = "9e5b7c1f-34c0-4d1c-8e0c-5f6f3b2a1d00"
encryption_secret = "hunter2"
avoid_snapshots = true
timeout_secs = 30

[server]
snapshot_threshold = 5
"#;
        fs::write(&path, content.trim()).expect("write config");

        let cfg = Config::load(&path).expect("load config");
        assert_eq!(cfg.replica.data_dir, Some(PathBuf::from("/tmp/tasks")));
        assert_eq!(cfg.sync.server, ServerKind::Remote);
        assert!(cfg.sync.avoid_snapshots);
        assert_eq!(cfg.server.snapshot_threshold, 5);

        match cfg.server_config().expect("server config") {
            ServerConfig::Remote {
                origin,
                encryption_secret,
                timeout_secs,
                ..
            } => {
                assert_eq!(origin, "https://sync.example.com");
                assert_eq!(encryption_secret, b"hunter2".to_vec());
                assert_eq!(timeout_secs, Some(30));
            }
            other => panic!("unexpected server config: {other:?}"),
        }
    }

    #[test]
    fn invalid_client_id_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[sync]\nclient_id = \"nope\"").expect("write config");

        let err = Config::load(&path).expect_err("invalid config");
        match err {
            Error::InvalidConfig(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn local_server_requires_dir() {
        let err = Config::default().server_config().expect_err("no local_dir");
        assert!(err.to_string().contains("local_dir"));

        let mut cfg = Config::default();
        cfg.sync.local_dir = Some(PathBuf::from("/srv/tasks"));
        cfg.server.snapshot_threshold = 7;
        assert_eq!(
            cfg.server_config().expect("server config"),
            ServerConfig::Local {
                server_dir: PathBuf::from("/srv/tasks"),
                policy: ServerPolicy {
                    snapshot_threshold: 7
                },
            }
        );
    }

    #[test]
    fn load_or_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Config::load_or_default(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn save_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.toml");
        let mut cfg = Config::default();
        cfg.replica.data_dir = Some(dir.path().join("data"));
        cfg.save(&path).expect("save config");

        let written = fs::read_to_string(&path).expect("read config");
        assert!(written.contains("snapshot_threshold = 100"));
        assert_eq!(Config::load(&path).expect("reload"), cfg);
    }
}
