//! Command-line interface for tsk
//!
//! This module defines the CLI structure using clap derive macros.
//! Each group of subcommands is implemented in its own submodule.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::output::OutputOptions;
use crate::replica::Replica;

mod op;
mod status;
mod sync;
mod task;

/// tsk - a replicated task list
///
/// Every change is recorded in a local operation log, can be undone, and is
/// exchanged with a sync server on `tsk sync`.
#[derive(Parser, Debug)]
#[command(name = "tsk")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Replica directory (defaults to the platform data directory)
    #[arg(long, global = true, env = "TSK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true, env = "TSK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add a task
    Add {
        /// Task description
        #[arg(required = true)]
        description: Vec<String>,

        /// Initial status: pending, completed, deleted
        #[arg(long, default_value = "pending")]
        status: String,
    },

    /// List tasks in the working set
    List {
        /// Include completed and deleted tasks
        #[arg(long)]
        all: bool,
    },

    /// Show one task
    Info {
        /// Working-set index or uuid
        id: String,
    },

    /// Mark a task completed
    Done {
        /// Working-set index or uuid
        id: String,
    },

    /// Start working on a task
    Start {
        /// Working-set index or uuid
        id: String,
    },

    /// Stop working on a task
    Stop {
        /// Working-set index or uuid
        id: String,
    },

    /// Mark a task deleted
    Delete {
        /// Working-set index or uuid
        id: String,
    },

    /// Add a tag to a task
    Tag {
        /// Working-set index or uuid
        id: String,
        /// Tag name
        tag: String,
    },

    /// Remove a tag from a task
    Untag {
        /// Working-set index or uuid
        id: String,
        /// Tag name
        tag: String,
    },

    /// Undo the last command that changed tasks
    Undo,

    /// Rebuild the working set
    Gc {
        /// Keep existing indices stable instead of compacting them
        #[arg(long)]
        no_renumber: bool,
    },

    /// Synchronize with the configured server
    Sync {
        /// Never ask for a snapshot
        #[arg(long)]
        avoid_snapshots: bool,
    },

    /// Show replica status
    Status,
}

/// Flags shared by every command
#[derive(Debug, Clone)]
pub(crate) struct GlobalOptions {
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
}

impl GlobalOptions {
    pub fn output(&self) -> OutputOptions {
        OutputOptions {
            json: self.json,
            quiet: self.quiet,
        }
    }
}

/// An open replica plus the configuration it was opened with
pub(crate) struct Session {
    pub config: Config,
    pub replica: Replica,
    pub data_dir: Option<PathBuf>,
}

/// Load configuration and open the replica it names.
pub(crate) fn open_session(globals: &GlobalOptions) -> Result<Session> {
    let config = match &globals.config {
        Some(path) => {
            if !path.exists() {
                return Err(Error::InvalidConfig(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            Config::load(path)?
        }
        None => match Config::default_path() {
            Some(path) => Config::load_or_default(&path)?,
            None => Config::default(),
        },
    };

    if config.replica.in_memory && globals.data_dir.is_none() {
        tracing::debug!("using in-memory replica");
        return Ok(Session {
            config,
            replica: Replica::new_in_memory(),
            data_dir: None,
        });
    }

    let data_dir = match &globals.data_dir {
        Some(dir) => dir.clone(),
        None => config.data_dir()?,
    };
    let replica = Replica::new_on_disk(&data_dir)?;
    Ok(Session {
        config,
        replica,
        data_dir: Some(data_dir),
    })
}

impl Cli {
    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        let globals = GlobalOptions {
            data_dir: self.data_dir,
            config: self.config,
            json: self.json,
            quiet: self.quiet,
        };

        match self.command {
            Commands::Add {
                description,
                status,
            } => task::run_add(
                task::AddOptions {
                    description: description.join(" "),
                    status,
                },
                &globals,
            ),
            Commands::List { all } => task::run_list(task::ListOptions { all }, &globals),
            Commands::Info { id } => task::run_info(&id, &globals),
            Commands::Done { id } => task::run_change(&id, task::Change::Done, &globals),
            Commands::Start { id } => task::run_change(&id, task::Change::Start, &globals),
            Commands::Stop { id } => task::run_change(&id, task::Change::Stop, &globals),
            Commands::Delete { id } => task::run_change(&id, task::Change::Delete, &globals),
            Commands::Tag { id, tag } => {
                task::run_change(&id, task::Change::AddTag(tag), &globals)
            }
            Commands::Untag { id, tag } => {
                task::run_change(&id, task::Change::RemoveTag(tag), &globals)
            }
            Commands::Undo => op::run_undo(&globals),
            Commands::Gc { no_renumber } => op::run_gc(!no_renumber, &globals),
            Commands::Sync { avoid_snapshots } => {
                sync::run(sync::SyncOptions { avoid_snapshots }, &globals)
            }
            Commands::Status => status::run(&globals),
        }
    }
}
