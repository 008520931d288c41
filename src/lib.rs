//! tasksync - replicated task storage
//!
//! A local task database in which every change is an [`Operation`] recorded
//! in an operation log. The log drives undo and is exchanged with a sync
//! server so that several replicas converge on the same tasks.
//!
//! # Core Concepts
//!
//! - **Replica**: one local database; the only entry point for changes
//! - **Operations**: `Create`, `Delete`, `Update` and `UndoPoint`
//! - **Working set**: small stable integers naming pending tasks
//! - **Sync**: push unsynced operations, merge everything newer from the server
//!
//! # Module Organization
//!
//! - `bindings`: handle layer for foreign callers (byte strings, last error)
//! - `cli`: Command-line interface using clap
//! - `config`: Configuration loading from `tasksync.toml`
//! - `dependency`: Dependency edges between pending tasks
//! - `error`: Error types and result aliases
//! - `lock`: File locking and atomic writes
//! - `operation`: Operations and their inverses
//! - `oplog`: Sequence-numbered operation log
//! - `output`: JSON and human output for the CLI
//! - `replica`: The replica façade
//! - `server`: Sync servers, local and remote
//! - `storage`: Task storage and the on-disk replica layout
//! - `sync`: The sync engine and merge rule
//! - `task`: Tasks, mutable task views, statuses and tags
//! - `working_set`: Working-set table and snapshots
//!
//! ```
//! use tasksync::{Replica, Status};
//!
//! let mut replica = Replica::new_in_memory();
//! let task = replica.create_task(Status::Pending, "water the plants")?;
//! assert_eq!(replica.working_set().by_uuid(task.uuid()), 1);
//!
//! let mut task = task.into_mut(&mut replica);
//! task.done()?;
//! let task = task.into_immut();
//! assert_eq!(task.get_status(), Status::Completed);
//! # Ok::<(), tasksync::Error>(())
//! ```

pub mod bindings;
pub mod cli;
pub mod config;
pub mod dependency;
pub mod error;
pub mod lock;
pub mod operation;
pub mod oplog;
pub mod output;
pub mod replica;
pub mod server;
pub mod storage;
mod sync;
pub mod task;
pub mod working_set;

pub use dependency::DependencyMap;
pub use error::{Error, ErrorKind, Result};
pub use operation::Operation;
pub use replica::Replica;
pub use server::{Server, ServerConfig};
pub use task::{Status, Tag, Task, TaskMut};
pub use working_set::WorkingSet;
