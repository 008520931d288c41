//! tsk status command implementation
//!
//! Provides a single-pane summary of the local replica.

use std::path::PathBuf;

use uuid::Uuid;

use crate::cli::{open_session, GlobalOptions};
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

#[derive(serde::Serialize)]
struct StatusReport {
    replica_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_dir: Option<PathBuf>,
    tasks: usize,
    working_set: usize,
    local_operations: usize,
    /// Nil until the first successful sync
    sync_key: Uuid,
}

pub fn run(globals: &GlobalOptions) -> Result<()> {
    let session = open_session(globals)?;
    let replica = &session.replica;

    let report = StatusReport {
        replica_id: replica.replica_id(),
        data_dir: session.data_dir.clone(),
        tasks: replica.all_task_uuids().len(),
        working_set: replica.working_set().len(),
        local_operations: replica.num_local_operations(),
        sync_key: replica.sync_key(),
    };

    let mut human = HumanOutput::new("Replica status");
    human.push_summary("Replica", report.replica_id.to_string());
    match &report.data_dir {
        Some(dir) => human.push_summary("Data dir", dir.display().to_string()),
        None => human.push_summary("Data dir", "(in memory)"),
    }
    human.push_summary("Tasks", report.tasks.to_string());
    human.push_summary("Working set", report.working_set.to_string());
    human.push_summary("Unsynced operations", report.local_operations.to_string());
    if report.sync_key.is_nil() {
        human.push_summary("Last sync", "never");
        if report.local_operations > 0 {
            human.push_next_step("tsk sync");
        }
    } else {
        human.push_summary("Sync key", report.sync_key.to_string());
    }

    emit_success(globals.output(), "status", &report, Some(&human))
}
