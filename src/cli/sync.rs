//! tsk sync implementation.

use serde::Serialize;
use uuid::Uuid;

use crate::cli::{open_session, GlobalOptions};
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

pub struct SyncOptions {
    pub avoid_snapshots: bool,
}

#[derive(Serialize)]
struct SyncReport {
    pushed: usize,
    tasks: usize,
    sync_key: Uuid,
}

pub fn run(options: SyncOptions, globals: &GlobalOptions) -> Result<()> {
    let mut session = open_session(globals)?;
    let mut server = session.config.server_config()?.into_server()?;
    let avoid_snapshots = options.avoid_snapshots || session.config.sync.avoid_snapshots;

    let pushed = session.replica.num_local_operations();
    session.replica.sync(&mut server, avoid_snapshots)?;

    let report = SyncReport {
        pushed,
        tasks: session.replica.all_task_uuids().len(),
        sync_key: session.replica.sync_key(),
    };

    let mut human = HumanOutput::new("Sync complete");
    human.push_summary("Pushed operations", report.pushed.to_string());
    human.push_summary("Tasks", report.tasks.to_string());
    human.push_summary("Sync key", report.sync_key.to_string());

    emit_success(globals.output(), "sync", &report, Some(&human))
}
