//! tsk undo and gc implementations.
//!
//! Both act on the replica as a whole rather than on a single task.

use serde::Serialize;

use crate::cli::{open_session, GlobalOptions};
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

#[derive(Serialize)]
struct UndoReport {
    undone: bool,
    local_operations: usize,
}

#[derive(Serialize)]
struct GcReport {
    renumbered: bool,
    working_set: usize,
    largest_index: usize,
}

/// Revert the most recent undo unit (one earlier tsk command).
pub fn run_undo(globals: &GlobalOptions) -> Result<()> {
    let mut session = open_session(globals)?;
    let undone = session.replica.undo()?;
    let report = UndoReport {
        undone,
        local_operations: session.replica.num_local_operations(),
    };

    let human = if undone {
        HumanOutput::new("Undid last change")
    } else {
        let mut human = HumanOutput::new("Nothing to undo");
        human.push_detail("changes already synced cannot be undone");
        human
    };

    emit_success(globals.output(), "undo", &report, Some(&human))
}

pub fn run_gc(renumber: bool, globals: &GlobalOptions) -> Result<()> {
    let mut session = open_session(globals)?;
    session.replica.rebuild_working_set(renumber)?;
    let working_set = session.replica.working_set();
    let report = GcReport {
        renumbered: renumber,
        working_set: working_set.len(),
        largest_index: working_set.largest_index(),
    };

    let mut human = HumanOutput::new("Working set rebuilt");
    human.push_summary("Tasks", report.working_set.to_string());
    human.push_summary("Largest index", report.largest_index.to_string());

    emit_success(globals.output(), "gc", &report, Some(&human))
}
