//! tsk task command implementations.

use std::str::FromStr;

use serde::Serialize;
use uuid::Uuid;

use crate::cli::{open_session, GlobalOptions};
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::replica::Replica;
use crate::task::{Annotation, Status, Tag, Task, Timestamp};

pub struct AddOptions {
    pub description: String,
    pub status: String,
}

pub struct ListOptions {
    pub all: bool,
}

/// A single-task edit
#[derive(Debug, Clone)]
pub enum Change {
    Done,
    Start,
    Stop,
    Delete,
    AddTag(String),
    RemoveTag(String),
}

impl Change {
    fn command(&self) -> &'static str {
        match self {
            Change::Done => "done",
            Change::Start => "start",
            Change::Stop => "stop",
            Change::Delete => "delete",
            Change::AddTag(_) => "tag",
            Change::RemoveTag(_) => "untag",
        }
    }

    fn header(&self) -> &'static str {
        match self {
            Change::Done => "Task completed",
            Change::Start => "Task started",
            Change::Stop => "Task stopped",
            Change::Delete => "Task deleted",
            Change::AddTag(_) => "Tag added",
            Change::RemoveTag(_) => "Tag removed",
        }
    }
}

#[derive(Serialize)]
pub(crate) struct TaskView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub uuid: Uuid,
    pub status: Status,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<Timestamp>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub udas: Vec<(String, String)>,
}

impl TaskView {
    fn new(task: &Task, index: Option<usize>) -> Self {
        Self {
            index,
            uuid: task.uuid(),
            status: task.get_status(),
            description: task.get_description().to_string(),
            entry: task.get_entry(),
            modified: task.get_modified(),
            start: task.get_start(),
            end: task.get_end(),
            wait: task.get_wait(),
            tags: task
                .tags()
                .iter()
                .filter(|t| !t.is_synthetic())
                .map(|t| t.to_string())
                .collect(),
            annotations: task.annotations(),
            udas: task
                .udas()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn line(&self) -> String {
        let id = match self.index {
            Some(index) => index.to_string(),
            None => "-".to_string(),
        };
        let mut line = format!("[{}] {} {} {}", id, self.status, self.uuid, self.description);
        if !self.tags.is_empty() {
            line.push_str(&format!(" (tags: {})", self.tags.join(" ")));
        }
        line
    }
}

#[derive(Serialize)]
struct TaskListOutput {
    total: usize,
    tasks: Vec<TaskView>,
}

/// Find a task by working-set index or uuid.
pub(crate) fn resolve_task(replica: &Replica, id: &str) -> Result<Task> {
    let id = id.trim();
    if let Ok(index) = id.parse::<usize>() {
        return replica
            .get_working_set_task(index)
            .ok_or(Error::IndexNotFound(index));
    }
    let uuid = Uuid::parse_str(id).map_err(|_| {
        Error::InvalidArgument(format!(
            "'{id}' is neither a working-set index nor a uuid"
        ))
    })?;
    replica.get_task(uuid).ok_or(Error::TaskNotFound(uuid))
}

pub fn run_add(options: AddOptions, globals: &GlobalOptions) -> Result<()> {
    let description = options.description.trim();
    if description.is_empty() {
        return Err(Error::InvalidArgument("description cannot be empty".to_string()));
    }
    let status = Status::from_str(&options.status)?;

    let mut session = open_session(globals)?;
    let replica = &mut session.replica;
    replica.add_undo_point(false)?;
    let task = replica.create_task(status, description)?;
    let index = replica.get_working_set_index(task.uuid());
    let view = TaskView::new(&task, index);

    let header = match index {
        Some(index) => format!("Created task {index}"),
        None => "Created task".to_string(),
    };
    let mut human = HumanOutput::new(header);
    human.push_summary("UUID", task.uuid().to_string());
    human.push_summary("Status", view.status.to_string());

    emit_success(globals.output(), "add", &view, Some(&human))
}

pub fn run_list(options: ListOptions, globals: &GlobalOptions) -> Result<()> {
    let session = open_session(globals)?;
    let replica = &session.replica;
    let working_set = replica.working_set();

    let tasks: Vec<TaskView> = if options.all {
        let mut all = replica.all_tasks();
        all.sort_by(|a, b| {
            a.get_entry()
                .cmp(&b.get_entry())
                .then_with(|| a.uuid().cmp(&b.uuid()))
        });
        all.iter()
            .map(|task| TaskView::new(task, replica.get_working_set_index(task.uuid())))
            .collect()
    } else {
        working_set
            .iter()
            .filter_map(|(index, uuid)| {
                replica
                    .get_task(uuid)
                    .map(|task| TaskView::new(&task, Some(index)))
            })
            .collect()
    };

    let mut human = HumanOutput::new("Tasks");
    human.push_summary("Total", tasks.len().to_string());
    for task in &tasks {
        human.push_detail(task.line());
    }

    let output = TaskListOutput {
        total: tasks.len(),
        tasks,
    };
    emit_success(globals.output(), "list", &output, Some(&human))
}

pub fn run_info(id: &str, globals: &GlobalOptions) -> Result<()> {
    let session = open_session(globals)?;
    let task = resolve_task(&session.replica, id)?;
    let view = TaskView::new(&task, session.replica.get_working_set_index(task.uuid()));

    let mut human = HumanOutput::new(view.description.clone());
    if let Some(index) = view.index {
        human.push_summary("ID", index.to_string());
    }
    human.push_summary("UUID", view.uuid.to_string());
    human.push_summary("Status", view.status.to_string());
    for (label, value) in [
        ("Entered", view.entry),
        ("Modified", view.modified),
        ("Started", view.start),
        ("Ended", view.end),
        ("Waiting until", view.wait),
    ] {
        if let Some(ts) = value {
            human.push_summary(label, ts.to_rfc3339());
        }
    }
    if !view.tags.is_empty() {
        human.push_summary("Tags", view.tags.join(" "));
    }
    for annotation in &view.annotations {
        human.push_detail(format!(
            "{} {}",
            annotation.entry.to_rfc3339(),
            annotation.description
        ));
    }
    for (key, value) in &view.udas {
        human.push_detail(format!("{key} = {value}"));
    }

    emit_success(globals.output(), "info", &view, Some(&human))
}

pub fn run_change(id: &str, change: Change, globals: &GlobalOptions) -> Result<()> {
    let mut session = open_session(globals)?;
    let replica = &mut session.replica;
    let task = resolve_task(replica, id)?;
    replica.add_undo_point(false)?;

    let mut task = task.into_mut(replica);
    match &change {
        Change::Done => task.done()?,
        Change::Start => task.start()?,
        Change::Stop => task.stop()?,
        Change::Delete => task.delete()?,
        Change::AddTag(tag) => task.add_tag(&Tag::from_str(tag)?)?,
        Change::RemoveTag(tag) => task.remove_tag(&Tag::from_str(tag)?)?,
    }
    let task = task.into_immut();

    let view = TaskView::new(&task, replica.get_working_set_index(task.uuid()));
    let mut human = HumanOutput::new(change.header());
    human.push_summary("UUID", view.uuid.to_string());
    human.push_summary("Status", view.status.to_string());
    if !view.tags.is_empty() {
        human.push_summary("Tags", view.tags.join(" "));
    }

    emit_success(globals.output(), change.command(), &view, Some(&human))
}
