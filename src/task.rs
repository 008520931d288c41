//! Tasks: read-only values and the exclusive mutable view.
//!
//! A [`Task`] is a detached copy of one task's properties. Editing requires
//! converting it into a [`TaskMut`], which holds the replica's only mutable
//! borrow until it is converted back, so at most one task is being edited at
//! a time:
//!
//! ```compile_fail
//! use tasksync::{Replica, Status};
//!
//! let mut replica = Replica::new_in_memory();
//! let a = replica.create_task(Status::Pending, "a").unwrap();
//! let b = replica.create_task(Status::Pending, "b").unwrap();
//! let mut a = a.into_mut(&mut replica);
//! let mut b = b.into_mut(&mut replica);
//! a.done().unwrap();
//! b.done().unwrap();
//! ```

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::dependency::{DependencyMap, DEPENDENCY_PREFIX};
use crate::error::{Error, Result};
use crate::replica::Replica;
use crate::storage::TaskMap;

pub type Timestamp = DateTime<Utc>;

// =============================================================================
// Properties
// =============================================================================

/// Properties with a defined meaning in the task data model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prop {
    Description,
    Status,
    Entry,
    Wait,
    Modified,
    Start,
    End,
}

impl Prop {
    pub const ALL: [Prop; 7] = [
        Prop::Description,
        Prop::Status,
        Prop::Entry,
        Prop::Wait,
        Prop::Modified,
        Prop::Start,
        Prop::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Prop::Description => "description",
            Prop::Status => "status",
            Prop::Entry => "entry",
            Prop::Wait => "wait",
            Prop::Modified => "modified",
            Prop::Start => "start",
            Prop::End => "end",
        }
    }
}

const TAG_PREFIX: &str = "tag_";
const ANNOTATION_PREFIX: &str = "annotation_";

/// Timestamps are stored as decimal seconds since the epoch.
pub(crate) fn timestamp_to_value(ts: Timestamp) -> String {
    ts.timestamp().to_string()
}

pub(crate) fn timestamp_from_value(value: &str) -> Option<Timestamp> {
    let secs: i64 = value.parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

// =============================================================================
// Status
// =============================================================================

/// Task status; `Unknown` preserves values this engine does not write
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Completed,
    Deleted,
    Unknown(String),
}

impl Status {
    pub(crate) fn from_taskmap(value: &str) -> Status {
        match value {
            "pending" => Status::Pending,
            "completed" => Status::Completed,
            "deleted" => Status::Deleted,
            other => Status::Unknown(other.to_string()),
        }
    }

    pub(crate) fn to_taskmap(&self) -> &str {
        match self {
            Status::Pending => "pending",
            Status::Completed => "completed",
            Status::Deleted => "deleted",
            Status::Unknown(other) => other,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_taskmap())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match Status::from_taskmap(s) {
            Status::Unknown(other) => Err(Error::InvalidArgument(format!(
                "unknown status '{}' (expected pending, completed or deleted)",
                other
            ))),
            known => Ok(known),
        }
    }
}

impl Serialize for Status {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.to_taskmap())
    }
}

// =============================================================================
// Tags
// =============================================================================

/// Characters that may not appear anywhere in a user tag
pub const INVALID_TAG_CHARACTERS: &str = "+-*/(<>^! %=~";

/// Tags computed from task state rather than stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyntheticTag {
    Waiting,
    Active,
    Pending,
    Completed,
    Deleted,
    Blocked,
    Unblocked,
    Blocking,
}

impl SyntheticTag {
    pub const ALL: [SyntheticTag; 8] = [
        SyntheticTag::Waiting,
        SyntheticTag::Active,
        SyntheticTag::Pending,
        SyntheticTag::Completed,
        SyntheticTag::Deleted,
        SyntheticTag::Blocked,
        SyntheticTag::Unblocked,
        SyntheticTag::Blocking,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyntheticTag::Waiting => "WAITING",
            SyntheticTag::Active => "ACTIVE",
            SyntheticTag::Pending => "PENDING",
            SyntheticTag::Completed => "COMPLETED",
            SyntheticTag::Deleted => "DELETED",
            SyntheticTag::Blocked => "BLOCKED",
            SyntheticTag::Unblocked => "UNBLOCKED",
            SyntheticTag::Blocking => "BLOCKING",
        }
    }
}

/// A tag on a task: either user-supplied or synthetic.
///
/// All-uppercase names are reserved for synthetic tags.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    User(String),
    Synthetic(SyntheticTag),
}

impl Tag {
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Tag::Synthetic(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Tag::User(name) => name,
            Tag::Synthetic(st) => st.as_str(),
        }
    }
}

impl FromStr for Tag {
    type Err = Error;

    fn from_str(value: &str) -> Result<Tag> {
        let invalid = |reason| Error::InvalidTag {
            tag: value.to_string(),
            reason,
        };

        if !value.is_empty() && value.chars().all(|c| c.is_ascii_uppercase()) {
            return SyntheticTag::ALL
                .iter()
                .find(|st| st.as_str() == value)
                .map(|st| Tag::Synthetic(*st))
                .ok_or_else(|| invalid("uppercase names are reserved for synthetic tags"));
        }

        let mut chars = value.chars();
        match chars.next() {
            None => return Err(invalid("tags must not be empty")),
            Some(c) if c.is_whitespace() || c.is_ascii_digit() || INVALID_TAG_CHARACTERS.contains(c) => {
                return Err(invalid("tags must not start with a digit, whitespace or operator"));
            }
            Some(_) => {}
        }
        if chars.any(|c| c.is_whitespace() || c == ':' || INVALID_TAG_CHARACTERS.contains(c)) {
            return Err(invalid("tags must not contain whitespace, ':' or operators"));
        }
        Ok(Tag::User(value.to_string()))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Annotations
// =============================================================================

/// A timestamped note attached to a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub entry: Timestamp,
    pub description: String,
}

// =============================================================================
// Task
// =============================================================================

/// A read-only copy of one task.
///
/// Blocked and blocking reflect the replica's dependencies when the copy
/// was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    uuid: Uuid,
    taskmap: TaskMap,
    blocked: bool,
    blocking: bool,
}

impl Task {
    pub(crate) fn new(uuid: Uuid, taskmap: TaskMap) -> Self {
        Self {
            uuid,
            taskmap,
            blocked: false,
            blocking: false,
        }
    }

    pub(crate) fn with_dependencies(mut self, depmap: &DependencyMap) -> Self {
        self.blocked = depmap.dependencies(self.uuid).next().is_some();
        self.blocking = depmap.dependents(self.uuid).next().is_some();
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn taskmap(&self) -> &TaskMap {
        &self.taskmap
    }

    pub fn get_value(&self, property: &str) -> Option<&str> {
        self.taskmap.get(property).map(String::as_str)
    }

    pub fn get_status(&self) -> Status {
        self.get_value(Prop::Status.as_str())
            .map(Status::from_taskmap)
            .unwrap_or(Status::Pending)
    }

    pub fn get_description(&self) -> &str {
        self.get_value(Prop::Description.as_str()).unwrap_or("")
    }

    fn get_timestamp(&self, prop: Prop) -> Option<Timestamp> {
        self.get_value(prop.as_str()).and_then(timestamp_from_value)
    }

    pub fn get_entry(&self) -> Option<Timestamp> {
        self.get_timestamp(Prop::Entry)
    }

    pub fn get_wait(&self) -> Option<Timestamp> {
        self.get_timestamp(Prop::Wait)
    }

    pub fn get_modified(&self) -> Option<Timestamp> {
        self.get_timestamp(Prop::Modified)
    }

    pub fn get_start(&self) -> Option<Timestamp> {
        self.get_timestamp(Prop::Start)
    }

    pub fn get_end(&self) -> Option<Timestamp> {
        self.get_timestamp(Prop::End)
    }

    /// True while `wait` is in the future
    pub fn is_waiting(&self) -> bool {
        self.get_wait().map(|wait| wait > Utc::now()).unwrap_or(false)
    }

    /// True while the task has been started and not stopped
    pub fn is_active(&self) -> bool {
        self.taskmap.contains_key(Prop::Start.as_str())
    }

    /// True while some pending task this one depends on is unfinished
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// True while some pending task depends on this one
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Uuids this task depends on, resolved or not, in uuid order
    pub fn get_dependencies(&self) -> Vec<Uuid> {
        let mut deps: Vec<Uuid> = self
            .taskmap
            .keys()
            .filter_map(|key| key.strip_prefix(DEPENDENCY_PREFIX))
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect();
        deps.sort();
        deps
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        match tag {
            Tag::User(name) => self.taskmap.contains_key(&format!("{}{}", TAG_PREFIX, name)),
            Tag::Synthetic(st) => self.has_synthetic_tag(*st),
        }
    }

    fn has_synthetic_tag(&self, tag: SyntheticTag) -> bool {
        match tag {
            SyntheticTag::Waiting => self.is_waiting(),
            SyntheticTag::Active => self.is_active(),
            SyntheticTag::Pending => self.get_status() == Status::Pending,
            SyntheticTag::Completed => self.get_status() == Status::Completed,
            SyntheticTag::Deleted => self.get_status() == Status::Deleted,
            SyntheticTag::Blocked => self.is_blocked(),
            SyntheticTag::Unblocked => !self.is_blocked(),
            SyntheticTag::Blocking => self.is_blocking(),
        }
    }

    /// User tags in name order, followed by the synthetic tags that apply
    pub fn tags(&self) -> Vec<Tag> {
        let mut user: Vec<Tag> = self
            .taskmap
            .keys()
            .filter_map(|key| key.strip_prefix(TAG_PREFIX))
            .filter_map(|name| Tag::from_str(name).ok())
            .filter(|tag| !tag.is_synthetic())
            .collect();
        user.sort();
        user.extend(
            SyntheticTag::ALL
                .iter()
                .filter(|st| self.has_synthetic_tag(**st))
                .map(|st| Tag::Synthetic(*st)),
        );
        user
    }

    /// Annotations, oldest first
    pub fn annotations(&self) -> Vec<Annotation> {
        let mut annotations: Vec<Annotation> = self
            .taskmap
            .iter()
            .filter_map(|(key, value)| {
                let entry = timestamp_from_value(key.strip_prefix(ANNOTATION_PREFIX)?)?;
                Some(Annotation {
                    entry,
                    description: value.clone(),
                })
            })
            .collect();
        annotations.sort_by_key(|a| a.entry);
        annotations
    }

    /// Value of a user-defined attribute
    pub fn get_uda(&self, namespace: &str, key: &str) -> Option<&str> {
        self.get_value(&uda_key(namespace, key))
    }

    /// All properties outside the data model, as `(key, value)` pairs
    pub fn udas(&self) -> Vec<(&str, &str)> {
        let mut udas: Vec<(&str, &str)> = self
            .taskmap
            .iter()
            .filter(|(key, _)| !is_reserved_key(key))
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        udas.sort();
        udas
    }

    /// Take the replica's exclusive mutable borrow to edit this task.
    pub fn into_mut(self, replica: &mut Replica) -> TaskMut<'_> {
        TaskMut {
            task: self,
            replica,
            updated_modified: false,
        }
    }

    /// Resume an editing session whose `modified` stamp state is known.
    pub(crate) fn into_mut_stamped(self, replica: &mut Replica, updated_modified: bool) -> TaskMut<'_> {
        TaskMut {
            task: self,
            replica,
            updated_modified,
        }
    }
}

fn uda_key(namespace: &str, key: &str) -> String {
    if namespace.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", namespace, key)
    }
}

fn is_reserved_key(key: &str) -> bool {
    Prop::ALL.iter().any(|p| p.as_str() == key)
        || key.starts_with(TAG_PREFIX)
        || key.starts_with(ANNOTATION_PREFIX)
        || key.starts_with(DEPENDENCY_PREFIX)
}

// =============================================================================
// TaskMut
// =============================================================================

/// A task being edited.
///
/// Every setter records `Update` operations through the owning replica and
/// refreshes this view. The first change also stamps `modified`, unless the
/// caller sets `modified` itself.
pub struct TaskMut<'r> {
    task: Task,
    replica: &'r mut Replica,
    updated_modified: bool,
}

impl Deref for TaskMut<'_> {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl<'r> TaskMut<'r> {
    /// Release the replica and return the up-to-date task.
    pub fn into_immut(self) -> Task {
        self.task
    }

    pub(crate) fn updated_modified(&self) -> bool {
        self.updated_modified
    }

    /// Set or unset any property, recording one `Update`.
    pub fn set_value(&mut self, property: impl Into<String>, value: Option<String>) -> Result<()> {
        let property = property.into();
        let mut changes = Vec::with_capacity(2);
        if property == Prop::Modified.as_str() {
            self.updated_modified = true;
        } else if !self.updated_modified {
            changes.push((
                Prop::Modified.as_str().to_string(),
                Some(timestamp_to_value(Utc::now())),
            ));
            self.updated_modified = true;
        }
        tracing::trace!(uuid = %self.task.uuid, property = %property, value = ?value, "set task property");
        changes.push((property, value));
        let taskmap = self.replica.update_task(self.task.uuid, changes)?;
        self.task = Task::new(self.task.uuid, taskmap)
            .with_dependencies(&self.replica.dependency_map());
        Ok(())
    }

    fn set_timestamp(&mut self, prop: Prop, value: Option<Timestamp>) -> Result<()> {
        self.set_value(prop.as_str(), value.map(timestamp_to_value))
    }

    /// Set the status, maintaining `end`.
    ///
    /// Pending clears `end` (and puts the task in the working set); completed
    /// and deleted stamp `end` if it is not already set. `Unknown` is only
    /// ever read, never written.
    pub fn set_status(&mut self, status: Status) -> Result<()> {
        if let Status::Unknown(other) = &status {
            return Err(Error::InvalidArgument(format!(
                "cannot set status to '{}'",
                other
            )));
        }
        match status {
            Status::Pending => {
                if self.taskmap.contains_key(Prop::End.as_str()) {
                    self.set_timestamp(Prop::End, None)?;
                }
            }
            Status::Completed | Status::Deleted => {
                if !self.taskmap.contains_key(Prop::End.as_str()) {
                    self.set_timestamp(Prop::End, Some(Utc::now()))?;
                }
            }
            Status::Unknown(_) => {}
        }
        self.set_value(Prop::Status.as_str(), Some(status.to_taskmap().to_string()))
    }

    /// Set the description; an empty description unsets it.
    pub fn set_description(&mut self, description: impl Into<String>) -> Result<()> {
        let description = description.into();
        let value = if description.is_empty() {
            None
        } else {
            Some(description)
        };
        self.set_value(Prop::Description.as_str(), value)
    }

    pub fn set_entry(&mut self, entry: Option<Timestamp>) -> Result<()> {
        self.set_timestamp(Prop::Entry, entry)
    }

    pub fn set_wait(&mut self, wait: Option<Timestamp>) -> Result<()> {
        self.set_timestamp(Prop::Wait, wait)
    }

    /// Set `modified` explicitly. The epoch itself is rejected.
    pub fn set_modified(&mut self, modified: Timestamp) -> Result<()> {
        if modified.timestamp() == 0 {
            return Err(Error::ZeroTimestamp("modified"));
        }
        self.set_timestamp(Prop::Modified, Some(modified))
    }

    /// Mark the task active. Does nothing if it already is.
    pub fn start(&mut self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        self.set_timestamp(Prop::Start, Some(Utc::now()))
    }

    pub fn stop(&mut self) -> Result<()> {
        self.set_timestamp(Prop::Start, None)
    }

    pub fn done(&mut self) -> Result<()> {
        self.set_status(Status::Completed)
    }

    /// Mark the task deleted. The task stays in storage; see
    /// [`Replica::delete_task`] to remove it.
    pub fn delete(&mut self) -> Result<()> {
        self.set_status(Status::Deleted)
    }

    pub fn add_tag(&mut self, tag: &Tag) -> Result<()> {
        match tag {
            Tag::User(name) => self.set_value(format!("{}{}", TAG_PREFIX, name), Some(String::new())),
            Tag::Synthetic(_) => Err(Error::InvalidTag {
                tag: tag.to_string(),
                reason: "synthetic tags cannot be added",
            }),
        }
    }

    pub fn remove_tag(&mut self, tag: &Tag) -> Result<()> {
        match tag {
            Tag::User(name) => self.set_value(format!("{}{}", TAG_PREFIX, name), None),
            Tag::Synthetic(_) => Err(Error::InvalidTag {
                tag: tag.to_string(),
                reason: "synthetic tags cannot be removed",
            }),
        }
    }

    /// Record that this task cannot be finished before `dep`.
    pub fn add_dependency(&mut self, dep: Uuid) -> Result<()> {
        if dep == self.task.uuid {
            return Err(Error::InvalidArgument(
                "a task cannot depend on itself".to_string(),
            ));
        }
        self.set_value(format!("{}{}", DEPENDENCY_PREFIX, dep), Some(String::new()))
    }

    pub fn remove_dependency(&mut self, dep: Uuid) -> Result<()> {
        self.set_value(format!("{}{}", DEPENDENCY_PREFIX, dep), None)
    }

    pub fn add_annotation(&mut self, annotation: Annotation) -> Result<()> {
        let key = format!("{}{}", ANNOTATION_PREFIX, annotation.entry.timestamp());
        self.set_value(key, Some(annotation.description))
    }

    pub fn remove_annotation(&mut self, entry: Timestamp) -> Result<()> {
        self.set_value(format!("{}{}", ANNOTATION_PREFIX, entry.timestamp()), None)
    }

    /// Set a user-defined attribute stored as `namespace.key`.
    pub fn set_uda(&mut self, namespace: &str, key: &str, value: impl Into<String>) -> Result<()> {
        let full = uda_key(namespace, key);
        if full.is_empty() || is_reserved_key(&full) {
            return Err(Error::InvalidArgument(format!(
                "'{}' is not a valid user-defined attribute",
                full
            )));
        }
        let value = value.into();
        self.set_value(full, if value.is_empty() { None } else { Some(value) })
    }

    pub fn remove_uda(&mut self, namespace: &str, key: &str) -> Result<()> {
        let full = uda_key(namespace, key);
        if is_reserved_key(&full) {
            return Err(Error::InvalidArgument(format!(
                "'{}' is not a valid user-defined attribute",
                full
            )));
        }
        self.set_value(full, None)
    }
}
