//! Handle layer for foreign callers.
//!
//! Mirrors the shape of a C interface without any `unsafe`: fallible calls
//! return a sentinel ([`TcResult::Error`], `None`, `-1`) and park a message
//! on the handle, readable once via `take_error`. Strings cross the boundary
//! as [`TcString`] byte strings, which may hold NUL bytes or invalid UTF-8.
//!
//! A [`TaskHandle`] cannot borrow its replica for a lifetime the way
//! [`crate::TaskMut`] does, so the single-writer rule is checked at runtime:
//! while one task handle is mutable, converting another fails, and so does
//! every replica call.

use std::cell::RefCell;
use std::ffi::CString;
use std::rc::{Rc, Weak};
use std::str::FromStr;

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::replica::Replica;
use crate::server::{AnyServer, ServerConfig, ServerPolicy};
use crate::task::{Status, Tag, Task, TaskMut, Timestamp};
use crate::working_set::WorkingSet;

// =============================================================================
// Strings
// =============================================================================

/// A byte string crossing the boundary
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TcString(Vec<u8>);

impl TcString {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow as text; fails on invalid UTF-8.
    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.0)
            .map_err(|e| Error::InvalidArgument(format!("string is not valid UTF-8: {}", e)))
    }

    /// Convert to a NUL-terminated string; fails on embedded NULs.
    pub fn to_cstring(&self) -> Result<CString> {
        CString::new(self.0.clone())
            .map_err(|e| Error::InvalidArgument(format!("string contains NUL: {}", e)))
    }
}

impl From<&str> for TcString {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for TcString {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

// =============================================================================
// Plain values
// =============================================================================

/// Outcome of a fallible call
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcResult {
    Error = -1,
    Ok = 0,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcStatus {
    Pending = 0,
    Completed = 1,
    Deleted = 2,
    Unknown = -1,
}

impl From<Status> for TcStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Pending => TcStatus::Pending,
            Status::Completed => TcStatus::Completed,
            Status::Deleted => TcStatus::Deleted,
            Status::Unknown(_) => TcStatus::Unknown,
        }
    }
}

impl From<TcStatus> for Status {
    fn from(status: TcStatus) -> Self {
        match status {
            TcStatus::Pending => Status::Pending,
            TcStatus::Completed => Status::Completed,
            TcStatus::Deleted => Status::Deleted,
            TcStatus::Unknown => Status::Unknown("unknown".to_string()),
        }
    }
}

/// Hyphenated lowercase text form, always 36 bytes
pub fn uuid_to_str(uuid: Uuid) -> TcString {
    TcString::from(uuid.hyphenated().to_string())
}

pub fn uuid_from_str(s: &TcString) -> Result<Uuid> {
    let text = s
        .as_str()
        .map_err(|_| Error::InvalidUuid(String::from_utf8_lossy(s.as_bytes()).into_owned()))?;
    Uuid::parse_str(text).map_err(|_| Error::InvalidUuid(text.to_string()))
}

fn time_from_raw(secs: i64) -> Option<Timestamp> {
    if secs == 0 {
        None
    } else {
        Utc.timestamp_opt(secs, 0).single()
    }
}

fn time_to_raw(ts: Option<Timestamp>) -> i64 {
    ts.map(|t| t.timestamp()).unwrap_or(0)
}

// =============================================================================
// Replica
// =============================================================================

struct ReplicaCell {
    replica: Replica,
    mut_borrowed: bool,
}

const BORROWED: &str = "replica is borrowed by a mutable task and cannot be used";

/// A replica owned by a foreign caller
pub struct ReplicaHandle {
    inner: Rc<RefCell<ReplicaCell>>,
    error: Option<String>,
}

impl ReplicaHandle {
    fn from_replica(replica: Replica) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ReplicaCell {
                replica,
                mut_borrowed: false,
            })),
            error: None,
        }
    }

    pub fn new_in_memory() -> Self {
        Self::from_replica(Replica::new_in_memory())
    }

    /// Open an on-disk replica; the error message is returned on failure.
    pub fn new_on_disk(path: &TcString) -> std::result::Result<Self, TcString> {
        let path = path.as_str().map_err(|e| TcString::from(e.to_string()))?;
        Replica::new_on_disk(path)
            .map(Self::from_replica)
            .map_err(|e| TcString::from(e.to_string()))
    }

    /// The last error, cleared by reading it
    pub fn take_error(&mut self) -> Option<TcString> {
        self.error.take().map(TcString::from)
    }

    fn wrap<T>(&mut self, err_value: T, f: impl FnOnce(&mut Replica) -> Result<T>) -> T {
        self.error = None;
        let mut cell = self.inner.borrow_mut();
        if cell.mut_borrowed {
            self.error = Some(BORROWED.to_string());
            return err_value;
        }
        match f(&mut cell.replica) {
            Ok(value) => value,
            Err(err) => {
                self.error = Some(err.to_string());
                err_value
            }
        }
    }

    fn task_handle(&self, task: Task) -> TaskHandle {
        TaskHandle {
            task,
            origin: Rc::downgrade(&self.inner),
            mode: TaskMode::Immutable,
            error: None,
        }
    }

    /// `None` both when absent and on failure; check `take_error`.
    pub fn get_task(&mut self, uuid: Uuid) -> Option<TaskHandle> {
        self.wrap(None, |rep| Ok(rep.get_task(uuid)))
            .map(|task| self.task_handle(task))
    }

    pub fn new_task(&mut self, status: TcStatus, description: &TcString) -> Option<TaskHandle> {
        self.wrap(None, |rep| {
            let description = description.as_str()?;
            rep.create_task(status.into(), description).map(Some)
        })
        .map(|task| self.task_handle(task))
    }

    pub fn import_task_with_uuid(&mut self, uuid: Uuid) -> Option<TaskHandle> {
        self.wrap(None, |rep| rep.import_task_with_uuid(uuid).map(Some))
            .map(|task| self.task_handle(task))
    }

    /// On success `undone_out` reports whether anything was undone.
    pub fn undo(&mut self, undone_out: Option<&mut bool>) -> TcResult {
        self.wrap(TcResult::Error, |rep| {
            let undone = rep.undo()?;
            if let Some(out) = undone_out {
                *out = undone;
            }
            Ok(TcResult::Ok)
        })
    }

    pub fn add_undo_point(&mut self, force: bool) -> TcResult {
        self.wrap(TcResult::Error, |rep| {
            rep.add_undo_point(force).map(|_| TcResult::Ok)
        })
    }

    pub fn rebuild_working_set(&mut self, renumber: bool) -> TcResult {
        self.wrap(TcResult::Error, |rep| {
            rep.rebuild_working_set(renumber).map(|_| TcResult::Ok)
        })
    }

    pub fn working_set(&mut self) -> Option<WorkingSet> {
        self.wrap(None, |rep| Ok(Some(rep.working_set())))
    }

    pub fn all_tasks(&mut self) -> Option<Vec<TaskHandle>> {
        self.wrap(None, |rep| Ok(Some(rep.all_tasks())))
            .map(|tasks| tasks.into_iter().map(|t| self.task_handle(t)).collect())
    }

    pub fn all_task_uuids(&mut self) -> Option<Vec<Uuid>> {
        self.wrap(None, |rep| Ok(Some(rep.all_task_uuids())))
    }

    /// -1 on failure
    pub fn num_local_operations(&mut self) -> i64 {
        self.wrap(-1, |rep| Ok(rep.num_local_operations() as i64))
    }

    pub fn sync(&mut self, server: &mut ServerHandle, avoid_snapshots: bool) -> TcResult {
        self.wrap(TcResult::Error, |rep| {
            rep.sync(&mut server.0, avoid_snapshots).map(|_| TcResult::Ok)
        })
    }
}

// =============================================================================
// Server
// =============================================================================

/// A server owned by a foreign caller
#[derive(Debug)]
pub struct ServerHandle(AnyServer);

impl ServerHandle {
    pub fn new_local(server_dir: &TcString) -> std::result::Result<Self, TcString> {
        let dir = server_dir.as_str().map_err(|e| TcString::from(e.to_string()))?;
        ServerConfig::Local {
            server_dir: dir.into(),
            policy: ServerPolicy::default(),
        }
        .into_server()
        .map(ServerHandle)
        .map_err(|e| TcString::from(e.to_string()))
    }

    /// `encryption_secret` is opaque and may be any bytes. It stays on this
    /// machine; only payloads sealed with a key derived from it are sent.
    pub fn new_remote(
        origin: &TcString,
        client_id: Uuid,
        encryption_secret: &TcString,
    ) -> std::result::Result<Self, TcString> {
        let origin = origin.as_str().map_err(|e| TcString::from(e.to_string()))?;
        ServerConfig::Remote {
            origin: origin.to_string(),
            client_id,
            encryption_secret: encryption_secret.as_bytes().to_vec(),
            timeout_secs: None,
        }
        .into_server()
        .map(ServerHandle)
        .map_err(|e| TcString::from(e.to_string()))
    }
}

// =============================================================================
// Task
// =============================================================================

enum TaskMode {
    Immutable,
    /// `updated_modified` spans every edit until the handle is released
    Mutable {
        cell: Rc<RefCell<ReplicaCell>>,
        updated_modified: bool,
    },
}

/// A task owned by a foreign caller.
///
/// Starts immutable. [`TaskHandle::to_mut`] claims the replica's single
/// writer slot until [`TaskHandle::to_immut`] or the handle is freed.
pub struct TaskHandle {
    task: Task,
    /// The replica this task was read from
    origin: Weak<RefCell<ReplicaCell>>,
    mode: TaskMode,
    error: Option<String>,
}

impl TaskHandle {
    pub fn take_error(&mut self) -> Option<TcString> {
        self.error.take().map(TcString::from)
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self.mode, TaskMode::Mutable { .. })
    }

    pub fn uuid(&self) -> Uuid {
        self.task.uuid()
    }

    pub fn status(&self) -> TcStatus {
        self.task.get_status().into()
    }

    /// `None` when the task has no description
    pub fn description(&self) -> Option<TcString> {
        self.task
            .get_value(crate::task::Prop::Description.as_str())
            .map(TcString::from)
    }

    /// Seconds since the epoch; 0 when unset
    pub fn entry(&self) -> i64 {
        time_to_raw(self.task.get_entry())
    }

    pub fn wait(&self) -> i64 {
        time_to_raw(self.task.get_wait())
    }

    pub fn modified(&self) -> i64 {
        time_to_raw(self.task.get_modified())
    }

    pub fn is_waiting(&self) -> bool {
        self.task.is_waiting()
    }

    pub fn is_active(&self) -> bool {
        self.task.is_active()
    }

    /// False for tags that do not parse
    pub fn has_tag(&self, tag: &TcString) -> bool {
        tag.as_str()
            .and_then(Tag::from_str)
            .map(|tag| self.task.has_tag(&tag))
            .unwrap_or(false)
    }

    /// Claim `replica`'s single writer slot and refresh from storage.
    ///
    /// Fails while any other task handle of the same replica is mutable, and
    /// when `replica` is not the one this task came from.
    pub fn to_mut(&mut self, replica: &ReplicaHandle) -> TcResult {
        self.error = None;
        let same_replica = self
            .origin
            .upgrade()
            .map(|origin| Rc::ptr_eq(&origin, &replica.inner))
            .unwrap_or(false);
        if !same_replica {
            self.error = Some(
                Error::ContractViolation("task belongs to a different replica".to_string())
                    .to_string(),
            );
            return TcResult::Error;
        }
        if self.is_mutable() {
            return TcResult::Ok;
        }
        let mut cell = replica.inner.borrow_mut();
        if cell.mut_borrowed {
            self.error = Some(Error::AlreadyMutable.to_string());
            return TcResult::Error;
        }
        match cell.replica.get_task(self.task.uuid()) {
            Some(fresh) => self.task = fresh,
            None => {
                self.error = Some(Error::TaskNotFound(self.task.uuid()).to_string());
                return TcResult::Error;
            }
        }
        cell.mut_borrowed = true;
        self.mode = TaskMode::Mutable {
            cell: Rc::clone(&replica.inner),
            updated_modified: false,
        };
        TcResult::Ok
    }

    /// Release the writer slot. Does nothing on an immutable handle.
    pub fn to_immut(&mut self) {
        if let TaskMode::Mutable { cell, .. } = std::mem::replace(&mut self.mode, TaskMode::Immutable) {
            cell.borrow_mut().mut_borrowed = false;
        }
    }

    /// Free the handle, releasing the writer slot if held.
    pub fn free(self) {}

    fn mutate(&mut self, f: impl FnOnce(&mut TaskMut<'_>) -> Result<()>) -> TcResult {
        self.error = None;
        let (cell, updated_modified) = match &self.mode {
            TaskMode::Mutable {
                cell,
                updated_modified,
            } => (Rc::clone(cell), *updated_modified),
            TaskMode::Immutable => {
                self.error = Some(
                    Error::ContractViolation("task is not mutable".to_string()).to_string(),
                );
                return TcResult::Error;
            }
        };
        let mut cell = cell.borrow_mut();
        let mut task = self
            .task
            .clone()
            .into_mut_stamped(&mut cell.replica, updated_modified);
        let result = f(&mut task);
        let stamped = task.updated_modified();
        self.task = task.into_immut();
        if let TaskMode::Mutable {
            updated_modified, ..
        } = &mut self.mode
        {
            *updated_modified = stamped;
        }
        match result {
            Ok(()) => TcResult::Ok,
            Err(err) => {
                self.error = Some(err.to_string());
                TcResult::Error
            }
        }
    }

    pub fn set_status(&mut self, status: TcStatus) -> TcResult {
        if status == TcStatus::Unknown {
            self.error = Some("cannot set an unknown status".to_string());
            return TcResult::Error;
        }
        self.mutate(|task| task.set_status(status.into()))
    }

    pub fn set_description(&mut self, description: &TcString) -> TcResult {
        self.mutate(|task| task.set_description(description.as_str()?))
    }

    /// 0 unsets
    pub fn set_entry(&mut self, entry: i64) -> TcResult {
        self.mutate(|task| task.set_entry(time_from_raw(entry)))
    }

    /// 0 unsets
    pub fn set_wait(&mut self, wait: i64) -> TcResult {
        self.mutate(|task| task.set_wait(time_from_raw(wait)))
    }

    /// 0 is rejected
    pub fn set_modified(&mut self, modified: i64) -> TcResult {
        self.mutate(|task| {
            let ts = time_from_raw(modified).ok_or(Error::ZeroTimestamp("modified"))?;
            task.set_modified(ts)
        })
    }

    pub fn start(&mut self) -> TcResult {
        self.mutate(|task| task.start())
    }

    pub fn stop(&mut self) -> TcResult {
        self.mutate(|task| task.stop())
    }

    pub fn done(&mut self) -> TcResult {
        self.mutate(|task| task.done())
    }

    pub fn delete(&mut self) -> TcResult {
        self.mutate(|task| task.delete())
    }

    pub fn add_tag(&mut self, tag: &TcString) -> TcResult {
        self.mutate(|task| task.add_tag(&Tag::from_str(tag.as_str()?)?))
    }

    pub fn remove_tag(&mut self, tag: &TcString) -> TcResult {
        self.mutate(|task| task.remove_tag(&Tag::from_str(tag.as_str()?)?))
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.to_immut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_may_hold_nul_and_non_utf8() {
        let s = TcString::from_bytes(vec![b'a', 0, b'b']);
        assert_eq!(s.len(), 3);
        assert_eq!(s.as_str().unwrap(), "a\0b");
        assert!(s.to_cstring().is_err());

        let raw = TcString::from_bytes(vec![0xff, 0xfe]);
        assert!(raw.as_str().is_err());
        assert_eq!(raw.as_bytes(), &[0xff, 0xfe]);
        assert_eq!(
            TcString::from("ok").to_cstring().unwrap().as_bytes(),
            b"ok"
        );
    }

    #[test]
    fn uuid_text_rejects_garbage() {
        let uuid = Uuid::new_v4();
        let text = uuid_to_str(uuid);
        assert_eq!(text.len(), 36);
        assert_eq!(uuid_from_str(&text).unwrap(), uuid);
        assert!(matches!(
            uuid_from_str(&TcString::from("not-a-uuid")),
            Err(Error::InvalidUuid(_))
        ));
        assert!(uuid_from_str(&TcString::from_bytes(vec![0xff; 36])).is_err());
    }

    #[test]
    fn errors_are_read_once() {
        let mut rep = ReplicaHandle::new_in_memory();
        assert!(rep.new_task(TcStatus::Pending, &TcString::from("")).is_none());
        assert!(rep.take_error().is_some());
        assert!(rep.take_error().is_none());

        let task = rep.new_task(TcStatus::Pending, &TcString::from("ok"));
        assert!(task.is_some());
        assert!(rep.take_error().is_none());
    }

    #[test]
    fn mutation_requires_to_mut() {
        let mut rep = ReplicaHandle::new_in_memory();
        let mut task = rep
            .new_task(TcStatus::Pending, &TcString::from("t"))
            .expect("task");
        assert_eq!(task.done(), TcResult::Error);
        assert!(task.take_error().is_some());

        assert_eq!(task.to_mut(&rep), TcResult::Ok);
        assert_eq!(task.set_modified(0), TcResult::Error);
        assert_eq!(task.done(), TcResult::Ok);
        task.to_immut();
        assert_eq!(task.status(), TcStatus::Completed);
    }

    #[test]
    fn undo_reports_through_out_flag() {
        let mut rep = ReplicaHandle::new_in_memory();
        let mut undone = true;
        assert_eq!(rep.undo(Some(&mut undone)), TcResult::Ok);
        assert!(!undone);

        rep.new_task(TcStatus::Pending, &TcString::from("t"));
        assert_eq!(rep.undo(Some(&mut undone)), TcResult::Ok);
        assert!(undone);
        assert_eq!(rep.all_task_uuids().unwrap().len(), 0);
    }

    #[test]
    fn modified_is_stamped_once_per_mutable_period() {
        let mut rep = ReplicaHandle::new_in_memory();
        let mut task = rep
            .new_task(TcStatus::Pending, &TcString::from("t"))
            .expect("task");
        assert_eq!(task.to_mut(&rep), TcResult::Ok);
        assert_eq!(task.set_modified(1_000_000), TcResult::Ok);
        assert_eq!(task.set_description(&TcString::from("renamed")), TcResult::Ok);
        assert_eq!(task.add_tag(&TcString::from("home")), TcResult::Ok);
        assert_eq!(task.modified(), 1_000_000);
        task.to_immut();

        assert_eq!(task.to_mut(&rep), TcResult::Ok);
        assert_eq!(task.start(), TcResult::Ok);
        assert!(task.modified() > 1_000_000);
    }

    #[test]
    fn to_mut_rejects_a_foreign_replica() {
        let mut rep = ReplicaHandle::new_in_memory();
        let other = ReplicaHandle::new_in_memory();
        let mut task = rep
            .new_task(TcStatus::Pending, &TcString::from("t"))
            .expect("task");

        assert_eq!(task.to_mut(&other), TcResult::Error);
        assert!(task.take_error().unwrap().as_str().unwrap().contains("different replica"));
        assert!(!task.is_mutable());
        assert_eq!(task.to_mut(&rep), TcResult::Ok);
    }
}
