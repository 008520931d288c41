use tasksync::{Replica, Status};

#[test]
fn non_renumbering_rebuild_leaves_a_hole() {
    let mut replica = Replica::new_in_memory();
    let a = replica.create_task(Status::Pending, "a").unwrap();
    let b = replica.create_task(Status::Pending, "b").unwrap();
    let c = replica.create_task(Status::Pending, "c").unwrap();
    replica.rebuild_working_set(true).unwrap();

    let ws = replica.working_set();
    assert_eq!(ws.by_uuid(a.uuid()), 1);
    assert_eq!(ws.by_uuid(b.uuid()), 2);
    assert_eq!(ws.by_uuid(c.uuid()), 3);

    let b_uuid = b.uuid();
    let mut b = b.into_mut(&mut replica);
    b.done().unwrap();
    b.into_immut();
    replica.rebuild_working_set(false).unwrap();

    let ws = replica.working_set();
    assert_eq!(ws.by_index(1), Some(a.uuid()));
    assert_eq!(ws.by_index(2), None);
    assert_eq!(ws.by_index(3), Some(c.uuid()));
    assert_eq!(ws.by_uuid(b_uuid), 0);
    assert_eq!(ws.len(), 2);
    assert_eq!(ws.largest_index(), 3);

    replica.rebuild_working_set(true).unwrap();
    let ws = replica.working_set();
    assert_eq!(ws.by_index(2), Some(c.uuid()));
    assert_eq!(ws.largest_index(), 2);
}

#[test]
fn new_pending_tasks_append_without_renumbering() {
    let mut replica = Replica::new_in_memory();
    let a = replica.create_task(Status::Pending, "a").unwrap();
    let done = replica.create_task(Status::Completed, "done").unwrap();
    let b = replica.create_task(Status::Pending, "b").unwrap();

    assert_eq!(replica.get_working_set_index(a.uuid()), Some(1));
    assert_eq!(replica.get_working_set_index(done.uuid()), None);
    assert_eq!(replica.get_working_set_index(b.uuid()), Some(2));
    assert_eq!(replica.get_working_set_task(2).unwrap().uuid(), b.uuid());
    assert!(replica.get_working_set_task(3).is_none());
}

#[test]
fn reopening_pending_task_puts_it_back() {
    let mut replica = Replica::new_in_memory();
    let task = replica.create_task(Status::Pending, "again").unwrap();
    let mut task = task.into_mut(&mut replica);
    task.done().unwrap();
    let task = task.into_immut();
    replica.rebuild_working_set(true).unwrap();
    assert!(replica.working_set().is_empty());

    let mut task = task.into_mut(&mut replica);
    task.set_status(Status::Pending).unwrap();
    let task = task.into_immut();
    assert!(task.get_end().is_none());
    assert_eq!(replica.working_set().by_uuid(task.uuid()), 1);
}

#[test]
fn working_set_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let expected = {
        let mut replica = Replica::new_on_disk(dir.path()).unwrap();
        for name in ["a", "b", "c"] {
            replica.create_task(Status::Pending, name).unwrap();
        }
        let second = replica.get_working_set_task(2).unwrap();
        let mut second = second.into_mut(&mut replica);
        second.delete().unwrap();
        second.into_immut();
        replica.rebuild_working_set(false).unwrap();
        replica.working_set()
    };

    let replica = Replica::new_on_disk(dir.path()).unwrap();
    assert_eq!(replica.working_set(), expected);
    assert_eq!(replica.working_set().by_index(2), None);
}
