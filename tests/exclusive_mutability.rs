use tasksync::bindings::{ReplicaHandle, TcResult, TcStatus, TcString};

#[test]
fn second_mutable_task_is_rejected() {
    let mut replica = ReplicaHandle::new_in_memory();
    let mut a = replica
        .new_task(TcStatus::Pending, &TcString::from("a"))
        .expect("task a");
    let mut b = replica
        .new_task(TcStatus::Pending, &TcString::from("b"))
        .expect("task b");

    assert_eq!(a.to_mut(&replica), TcResult::Ok);
    assert_eq!(b.to_mut(&replica), TcResult::Error);
    let message = b.take_error().expect("error message");
    assert!(String::from_utf8_lossy(message.as_bytes()).contains("borrowed"));
    assert!(b.take_error().is_none());
    assert!(!b.is_mutable());

    // The replica itself is unusable while a task holds it.
    assert_eq!(replica.add_undo_point(true), TcResult::Error);
    assert!(replica.take_error().is_some());
    assert!(replica.all_task_uuids().is_none());

    assert_eq!(a.done(), TcResult::Ok);
    a.to_immut();

    assert_eq!(b.to_mut(&replica), TcResult::Ok);
    assert_eq!(b.set_description(&TcString::from("b2")), TcResult::Ok);
    b.free();

    assert_eq!(replica.all_task_uuids().expect("uuids").len(), 2);
    let uuid = pending_uuid(&mut replica);
    let b = replica.get_task(uuid).expect("b");
    assert_eq!(
        b.description().expect("description"),
        TcString::from("b2")
    );
}

fn pending_uuid(replica: &mut ReplicaHandle) -> uuid::Uuid {
    let tasks = replica.all_tasks().expect("tasks");
    tasks
        .iter()
        .find(|t| t.status() == TcStatus::Pending)
        .expect("pending task")
        .uuid()
}

#[test]
fn dropping_a_mutable_task_releases_the_replica() {
    let mut replica = ReplicaHandle::new_in_memory();
    {
        let mut task = replica
            .new_task(TcStatus::Pending, &TcString::from("scoped"))
            .expect("task");
        assert_eq!(task.to_mut(&replica), TcResult::Ok);
        assert_eq!(task.start(), TcResult::Ok);
    }
    // create: 4 operations; start: `modified` and `start`
    assert_eq!(replica.num_local_operations(), 6);
    assert!(replica.take_error().is_none());
}

#[test]
fn task_errors_are_one_shot() {
    let mut replica = ReplicaHandle::new_in_memory();
    let mut task = replica
        .new_task(TcStatus::Pending, &TcString::from("t"))
        .expect("task");
    assert_eq!(task.to_mut(&replica), TcResult::Ok);

    assert_eq!(task.set_modified(0), TcResult::Error);
    assert!(task.take_error().is_some());
    assert!(task.take_error().is_none());

    assert_eq!(task.add_tag(&TcString::from("9lives")), TcResult::Error);
    assert!(task.take_error().is_some());
    assert_eq!(task.add_tag(&TcString::from("home")), TcResult::Ok);
    assert!(task.has_tag(&TcString::from("home")));
    assert!(task.has_tag(&TcString::from("PENDING")));
    assert!(task.take_error().is_none());
}
