mod support;

use std::fs;

use tasksync::error::{Error, Result};
use tasksync::server::{ExchangeRequest, ExchangeResponse, Server, SnapshotUrgency, Version};
use tasksync::{Replica, Status};
use uuid::Uuid;

use support::{all_taskmaps, Flake, FlakyServer, TestEnv};

fn seeded(env: &TestEnv) -> Replica {
    let mut replica = env.open("a");
    replica.create_task(Status::Pending, "one").unwrap();
    replica.add_undo_point(false).unwrap();
    replica.create_task(Status::Pending, "two").unwrap();
    replica
}

/// Everything observable about a replica, on disk and in memory
fn fingerprint(env: &TestEnv, replica: &Replica) -> (Vec<u8>, Vec<u8>, Uuid, usize, String) {
    let dir = env.replica_dir("a");
    (
        fs::read(dir.join("state.json")).unwrap_or_default(),
        fs::read(dir.join("oplog.jsonl")).unwrap_or_default(),
        replica.sync_key(),
        replica.operations().len(),
        format!("{:?}", all_taskmaps(replica)),
    )
}

#[test]
fn refused_exchange_changes_nothing() {
    let env = TestEnv::new();
    let mut replica = seeded(&env);
    let before = fingerprint(&env, &replica);

    let mut server = FlakyServer::new(vec![Flake::RefuseRequest]);
    let err = replica.sync(&mut server, false).unwrap_err();
    assert_eq!(err.kind(), tasksync::ErrorKind::Sync);
    assert_eq!(fingerprint(&env, &replica), before);
    assert!(server.inner.chain.is_empty());
}

#[test]
fn lost_response_is_retried_without_duplicates() {
    let env = TestEnv::new();
    let mut replica = seeded(&env);
    let before = fingerprint(&env, &replica);

    let mut server = FlakyServer::new(vec![Flake::DropResponse]);
    assert!(replica.sync(&mut server, false).is_err());
    assert_eq!(fingerprint(&env, &replica), before);
    assert_eq!(server.inner.chain.len(), 1);

    replica.sync(&mut server, false).unwrap();
    assert_eq!(server.inner.chain.len(), 1);
    assert_eq!(replica.sync_key(), server.inner.chain.head());
    assert_eq!(replica.num_local_operations(), 0);
    assert_eq!(replica.all_task_uuids().len(), 2);
}

#[test]
fn response_that_fails_processing_changes_nothing() {
    // Accepts the batch but answers as if it never saw it.
    struct Amnesiac;
    impl Server for Amnesiac {
        fn exchange(&mut self, _request: ExchangeRequest) -> Result<ExchangeResponse> {
            Ok(ExchangeResponse {
                sync_key: Uuid::new_v4(),
                snapshot: None,
                versions: vec![Version {
                    version_id: Uuid::new_v4(),
                    parent_version_id: Uuid::nil(),
                    operations: vec![tasksync::Operation::Create {
                        uuid: Uuid::new_v4(),
                    }],
                }],
                snapshot_urgency: SnapshotUrgency::None,
            })
        }
    }

    let env = TestEnv::new();
    let mut replica = seeded(&env);
    let before = fingerprint(&env, &replica);

    let err = replica.sync(&mut Amnesiac, false).unwrap_err();
    assert!(matches!(err, Error::Sync(_)));
    assert_eq!(fingerprint(&env, &replica), before);
}

#[test]
fn failed_sync_survives_reopen_and_retries() {
    let env = TestEnv::new();
    let mut server = FlakyServer::new(vec![Flake::RefuseRequest]);
    {
        let mut replica = seeded(&env);
        assert!(replica.sync(&mut server, false).is_err());
    }

    let mut replica = env.open("a");
    assert_eq!(replica.num_local_operations(), 8);
    replica.sync(&mut server, false).unwrap();
    assert_eq!(replica.num_local_operations(), 0);
    assert_eq!(server.inner.chain.versions()[0].operations.len(), 8);
}
