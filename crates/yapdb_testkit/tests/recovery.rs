//! Integration tests for durability across reopen and simulated crashes.

use std::sync::Arc;
use std::time::Duration;
use yapdb_core::extension::SecondaryIndexTransaction;
use yapdb_core::{
    ConnectionProxy, DatabaseOptions, IndexBlock, IndexValue, SecondaryIndex, Snapshot, Value,
};
use yapdb_testkit::crash::{engine_crash_during_wal_write, CrashRecoveryHarness};
use yapdb_testkit::{populate, IntegrationHarness, Model, Operation, TestDatabase};

fn parity_index() -> SecondaryIndex {
    // Objects written by `populate` are `{"index": i}` maps.
    let block: IndexBlock = Arc::new(|_c: &str, _k: &str, object: &Value, _m: Option<&Value>| {
        let entries = object.as_map()?;
        let (_, index) = entries
            .iter()
            .find(|(k, _)| k.as_text() == Some("index"))?;
        let index = u64::try_from(index.as_integer()?).ok()?;
        Some(IndexValue::from(index % 2 == 0))
    });
    SecondaryIndex::new(block).with_version_tag("parity-1")
}

fn even_count(db: &yapdb_core::Database) -> usize {
    db.new_connection()
        .read(|txn| Ok(txn.ext::<SecondaryIndexTransaction>("parity")?.count_for_value(true)))
        .unwrap()
}

#[test]
fn crash_scenarios_recover() {
    let mut harness = CrashRecoveryHarness::with_temp_dir().unwrap();
    let results = harness.run_all_tests();
    assert!(!results.is_empty());
    assert!(harness.all_passed(), "{}", harness.summary());
}

#[test]
fn interrupted_wal_append_is_not_replayed() {
    let result = engine_crash_during_wal_write();
    assert!(result.passed, "{result:?}");
}

#[test]
fn rows_and_snapshot_survive_reopen() {
    let test_db = TestDatabase::file();
    populate(&test_db, "c", 20);
    let snapshot = test_db.snapshot();
    let before = Model::load(&test_db.new_connection()).unwrap();

    let test_db = test_db.reopen();
    assert_eq!(test_db.snapshot(), snapshot);
    assert_eq!(Model::load(&test_db.new_connection()).unwrap(), before);
}

#[test]
fn checkpointed_and_logged_commits_both_survive() {
    let options = DatabaseOptions::default().auto_checkpoint_interval(0);
    let test_db = TestDatabase::file_with(options);
    let mut harness = IntegrationHarness::with_database(test_db.db.clone());
    let set = |key: &str, value: i64| Operation::Set {
        collection: "c".into(),
        key: key.into(),
        object: Value::from(value),
        metadata: Some(Value::from(key)),
    };

    harness.commit(&[set("a", 1), set("b", 2)]).unwrap();
    let report = test_db.checkpoint().unwrap();
    assert_eq!(report.snapshot, Snapshot::new(1));
    harness
        .commit(&[
            set("c", 3),
            Operation::Remove {
                collection: "c".into(),
                key: "a".into(),
            },
        ])
        .unwrap();
    let expected = harness.model().clone();
    drop(harness);

    let test_db = test_db.reopen();
    assert_eq!(test_db.manifest().checkpoint, Snapshot::new(1));
    assert_eq!(test_db.snapshot(), Snapshot::new(2));
    assert_eq!(Model::load(&test_db.new_connection()).unwrap(), expected);
}

#[test]
fn extension_state_survives_reopen() {
    let test_db = TestDatabase::file();
    test_db
        .register_extension("parity", Arc::new(parity_index()))
        .unwrap();
    populate(&test_db, "numbers", 10);
    assert_eq!(even_count(&test_db), 5);

    let test_db = test_db.reopen();
    assert!(test_db.registered_extension_names().is_empty());
    assert_eq!(
        test_db.previously_registered_extension_names(),
        vec!["parity".to_string()]
    );

    test_db
        .register_extension("parity", Arc::new(parity_index()))
        .unwrap();
    assert_eq!(even_count(&test_db), 5);
}

#[test]
fn flushed_proxy_writes_are_durable() {
    let test_db = TestDatabase::file();
    {
        let proxy = ConnectionProxy::new(&test_db).unwrap();
        proxy.set_object("kept", "drafts", Value::from("saved"));
        proxy.flush().unwrap();

        proxy.set_batch_delay(Duration::from_secs(3600));
        proxy.set_object("lost", "drafts", Value::from("discarded"));
        assert_eq!(
            proxy.object("lost", "drafts").unwrap(),
            Some(Value::from("discarded"))
        );
        proxy.abort_and_reset();
        assert_eq!(proxy.object("lost", "drafts").unwrap(), None);
        assert_eq!(proxy.pending_count(), 0);
    }

    let test_db = test_db.reopen();
    let conn = test_db.new_connection();
    assert_eq!(
        conn.read(|txn| txn.object("kept", "drafts")).unwrap(),
        Some(Value::from("saved"))
    );
    assert!(!conn.read(|txn| Ok(txn.has_object("lost", "drafts"))).unwrap());
}
