//! Integration tests for transaction isolation between connections.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use yapdb_core::{CoreError, Database, DatabaseOptions, Snapshot, Value};
use yapdb_testkit::{populate, TestDatabase};

fn memory() -> Database {
    Database::open_in_memory(DatabaseOptions::default()).unwrap()
}

#[test]
fn open_reader_does_not_see_a_later_commit() {
    let db = memory();
    let writer = db.new_connection();
    writer
        .read_write(|txn| {
            txn.set_object("k", "c", Value::from("v1"))?;
            txn.set_object("other", "c", Value::from(0))
        })
        .unwrap();

    let reader = db.new_connection();
    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    let reader_ref = &reader;
    thread::scope(|s| {
        let reading = s.spawn(move || {
            reader_ref.read(|txn| {
                let first = txn.object("k", "c")?;
                started_tx.send(()).unwrap();
                resume_rx.recv().unwrap();
                let second = txn.object("k", "c")?;
                let other = txn.has_object("other", "c");
                Ok((first, second, other, txn.snapshot()))
            })
        });

        started_rx.recv().unwrap();
        writer
            .read_write(|txn| {
                txn.set_object("k", "c", Value::from("v2"))?;
                txn.remove_object("other", "c")
            })
            .unwrap();
        resume_tx.send(()).unwrap();

        let (first, second, other, snapshot) = reading.join().unwrap().unwrap();
        assert_eq!(first, Some(Value::from("v1")));
        assert_eq!(second, Some(Value::from("v1")));
        assert!(other);
        assert_eq!(snapshot, Snapshot::new(1));
    });

    let after = reader.read(|txn| txn.object("k", "c")).unwrap();
    assert_eq!(after, Some(Value::from("v2")));
    assert_eq!(reader.snapshot(), Snapshot::new(2));
}

#[test]
fn read_write_bodies_never_overlap() {
    let db = memory();
    let inside = Arc::new(AtomicBool::new(false));
    let events = db.subscribe();
    let threads = 4;
    let commits = 10;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let db = db.clone();
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                let conn = db.new_connection();
                for i in 0..commits {
                    conn.read_write(|txn| {
                        assert!(!inside.swap(true, Ordering::SeqCst), "two writers at once");
                        txn.set_object(&format!("{t}-{i}"), "c", Value::from(i))?;
                        thread::sleep(Duration::from_micros(200));
                        inside.store(false, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Notifications go out while the write slot is held.
    let order: Vec<u64> = events.try_iter().map(|n| n.snapshot.as_u64()).collect();
    let expected: Vec<u64> = (1..=(threads * commits) as u64).collect();
    assert_eq!(order, expected);
}

#[test]
fn readers_run_while_a_writer_holds_the_slot() {
    let db = memory();
    populate(&db, "c", 3);
    let writer = db.new_connection();
    let reader = db.new_connection();
    let (holding_tx, holding_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let writer_ref = &writer;
    thread::scope(|s| {
        let writing = s.spawn(move || {
            writer_ref.read_write(|txn| {
                txn.set_object("new", "c", Value::from(true))?;
                holding_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(())
            })
        });

        holding_rx.recv().unwrap();
        let count = reader
            .read(|txn| Ok(txn.number_of_keys_in_collection("c")))
            .unwrap();
        assert_eq!(count, 3);
        release_tx.send(()).unwrap();
        writing.join().unwrap().unwrap();
    });

    let count = reader
        .read(|txn| Ok(txn.number_of_keys_in_collection("c")))
        .unwrap();
    assert_eq!(count, 4);
}

#[test]
fn removing_from_the_enumerated_collection_fails() {
    let db = memory();
    populate(&db, "users", 2);
    let conn = db.new_connection();
    let result = conn.read_write(|txn| {
        txn.enumerate_keys_in_collection("users", |txn, key| {
            txn.remove_object(key, "users")?;
            Ok(ControlFlow::Continue(()))
        })
    });
    assert!(matches!(
        result,
        Err(CoreError::MutationDuringEnumeration { .. })
    ));
    let count = conn
        .read(|txn| Ok(txn.number_of_keys_in_collection("users")))
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn mutating_another_collection_while_enumerating_is_allowed() {
    let db = memory();
    populate(&db, "users", 2);
    let conn = db.new_connection();
    conn.read_write(|txn| {
        txn.enumerate_keys_in_collection("users", |txn, key| {
            txn.set_object(key, "products", Value::from(key))?;
            Ok(ControlFlow::Continue(()))
        })
    })
    .unwrap();
    let count = conn
        .read(|txn| Ok(txn.number_of_keys_in_collection("products")))
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn replacing_a_missing_row_changes_nothing() {
    let db = memory();
    populate(&db, "c", 1);
    let before = yapdb_testkit::Model::load(&db.new_connection()).unwrap();
    let conn = db.new_connection();
    conn.read_write(|txn| {
        txn.replace_object("missing", "c", Value::from(1))?;
        txn.replace_metadata("missing", "c", Some(Value::from(2)))
    })
    .unwrap();
    let after = yapdb_testkit::Model::load(&db.new_connection()).unwrap();
    assert_eq!(before, after);
}

#[test]
fn notes_scenario_across_two_connections() {
    let test_db = TestDatabase::file();
    let a = test_db.new_connection();
    let b = test_db.new_connection();

    // B goes idle at S - 1.
    b.read(|_| Ok(())).unwrap();
    let idle = b.snapshot();

    a.read_write(|txn| txn.set_object("1", "notes", Value::from("hello")))
        .unwrap();
    let s = a.snapshot();
    assert_eq!(s, idle.next());

    let seen = b.read(|txn| txn.object("1", "notes")).unwrap();
    assert_eq!(seen, Some(Value::from("hello")));
    assert_eq!(b.snapshot(), s);

    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let b_ref = &b;
    thread::scope(|scope| {
        let in_progress = scope.spawn(move || {
            b_ref.read(|txn| {
                started_tx.send(()).unwrap();
                resume_rx.recv().unwrap();
                txn.object("1", "notes")
            })
        });
        started_rx.recv().unwrap();
        a.read_write(|txn| txn.remove_object("1", "notes")).unwrap();
        assert_eq!(a.snapshot(), s.next());
        resume_tx.send(()).unwrap();
        assert_eq!(in_progress.join().unwrap().unwrap(), Some(Value::from("hello")));
    });

    let next = b.read(|txn| txn.object("1", "notes")).unwrap();
    assert_eq!(next, None);
    assert_eq!(b.snapshot(), s.next());
}
