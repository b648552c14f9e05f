//! Integration tests for the extension hook protocol.

use std::sync::Arc;
use yapdb_core::extension::SecondaryIndexTransaction;
use yapdb_core::{
    CollectionKey, Connection, CoreResult, Database, DatabaseOptions, IndexBlock, IndexValue,
    ReadWriteTransaction, SecondaryIndex, Snapshot, Value,
};
use yapdb_testkit::{HookEvent, HookLog, RecordingExtension, RecordingTransaction};

const RECORDING: &str = "recording";
const BY_COLOR: &str = "by_color";

fn color_block() -> IndexBlock {
    Arc::new(|_c: &str, _k: &str, object: &Value, _m: Option<&Value>| {
        object.as_text().map(IndexValue::from)
    })
}

fn recorded_database(options: DatabaseOptions) -> (Database, HookLog) {
    let db = Database::open_in_memory(options).unwrap();
    let log = HookLog::default();
    db.register_extension(RECORDING, Arc::new(RecordingExtension::new(log.clone())))
        .unwrap();
    db.register_extension(BY_COLOR, Arc::new(SecondaryIndex::new(color_block())))
        .unwrap();
    log.take();
    (db, log)
}

/// Runs a write on `conn` and returns its events, which all come from one
/// connection half.
fn write_events(
    conn: &Connection,
    log: &HookLog,
    body: impl FnOnce(&mut ReadWriteTransaction<'_>) -> CoreResult<()>,
) -> (CoreResult<()>, Vec<HookEvent>) {
    log.take();
    let result = conn.read_write(body);
    let events = log.take();
    if let Some((sequence, _)) = events.first() {
        assert!(events.iter().all(|(s, _)| s == sequence));
    }
    (result, events.into_iter().map(|(_, e)| e).collect())
}

fn logged(conn: &Connection, key: &str, collection: &str) -> bool {
    conn.read(|txn| {
        let view = txn.ext::<RecordingTransaction>(RECORDING)?;
        Ok(view.tables().get("log", collection, key).is_some())
    })
    .unwrap()
}

fn color_count(conn: &Connection, color: &str) -> usize {
    conn.read(|txn| Ok(txn.ext::<SecondaryIndexTransaction>(BY_COLOR)?.count_for_value(color)))
        .unwrap()
}

#[test]
fn hooks_run_in_transaction_order() {
    let (db, log) = recorded_database(DatabaseOptions::default());
    let start = db.snapshot();
    let writer = db.new_connection();
    let key = CollectionKey::new("cars", "1");

    let (result, events) = write_events(&writer, &log, |txn| {
        txn.set_object("1", "cars", Value::from("red"))?;
        txn.set_object("1", "cars", Value::from("blue"))?;
        txn.replace_metadata("1", "cars", Some(Value::from(7)))?;
        txn.touch_object("1", "cars")?;
        txn.remove_object("1", "cars")
    });
    result.unwrap();
    assert_eq!(
        events,
        vec![
            HookEvent::Begin {
                snapshot: start,
                writable: true
            },
            HookEvent::Insert(key.clone()),
            HookEvent::Update(key.clone()),
            HookEvent::ReplaceMetadata(key.clone()),
            HookEvent::TouchObject(key.clone()),
            HookEvent::Remove(key),
            HookEvent::Flush,
            HookEvent::Finish,
            HookEvent::Committed(start.next()),
        ]
    );
}

#[test]
fn inserted_row_is_seen_exactly_once_everywhere() {
    let (db, log) = recorded_database(DatabaseOptions::default());
    let writer = db.new_connection();
    let sibling = db.new_connection();
    sibling.read(|_| Ok(())).unwrap();

    let (result, events) = write_events(&writer, &log, |txn| {
        txn.set_object("r", "cars", Value::from("red"))
    });
    result.unwrap();
    let inserts = events
        .iter()
        .filter(|e| **e == HookEvent::Insert(CollectionKey::new("cars", "r")))
        .count();
    assert_eq!(inserts, 1);

    // The sibling folds in the changeset; it never replays the hooks.
    log.take();
    assert_eq!(color_count(&sibling, "red"), 1);
    let sibling_events: Vec<HookEvent> = log.take().into_iter().map(|(_, e)| e).collect();
    assert!(!sibling_events.iter().any(HookEvent::is_mutation));
    assert_eq!(sibling_events[0], HookEvent::Processed(Some(1)));
    assert!(logged(&sibling, "r", "cars"));
    assert_eq!(color_count(&writer, "red"), 1);
}

#[test]
fn index_queries_follow_updates_on_siblings() {
    let (db, _log) = recorded_database(DatabaseOptions::default());
    let writer = db.new_connection();
    let sibling = db.new_connection();

    writer
        .read_write(|txn| {
            txn.set_object("1", "cars", Value::from("red"))?;
            txn.set_object("2", "cars", Value::from("red"))
        })
        .unwrap();
    // Fills the sibling's query cache for "red".
    assert_eq!(color_count(&sibling, "red"), 2);

    writer
        .read_write(|txn| txn.set_object("2", "cars", Value::from("green")))
        .unwrap();
    assert_eq!(color_count(&sibling, "red"), 1);
    assert_eq!(color_count(&sibling, "green"), 1);
    let keys = sibling
        .read(|txn| txn.ext::<SecondaryIndexTransaction>(BY_COLOR)?.keys_for_value("red"))
        .unwrap();
    assert_eq!(keys, vec![CollectionKey::new("cars", "1")]);
}

#[test]
fn failing_hook_rolls_the_transaction_back() {
    let db = Database::open_in_memory(DatabaseOptions::default()).unwrap();
    let log = HookLog::default();
    let refused = CollectionKey::new("cars", "bad");
    db.register_extension(
        RECORDING,
        Arc::new(RecordingExtension::new(log.clone()).failing_on(refused)),
    )
    .unwrap();
    let snapshot = db.snapshot();
    let writer = db.new_connection();

    let (result, events) = write_events(&writer, &log, |txn| {
        txn.set_object("ok", "cars", Value::from(1))?;
        txn.set_object("bad", "cars", Value::from(2))
    });
    assert!(result.is_err());
    assert_eq!(
        events,
        vec![
            HookEvent::Begin {
                snapshot,
                writable: true
            },
            HookEvent::Insert(CollectionKey::new("cars", "ok")),
            HookEvent::Finish,
            HookEvent::RolledBack,
        ]
    );
    assert_eq!(db.snapshot(), snapshot);
    assert!(!logged(&writer, "ok", "cars"));
    assert!(!writer.read(|txn| Ok(txn.has_object("ok", "cars"))).unwrap());
}

#[test]
fn replace_on_a_missing_row_calls_no_hook() {
    let (db, log) = recorded_database(DatabaseOptions::default());
    let writer = db.new_connection();
    let (result, events) = write_events(&writer, &log, |txn| {
        txn.replace_object("ghost", "cars", Value::from("red"))
    });
    result.unwrap();
    assert!(!events.iter().any(HookEvent::is_mutation));
    assert_eq!(color_count(&writer, "red"), 0);
}

#[test]
fn far_behind_sibling_invalidates_its_extension_state() {
    let options = DatabaseOptions::default().max_replay_changesets(1);
    let (db, log) = recorded_database(options);
    let writer = db.new_connection();
    let sibling = db.new_connection();

    for i in 0..3 {
        writer
            .read_write(|txn| txn.set_object(&i.to_string(), "cars", Value::from("red")))
            .unwrap();
    }
    log.take();
    assert_eq!(color_count(&sibling, "red"), 3);
    let events: Vec<HookEvent> = log.take().into_iter().map(|(_, e)| e).collect();
    assert!(events.contains(&HookEvent::Invalidated));
    assert!(!events.iter().any(|e| matches!(e, HookEvent::Processed(_))));
    assert_eq!(db.stats().snapshot().cache_invalidations, 1);
}

#[test]
fn multiprocess_siblings_always_invalidate() {
    let (db, log) = recorded_database(DatabaseOptions::default().multiprocess(true));
    let writer = db.new_connection();
    let sibling = db.new_connection();
    writer
        .read_write(|txn| txn.set_object("1", "cars", Value::from("red")))
        .unwrap();
    log.take();
    assert_eq!(color_count(&sibling, "red"), 1);
    let events: Vec<HookEvent> = log.take().into_iter().map(|(_, e)| e).collect();
    assert_eq!(events[0], HookEvent::Invalidated);
}

#[test]
fn registration_indexes_existing_rows_and_reaches_open_connections() {
    let db = Database::open_in_memory(DatabaseOptions::default()).unwrap();
    let early = db.new_connection();
    early
        .read_write(|txn| {
            txn.set_object("1", "cars", Value::from("red"))?;
            txn.set_object("2", "bikes", Value::from("red"))
        })
        .unwrap();

    let index = SecondaryIndex::new(color_block()).with_collections(["cars"]);
    db.register_extension(BY_COLOR, Arc::new(index)).unwrap();
    assert_eq!(db.registered_extension_names(), vec![BY_COLOR.to_string()]);

    // `early` existed before registration and adopts the new map on catch-up.
    assert_eq!(color_count(&early, "red"), 1);
    early
        .read_write(|txn| txn.set_object("3", "cars", Value::from("red")))
        .unwrap();
    assert_eq!(color_count(&db.new_connection(), "red"), 2);
}

#[test]
fn unregistering_drops_the_extension_everywhere() {
    let (db, _log) = recorded_database(DatabaseOptions::default());
    let conn = db.new_connection();
    conn.read_write(|txn| txn.set_object("1", "cars", Value::from("red")))
        .unwrap();

    db.unregister_extension(BY_COLOR).unwrap();
    assert_eq!(db.registered_extension_names(), vec![RECORDING.to_string()]);
    let missing = conn.read(|txn| txn.ext::<SecondaryIndexTransaction>(BY_COLOR).map(|_| ()));
    assert!(missing.is_err());
    assert!(!db
        .previously_registered_extension_names()
        .contains(&BY_COLOR.to_string()));
    assert_eq!(db.snapshot(), Snapshot::new(4));
}
