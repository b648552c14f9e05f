use crate::config::{ConnectionConfig, DatabaseOptions};
use crate::database::Database;
use crate::error::CoreError;
use crate::serialization::{cbor_deserialize, cbor_serialize, Serialization, ValueCodec};
use crate::types::{CollectionKey, Snapshot};
use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn db() -> Database {
    Database::open_in_memory(DatabaseOptions::default()).unwrap()
}

fn seed(db: &Database, collection: &str, keys: &[&str]) {
    db.new_connection()
        .read_write(|txn| {
            for (i, key) in keys.iter().enumerate() {
                txn.set_object(key, collection, Value::from(i as u64))?;
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn reads_see_writes_of_the_same_transaction() {
    let db = db();
    let conn = db.new_connection();
    conn.read_write(|txn| {
        txn.set_object_with_metadata("k", "c", Value::from("v"), Some(Value::from(1)))?;
        assert!(txn.has_object("k", "c"));
        assert_eq!(txn.object("k", "c")?, Some(Value::from("v")));
        assert_eq!(txn.metadata("k", "c")?, Some(Value::from(1)));
        assert_eq!(txn.number_of_keys_in_collection("c"), 1);
        Ok(())
    })
    .unwrap();
    assert_eq!(conn.snapshot(), Snapshot::new(1));
}

#[test]
fn set_object_clears_metadata() {
    let db = db();
    let conn = db.new_connection();
    conn.read_write(|txn| {
        txn.set_object_with_metadata("k", "c", Value::from(1), Some(Value::from("m")))
    })
    .unwrap();
    conn.read_write(|txn| txn.set_object("k", "c", Value::from(2)))
        .unwrap();
    let row = conn.read(|txn| txn.object_and_metadata("k", "c")).unwrap();
    assert_eq!(row, Some((Value::from(2), None)));
}

#[test]
fn replace_on_missing_row_is_a_no_op() {
    let db = db();
    let conn = db.new_connection();
    conn.read_write(|txn| {
        txn.replace_object("missing", "c", Value::from(1))?;
        txn.replace_metadata("missing", "c", Some(Value::from(2)))
    })
    .unwrap();
    assert!(!conn.read(|txn| Ok(txn.has_object("missing", "c"))).unwrap());
}

#[test]
fn replace_keeps_the_other_half_of_the_row() {
    let db = db();
    let conn = db.new_connection();
    conn.read_write(|txn| {
        txn.set_object_with_metadata("k", "c", Value::from("o1"), Some(Value::from("m1")))
    })
    .unwrap();
    let rowid = conn.read(|txn| Ok(txn.rowid_for_key("k", "c"))).unwrap();

    conn.read_write(|txn| txn.replace_object("k", "c", Value::from("o2")))
        .unwrap();
    conn.read_write(|txn| txn.replace_metadata("k", "c", Some(Value::from("m2"))))
        .unwrap();

    conn.read(|txn| {
        assert_eq!(
            txn.object_and_metadata("k", "c")?,
            Some((Value::from("o2"), Some(Value::from("m2"))))
        );
        assert_eq!(txn.rowid_for_key("k", "c"), rowid);
        Ok(())
    })
    .unwrap();
}

#[test]
fn removals_and_counts() {
    let db = db();
    seed(&db, "a", &["1", "2", "3"]);
    seed(&db, "b", &["1"]);
    let conn = db.new_connection();
    conn.read_write(|txn| {
        txn.remove_object("1", "a")?;
        txn.remove_objects(["2", "2", "nope"], "a")?;
        assert_eq!(txn.all_keys_in_collection("a"), vec!["3".to_string()]);
        txn.remove_all_in_collection("b")?;
        assert_eq!(txn.all_collections(), vec!["a".to_string()]);
        Ok(())
    })
    .unwrap();
    conn.read_write(|txn| txn.remove_all_in_all_collections())
        .unwrap();
    conn.read(|txn| {
        assert_eq!(txn.number_of_collections(), 0);
        assert_eq!(txn.number_of_keys_in_all_collections(), 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn mutation_during_enumeration_rolls_back() {
    let db = db();
    seed(&db, "users", &["a", "b"]);
    let conn = db.new_connection();
    let result = conn.read_write(|txn| {
        txn.set_object("z", "products", Value::from(0))?;
        let inner = txn.enumerate_keys_in_collection("users", |txn, key| {
            // The error is deliberately swallowed; the transaction still
            // refuses to commit.
            let _ = txn.remove_object(key, "users");
            Ok(ControlFlow::Continue(()))
        });
        assert!(matches!(
            inner,
            Err(CoreError::MutationDuringEnumeration { collection: Some(ref c) }) if c == "users"
        ));
        Ok(())
    });
    assert!(matches!(
        result,
        Err(CoreError::MutationDuringEnumeration { .. })
    ));
    assert_eq!(db.snapshot(), Snapshot::new(1));
    conn.read(|txn| {
        assert_eq!(txn.number_of_keys_in_collection("users"), 2);
        assert!(!txn.has_object("z", "products"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn other_collections_and_touches_are_allowed_while_enumerating() {
    let db = db();
    seed(&db, "users", &["a", "b"]);
    let conn = db.new_connection();
    conn.read_write(|txn| {
        txn.enumerate_keys_and_objects("users", None, |txn, key, _object| {
            txn.touch_object(key, "users")?;
            txn.set_object(key, "audit", Value::from(true))?;
            Ok(ControlFlow::Continue(()))
        })
    })
    .unwrap();
    let audited = conn.read(|txn| Ok(txn.number_of_keys_in_collection("audit"))).unwrap();
    assert_eq!(audited, 2);
}

#[test]
fn all_collection_enumeration_blocks_every_collection() {
    let db = db();
    seed(&db, "users", &["a"]);
    let conn = db.new_connection();
    let result = conn.read_write(|txn| {
        txn.enumerate_keys_in_all_collections(|txn, _collection, _key| {
            txn.set_object("x", "elsewhere", Value::from(1))?;
            Ok(ControlFlow::Continue(()))
        })
    });
    assert!(matches!(
        result,
        Err(CoreError::MutationDuringEnumeration { collection: None })
    ));
}

#[test]
fn key_filter_runs_before_any_fetch() {
    let decodes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&decodes);
    let codec = ValueCodec::default().with_deserializer(Arc::new(move |c: &str, k: &str, bytes: &[u8]| {
        counter.fetch_add(1, Ordering::SeqCst);
        cbor_deserialize(c, k, bytes)
    }));
    let db = Database::builder()
        .options(
            DatabaseOptions::default()
                .connection_defaults(ConnectionConfig::default().object_cache_enabled(false)),
        )
        .serialization(Serialization::new().object(codec))
        .open()
        .unwrap();
    seed(&db, "c", &["keep", "skip1", "skip2"]);

    let conn = db.new_connection();
    let mut seen = Vec::new();
    conn.read(|txn| {
        let mut filter = |_: &str, key: &str| key == "keep";
        txn.enumerate_keys_and_objects("c", Some(&mut filter), |_, key, _| {
            seen.push(key.to_string());
            Ok(ControlFlow::Continue(()))
        })
    })
    .unwrap();
    assert_eq!(seen, vec!["keep".to_string()]);
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
}

#[test]
fn break_stops_an_enumeration() {
    let db = db();
    seed(&db, "c", &["1", "2", "3", "4"]);
    let conn = db.new_connection();
    let mut visited = 0;
    conn.read(|txn| {
        txn.enumerate_rows("c", None, |_, _, _, _| {
            visited += 1;
            Ok(if visited == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            })
        })
    })
    .unwrap();
    assert_eq!(visited, 2);
}

#[test]
fn bulk_fetch_reports_missing_rows() {
    let db = db();
    seed(&db, "c", &["a", "b"]);
    let conn = db.new_connection();
    let mut found = Vec::new();
    conn.read(|txn| {
        txn.enumerate_objects_for_keys(["b", "ghost", "a"], "c", |_, key, object| {
            found.push((key.to_string(), object.is_some()));
            Ok(ControlFlow::Continue(()))
        })
    })
    .unwrap();
    assert_eq!(
        found,
        vec![
            ("b".to_string(), true),
            ("ghost".to_string(), false),
            ("a".to_string(), true),
        ]
    );
}

#[test]
fn bulk_metadata_fetch_keeps_the_given_order() {
    let db = db();
    let conn = db.new_connection();
    conn.read_write(|txn| {
        txn.set_object_with_metadata("a", "c", Value::from(1), Some(Value::from("ma")))?;
        txn.set_object("b", "c", Value::from(2))
    })
    .unwrap();
    let mut found = Vec::new();
    conn.read(|txn| {
        txn.enumerate_metadata_for_keys(["ghost", "b", "a"], "c", |_, key, metadata| {
            found.push((key.to_string(), metadata.cloned()));
            Ok(ControlFlow::Continue(()))
        })
    })
    .unwrap();
    assert_eq!(
        found,
        vec![
            ("ghost".to_string(), None),
            ("b".to_string(), None),
            ("a".to_string(), Some(Value::from("ma"))),
        ]
    );
}

#[test]
fn collections_for_key_lists_only_holders() {
    let db = db();
    seed(&db, "users", &["42", "7"]);
    seed(&db, "orders", &["42"]);
    seed(&db, "products", &["9"]);
    let conn = db.new_connection();
    let mut holders = Vec::new();
    conn.read(|txn| {
        txn.enumerate_collections_for_key("42", |_, collection| {
            holders.push(collection.to_string());
            Ok(ControlFlow::Continue(()))
        })
    })
    .unwrap();
    assert_eq!(holders, vec!["orders".to_string(), "users".to_string()]);
}

#[test]
fn primitive_data_is_stored_verbatim() {
    let db = db();
    let conn = db.new_connection();
    let data = cbor_serialize("c", "k", &Value::from("raw")).unwrap();
    let metadata = cbor_serialize("c", "k", &Value::from(5)).unwrap();
    conn.read_write(|txn| txn.set_primitive_data("k", "c", data.clone(), Some(metadata.clone())))
        .unwrap();

    let sibling = db.new_connection();
    sibling
        .read(|txn| {
            assert_eq!(txn.serialized_object("k", "c"), Some(data.clone()));
            assert_eq!(txn.serialized_metadata("k", "c"), Some(metadata.clone()));
            assert_eq!(txn.object("k", "c")?, Some(Value::from("raw")));
            assert_eq!(txn.metadata("k", "c")?, Some(Value::from(5)));
            Ok(())
        })
        .unwrap();

    let replaced = cbor_serialize("c", "k", &Value::from("cooked")).unwrap();
    conn.read_write(|txn| {
        txn.replace_primitive_data("k", "c", replaced.clone())?;
        txn.replace_primitive_data("missing", "c", replaced.clone())
    })
    .unwrap();
    let row = sibling.read(|txn| txn.object_and_metadata("k", "c")).unwrap();
    assert_eq!(row, Some((Value::from("cooked"), Some(Value::from(5)))));
    assert!(!sibling.read(|txn| Ok(txn.has_object("missing", "c"))).unwrap());
}

#[test]
fn undecodable_primitive_data_rolls_back() {
    let db = db();
    let conn = db.new_connection();
    let result = conn.read_write(|txn| {
        txn.set_object("ok", "c", Value::from(1))?;
        txn.set_primitive_data("bad", "c", vec![0xff], None)
    });
    assert!(matches!(result, Err(CoreError::Deserialization { .. })));
    assert_eq!(db.snapshot(), Snapshot::ZERO);
}

#[test]
fn explicit_rollback_discards_writes() {
    let db = db();
    let conn = db.new_connection();
    let value = conn
        .read_write(|txn| {
            txn.set_object("k", "c", Value::from(1))?;
            txn.rollback();
            assert!(txn.will_roll_back());
            Ok(42)
        })
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(db.snapshot(), Snapshot::ZERO);
    assert_eq!(conn.cached_object("k", "c"), None);
    assert!(!conn.read(|txn| Ok(txn.has_object("k", "c"))).unwrap());
    assert_eq!(db.stats().snapshot().rollbacks, 1);
}

#[test]
fn body_error_discards_writes() {
    let db = db();
    let conn = db.new_connection();
    let result: Result<(), _> = conn.read_write(|txn| {
        txn.set_object("k", "c", Value::from(1))?;
        Err(CoreError::invalid_operation("changed my mind"))
    });
    assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    assert!(!conn.read(|txn| Ok(txn.has_object("k", "c"))).unwrap());
}

#[test]
fn rejected_value_poisons_the_transaction() {
    let codec = ValueCodec::default().with_pre_sanitizer(Arc::new(|c: &str, k: &str, value: Value| {
        if value.is_null() {
            Err(CoreError::sanitizer_rejected(c, k, "null objects are not stored"))
        } else {
            Ok(value)
        }
    }));
    let db = Database::builder()
        .serialization(Serialization::new().object(codec))
        .open()
        .unwrap();
    let conn = db.new_connection();
    let result = conn.read_write(|txn| {
        txn.set_object("ok", "c", Value::from(1))?;
        let _ = txn.set_object("bad", "c", Value::Null);
        Ok(())
    });
    assert!(result.is_err());
    assert_eq!(db.snapshot(), Snapshot::ZERO);
}

#[test]
fn typed_objects_round_trip_through_serde() {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
        stars: u8,
    }

    let db = db();
    let conn = db.new_connection();
    let note = Note {
        title: "groceries".into(),
        stars: 3,
    };
    conn.read_write(|txn| txn.set_typed("n1", "notes", &note))
        .unwrap();
    let loaded: Option<Note> = conn.read(|txn| txn.object_typed("n1", "notes")).unwrap();
    assert_eq!(loaded, Some(note));
}

#[test]
fn unknown_extension_is_reported() {
    use crate::extension::SecondaryIndexTransaction;

    let db = db();
    let result = db
        .new_connection()
        .read(|txn| txn.ext::<SecondaryIndexTransaction>("nope").map(|_| ()));
    assert!(matches!(result, Err(CoreError::ExtensionNotFound { .. })));
}

#[test]
fn custom_notification_object_travels_with_the_commit() {
    let db = db();
    let events = db.subscribe();
    db.new_connection()
        .read_write(|txn| {
            txn.set_custom_notification_object(Value::from("sync"));
            assert_eq!(txn.custom_notification_object(), Some(&Value::from("sync")));
            Ok(())
        })
        .unwrap();
    let event = events.try_recv().unwrap();
    assert_eq!(event.custom, Some(Value::from("sync")));
    assert!(event.changes.is_empty());
}

#[test]
#[should_panic(expected = "inside another transaction")]
fn nested_transaction_on_one_connection_panics() {
    let db = db();
    let conn = db.new_connection();
    let _ = conn.read(|_| conn.read(|_| Ok(())));
}

#[test]
fn snapshot_is_readable_inside_a_transaction_body() {
    let db = db();
    let conn = db.new_connection();
    seed(&db, "c", &["a"]);
    let inside = conn.read(|txn| Ok((txn.snapshot(), conn.snapshot()))).unwrap();
    assert_eq!(inside, (Snapshot::new(1), Snapshot::new(1)));

    let described = conn
        .read_write(|txn| {
            txn.set_object("b", "c", Value::from(2))?;
            Ok(format!("{conn:?}"))
        })
        .unwrap();
    assert!(described.contains("snapshot"));
    assert_eq!(conn.snapshot(), Snapshot::new(2));
}

#[test]
#[should_panic(expected = "inside another transaction")]
fn cache_configuration_inside_a_transaction_panics() {
    let db = db();
    let conn = db.new_connection();
    let _ = conn.read(|_| {
        conn.set_object_cache_limit(3);
        Ok(())
    });
}

#[test]
#[should_panic(expected = "inside another transaction")]
fn cached_object_inside_a_transaction_panics() {
    let db = db();
    let conn = db.new_connection();
    let _ = conn.read_write(|_| Ok(conn.cached_object("k", "c")));
}

#[test]
fn sibling_forgets_the_rowid_of_a_reinserted_row() {
    let db = db();
    let writer = db.new_connection();
    let sibling = db.new_connection();
    seed(&db, "notes", &["1"]);

    let old = sibling
        .read(|txn| {
            let rowid = txn.rowid_for_key("1", "notes").unwrap();
            assert_eq!(
                txn.collection_key_for_rowid(rowid),
                Some(CollectionKey::new("notes", "1"))
            );
            Ok(rowid)
        })
        .unwrap();

    writer
        .read_write(|txn| {
            txn.remove_object("1", "notes")?;
            txn.set_object("1", "notes", Value::from("again"))
        })
        .unwrap();

    let fresh = db.new_connection();
    let expected = fresh.read(|txn| Ok(txn.collection_key_for_rowid(old))).unwrap();
    assert_eq!(expected, None);
    let (seen, new) = sibling
        .read(|txn| {
            let new = txn.rowid_for_key("1", "notes").unwrap();
            Ok((txn.collection_key_for_rowid(old), new))
        })
        .unwrap();
    assert_eq!(seen, expected);
    assert_ne!(new, old);
    assert_eq!(
        sibling.read(|txn| txn.object("1", "notes")).unwrap(),
        Some(Value::from("again"))
    );
}
