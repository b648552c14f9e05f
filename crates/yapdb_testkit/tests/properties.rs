//! Property tests for snapshot numbering and changeset replay.

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use yapdb_core::{
    CollectionKey, Connection, CoreResult, Database, DatabaseOptions, RowId, Snapshot, Value,
};
use yapdb_testkit::{transaction_sequence_strategy, IntegrationHarness, Model, Operation, PropTestConfig};

fn addresses(transactions: &[Vec<Operation>]) -> BTreeSet<(String, String)> {
    transactions
        .iter()
        .flatten()
        .filter_map(|op| match op {
            Operation::Set { collection, key, .. }
            | Operation::ReplaceObject { collection, key, .. }
            | Operation::ReplaceMetadata { collection, key, .. }
            | Operation::Touch { collection, key }
            | Operation::Remove { collection, key }
            | Operation::Reinsert { collection, key, .. } => {
                Some((collection.clone(), key.clone()))
            }
            Operation::RemoveCollection { .. } | Operation::RemoveAll => None,
        })
        .collect()
}

/// Every object and metadata entry cached by `conn` must match the model.
fn assert_cache_agrees(conn: &Connection, model: &Model, addresses: &BTreeSet<(String, String)>) {
    for (collection, key) in addresses {
        let expected = model.rows.get(&(collection.clone(), key.clone()));
        if let Some(cached) = conn.cached_object(key, collection) {
            assert_eq!(
                Some(&cached),
                expected.map(|(object, _)| object),
                "stale object for {collection}/{key}"
            );
        }
        if let Some(cached) = conn.cached_metadata(key, collection) {
            assert_eq!(
                Some(&cached),
                expected.map(|(_, metadata)| metadata),
                "stale metadata for {collection}/{key}"
            );
        }
    }
}

/// Resolves every known rowid through `conn`'s rowid cache, filling it.
fn rowids_of(
    conn: &Connection,
    addresses: &BTreeSet<(String, String)>,
) -> CoreResult<BTreeMap<RowId, Option<CollectionKey>>> {
    conn.read(|txn| {
        let mut rowids = BTreeMap::new();
        for (collection, key) in addresses {
            if let Some(rowid) = txn.rowid_for_key(key, collection) {
                rowids.insert(rowid, txn.collection_key_for_rowid(rowid));
            }
        }
        Ok(rowids)
    })
}

/// Every rowid `conn` resolved before must resolve as a fresh reader does.
fn assert_rowids_agree(
    conn: &Connection,
    fresh: &Connection,
    rowids: &BTreeMap<RowId, Option<CollectionKey>>,
) -> CoreResult<()> {
    let resolve = |conn: &Connection| {
        conn.read(|txn| {
            Ok(rowids
                .keys()
                .map(|&rowid| (rowid, txn.collection_key_for_rowid(rowid)))
                .collect::<Vec<_>>())
        })
    };
    let cached = resolve(conn)?;
    let expected = resolve(fresh)?;
    for ((rowid, cached), (_, expected)) in cached.iter().zip(&expected) {
        assert_eq!(cached, expected, "stale address for rowid {rowid:?}");
    }
    Ok(())
}

fn replay_equivalence(
    db: Database,
    prefix: &[Vec<Operation>],
    suffix: &[Vec<Operation>],
) -> Result<(), TestCaseError> {
    let mut harness = IntegrationHarness::with_database(db);
    for ops in prefix {
        harness.commit(ops).map_err(|e| TestCaseError::fail(e.to_string()))?;
    }

    // Reading everything fills the sibling's caches at snapshot N.
    let sibling = harness.db.new_connection();
    let before = Model::load(&sibling).map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert_eq!(&before, harness.model());
    let all: Vec<Vec<Operation>> = prefix.iter().chain(suffix).cloned().collect();
    let rowids =
        rowids_of(&sibling, &addresses(&all)).map_err(|e| TestCaseError::fail(e.to_string()))?;

    for ops in suffix {
        harness.commit(ops).map_err(|e| TestCaseError::fail(e.to_string()))?;
    }

    let replayed = Model::load(&sibling).map_err(|e| TestCaseError::fail(e.to_string()))?;
    let fresh_conn = harness.db.new_connection();
    let fresh = Model::load(&fresh_conn).map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert_eq!(&replayed, harness.model());
    prop_assert_eq!(&fresh, harness.model());
    prop_assert_eq!(sibling.snapshot(), harness.db.snapshot());
    assert_cache_agrees(&sibling, harness.model(), &addresses(&all));
    assert_rowids_agree(&sibling, &fresh_conn, &rowids)
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    Ok(())
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn snapshots_increase_by_one_per_commit(
        transactions in transaction_sequence_strategy(1..12, 0..6)
    ) {
        let mut harness = IntegrationHarness::new();
        let events = harness.db.subscribe();
        for (i, ops) in transactions.iter().enumerate() {
            harness.commit(ops).map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(harness.db.snapshot(), Snapshot::new(i as u64 + 1));
        }
        let published: Vec<u64> = events.try_iter().map(|n| n.snapshot.as_u64()).collect();
        let expected: Vec<u64> = (1..=transactions.len() as u64).collect();
        prop_assert_eq!(published, expected);
    }

    #[test]
    fn replayed_sibling_matches_a_fresh_reader(
        prefix in transaction_sequence_strategy(0..4, 1..6),
        suffix in transaction_sequence_strategy(1..8, 1..6),
    ) {
        let db = Database::open_in_memory(DatabaseOptions::default())
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        replay_equivalence(db, &prefix, &suffix)?;
    }

    #[test]
    fn invalidated_sibling_matches_a_fresh_reader(
        prefix in transaction_sequence_strategy(0..4, 1..6),
        suffix in transaction_sequence_strategy(1..8, 1..6),
    ) {
        let options = DatabaseOptions::default().max_replay_changesets(2);
        let db = Database::open_in_memory(options)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        replay_equivalence(db, &prefix, &suffix)?;
    }

    #[test]
    fn rolled_back_transactions_leave_no_trace(
        committed in transaction_sequence_strategy(1..4, 1..6),
        aborted in transaction_sequence_strategy(1..4, 1..6),
    ) {
        let mut harness = IntegrationHarness::new();
        let sibling = harness.db.new_connection();
        for ops in &committed {
            harness.commit(ops).map_err(|e| TestCaseError::fail(e.to_string()))?;
        }
        let snapshot = harness.db.snapshot();
        for ops in &aborted {
            harness.commit_and_roll_back(ops);
        }
        prop_assert_eq!(harness.db.snapshot(), snapshot);
        harness.verify_writer();
        harness.verify(&sibling);
    }
}

#[test]
fn concurrent_writers_share_one_gapless_sequence() {
    let db = Database::open_in_memory(DatabaseOptions::default()).unwrap();
    let writers = 4;
    let commits = 25;

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let db = db.clone();
            thread::spawn(move || {
                let conn = db.new_connection();
                let mut snapshots = Vec::with_capacity(commits);
                for i in 0..commits {
                    conn.read_write(|txn| {
                        txn.set_object(&i.to_string(), &format!("writer{w}"), Value::from(i as u64))
                    })
                    .unwrap();
                    snapshots.push(conn.snapshot().as_u64());
                }
                snapshots
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        let snapshots = handle.join().unwrap();
        assert!(snapshots.windows(2).all(|pair| pair[0] < pair[1]));
        all.extend(snapshots);
    }
    all.sort_unstable();
    let expected: Vec<u64> = (1..=(writers * commits) as u64).collect();
    assert_eq!(all, expected);
    assert_eq!(db.snapshot(), Snapshot::new((writers * commits) as u64));
}
