//! Benchmark utilities.

use rand::Rng;
use yapdb_core::{Connection, Database, DatabaseOptions, Value};

/// Collection used by every benchmark.
pub const COLLECTION: &str = "bench";

/// Generate random bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// A blob object of `size` random bytes.
pub fn random_object(size: usize) -> Value {
    Value::Bytes(random_data(size))
}

/// Keys `0..count` as strings.
pub fn keys(count: usize) -> Vec<String> {
    (0..count).map(|i| i.to_string()).collect()
}

/// An in-memory database that never checkpoints on its own, so that
/// measurements do not include background work.
pub fn quiet_database(options: DatabaseOptions) -> Database {
    Database::open_in_memory(options.auto_checkpoint_interval(0))
        .expect("Failed to open in-memory database")
}

/// Writes `count` rows of `payload_size` random bytes in one transaction and
/// returns their keys.
pub fn populate(conn: &Connection, count: usize, payload_size: usize) -> Vec<String> {
    let keys = keys(count);
    conn.read_write(|txn| {
        for key in &keys {
            txn.set_object(key, COLLECTION, random_object(payload_size))?;
        }
        Ok(())
    })
    .expect("Failed to populate");
    keys
}
