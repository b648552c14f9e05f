//! Property-based test generators using proptest.
//!
//! Provides strategies for random operations over a deliberately small key
//! space, so that generated transactions collide, together with a plain
//! in-memory [`Model`] that the database must agree with.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use yapdb_core::{Connection, CoreResult, ReadWriteTransaction, Value};

/// Strategy for generating collection names from a small pool.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["", "users", "posts", "tags"]).prop_map(String::from)
}

/// Strategy for generating keys from a small pool.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-e]{1,2}").expect("Invalid regex")
}

/// Strategy for generating stored values. Floats are left out so that
/// values compare with `==`.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|i| Value::Integer(i.into())),
        "[a-z ]{0,12}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,6}".prop_map(Value::Text), inner), 0..4)
                .prop_map(Value::Map),
        ]
    })
}

/// One mutation of a read-write transaction.
#[derive(Debug, Clone)]
pub enum Operation {
    /// `set_object_with_metadata`; `None` metadata is a plain `set_object`.
    Set {
        /// Collection name
        collection: String,
        /// Key
        key: String,
        /// Object
        object: Value,
        /// Metadata
        metadata: Option<Value>,
    },
    /// `replace_object`
    ReplaceObject {
        /// Collection name
        collection: String,
        /// Key
        key: String,
        /// Object
        object: Value,
    },
    /// `replace_metadata`
    ReplaceMetadata {
        /// Collection name
        collection: String,
        /// Key
        key: String,
        /// Metadata
        metadata: Option<Value>,
    },
    /// `touch_row`
    Touch {
        /// Collection name
        collection: String,
        /// Key
        key: String,
    },
    /// `remove_object`
    Remove {
        /// Collection name
        collection: String,
        /// Key
        key: String,
    },
    /// `remove_object` followed by `set_object` on the same key, so the row
    /// comes back under a new rowid within one transaction.
    Reinsert {
        /// Collection name
        collection: String,
        /// Key
        key: String,
        /// Object
        object: Value,
    },
    /// `remove_all_in_collection`
    RemoveCollection {
        /// Collection name
        collection: String,
    },
    /// `remove_all_in_all_collections`
    RemoveAll,
}

impl Operation {
    /// Applies the operation to a read-write transaction.
    ///
    /// # Errors
    ///
    /// Propagates the transaction's error.
    pub fn apply(&self, txn: &mut ReadWriteTransaction<'_>) -> CoreResult<()> {
        match self {
            Self::Set {
                collection,
                key,
                object,
                metadata: None,
            } => txn.set_object(key, collection, object.clone()),
            Self::Set {
                collection,
                key,
                object,
                metadata,
            } => txn.set_object_with_metadata(key, collection, object.clone(), metadata.clone()),
            Self::ReplaceObject {
                collection,
                key,
                object,
            } => txn.replace_object(key, collection, object.clone()),
            Self::ReplaceMetadata {
                collection,
                key,
                metadata,
            } => txn.replace_metadata(key, collection, metadata.clone()),
            Self::Touch { collection, key } => txn.touch_row(key, collection),
            Self::Remove { collection, key } => txn.remove_object(key, collection),
            Self::Reinsert {
                collection,
                key,
                object,
            } => {
                txn.remove_object(key, collection)?;
                txn.set_object(key, collection, object.clone())
            }
            Self::RemoveCollection { collection } => txn.remove_all_in_collection(collection),
            Self::RemoveAll => txn.remove_all_in_all_collections(),
        }
    }
}

/// Strategy for generating single operations. Removals are rarer than
/// writes so that the database does not stay empty.
pub fn operation_strategy() -> impl Strategy<Value = Operation> {
    let address = || (collection_name_strategy(), key_strategy());
    prop_oneof![
        6 => (address(), value_strategy(), prop::option::of(value_strategy())).prop_map(
            |((collection, key), object, metadata)| Operation::Set {
                collection,
                key,
                object,
                metadata,
            }
        ),
        2 => (address(), value_strategy()).prop_map(|((collection, key), object)| {
            Operation::ReplaceObject {
                collection,
                key,
                object,
            }
        }),
        2 => (address(), prop::option::of(value_strategy())).prop_map(
            |((collection, key), metadata)| Operation::ReplaceMetadata {
                collection,
                key,
                metadata,
            }
        ),
        1 => address().prop_map(|(collection, key)| Operation::Touch { collection, key }),
        2 => address().prop_map(|(collection, key)| Operation::Remove { collection, key }),
        2 => (address(), value_strategy()).prop_map(|((collection, key), object)| {
            Operation::Reinsert {
                collection,
                key,
                object,
            }
        }),
        1 => collection_name_strategy().prop_map(|collection| Operation::RemoveCollection {
            collection
        }),
        1 => Just(Operation::RemoveAll),
    ]
}

/// Strategy for generating a sequence of transactions, each a sequence of
/// operations.
pub fn transaction_sequence_strategy(
    transactions: std::ops::Range<usize>,
    operations: std::ops::Range<usize>,
) -> impl Strategy<Value = Vec<Vec<Operation>>> {
    prop::collection::vec(
        prop::collection::vec(operation_strategy(), operations),
        transactions,
    )
}

/// A row as the model sees it.
pub type ModelRow = (Value, Option<Value>);

/// Reference semantics for the row operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    /// Rows by `(collection, key)`.
    pub rows: BTreeMap<(String, String), ModelRow>,
}

impl Model {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one operation.
    pub fn apply(&mut self, op: &Operation) {
        match op {
            Operation::Set {
                collection,
                key,
                object,
                metadata,
            } => {
                self.rows.insert(
                    (collection.clone(), key.clone()),
                    (object.clone(), metadata.clone()),
                );
            }
            Operation::ReplaceObject {
                collection,
                key,
                object,
            } => {
                if let Some(row) = self.rows.get_mut(&(collection.clone(), key.clone())) {
                    row.0 = object.clone();
                }
            }
            Operation::ReplaceMetadata {
                collection,
                key,
                metadata,
            } => {
                if let Some(row) = self.rows.get_mut(&(collection.clone(), key.clone())) {
                    row.1 = metadata.clone();
                }
            }
            Operation::Touch { .. } => {}
            Operation::Remove { collection, key } => {
                self.rows.remove(&(collection.clone(), key.clone()));
            }
            Operation::Reinsert {
                collection,
                key,
                object,
            } => {
                self.rows
                    .insert((collection.clone(), key.clone()), (object.clone(), None));
            }
            Operation::RemoveCollection { collection } => {
                self.rows.retain(|(c, _), _| c != collection);
            }
            Operation::RemoveAll => self.rows.clear(),
        }
    }

    /// Applies a sequence of operations.
    pub fn apply_all<'a>(&mut self, ops: impl IntoIterator<Item = &'a Operation>) {
        for op in ops {
            self.apply(op);
        }
    }

    /// Reads every row visible to a new read transaction on `conn`.
    ///
    /// # Errors
    ///
    /// Propagates read errors.
    pub fn load(conn: &Connection) -> CoreResult<Self> {
        conn.read(|txn| {
            let mut rows = BTreeMap::new();
            txn.enumerate_rows_in_all_collections(None, |_, collection, key, object, metadata| {
                rows.insert(
                    (collection.to_string(), key.to_string()),
                    (object.clone(), metadata.cloned()),
                );
                Ok(ControlFlow::Continue(()))
            })?;
            Ok(Self { rows })
        })
    }
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_follows_row_semantics() {
        let set = |key: &str, object: i64, metadata: Option<i64>| Operation::Set {
            collection: "c".into(),
            key: key.into(),
            object: Value::from(object),
            metadata: metadata.map(Value::from),
        };
        let mut model = Model::new();
        model.apply_all(&[
            set("a", 1, Some(10)),
            Operation::ReplaceObject {
                collection: "c".into(),
                key: "a".into(),
                object: Value::from(2),
            },
            Operation::ReplaceMetadata {
                collection: "c".into(),
                key: "missing".into(),
                metadata: Some(Value::from(0)),
            },
            set("b", 3, None),
            Operation::Reinsert {
                collection: "c".into(),
                key: "b".into(),
                object: Value::from(4),
            },
        ]);
        assert_eq!(
            model.rows.get(&("c".to_string(), "a".to_string())),
            Some(&(Value::from(2), Some(Value::from(10))))
        );
        assert_eq!(
            model.rows.get(&("c".to_string(), "b".to_string())),
            Some(&(Value::from(4), None))
        );
        assert_eq!(model.rows.len(), 2);

        model.apply(&Operation::RemoveCollection {
            collection: "c".into(),
        });
        assert!(model.rows.is_empty());
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn collection_names_come_from_the_pool(name in collection_name_strategy()) {
            prop_assert!(["", "users", "posts", "tags"].contains(&name.as_str()));
        }

        #[test]
        fn keys_are_short(key in key_strategy()) {
            prop_assert!(!key.is_empty() && key.len() <= 2);
        }

        #[test]
        fn generated_values_are_self_equal(value in value_strategy()) {
            prop_assert_eq!(value.clone(), value);
        }
    }
}
