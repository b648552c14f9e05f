//! Registration and unregistration, run inside a read-write transaction.

use super::settings::{self, PersistedRegistration};
use super::tables::{table_name, WriteTables};
use super::{Extension, ExtensionMap};
use crate::config::DatabaseOptions;
use crate::engine::WriteTxn;
use crate::error::{CoreError, CoreResult};
use crate::serialization::Serialization;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Registers `extension` under `name`.
///
/// Returns the new extension map, or `None` when an extension of the same
/// class is already registered under `name`.
pub(crate) fn register(
    txn: &mut WriteTxn,
    serialization: &Serialization,
    options: &DatabaseOptions,
    current: &ExtensionMap,
    name: &str,
    extension: Arc<dyn Extension>,
) -> CoreResult<Option<ExtensionMap>> {
    if name.is_empty() {
        return Err(CoreError::extension_registration(name, "name must not be empty"));
    }
    if let Some(existing) = current.get(name) {
        if existing.class_name() == extension.class_name() {
            return Ok(None);
        }
        return Err(CoreError::extension_registration(
            name,
            format!("already registered as {}", existing.class_name()),
        ));
    }
    if let Some(missing) = extension
        .dependencies()
        .into_iter()
        .find(|dep| !current.contains(dep))
    {
        return Err(CoreError::extension_registration(
            name,
            format!("missing dependency {missing}"),
        ));
    }
    if !extension.supports_database(options) {
        return Err(CoreError::extension_registration(
            name,
            "not supported by this database configuration",
        ));
    }

    let version_tag = extension.version_tag();
    if let Some(previous) = PersistedRegistration::load(&*txn, name)? {
        if previous.class_name != extension.class_name() || previous.version_tag != version_tag {
            tracing::debug!(
                extension = name,
                old_class = %previous.class_name,
                old_version = %previous.version_tag,
                "configuration changed; rebuilding extension tables"
            );
            for suffix in &previous.tables {
                txn.drop_table(&table_name(name, suffix));
            }
            settings::remove_all(txn, name);
        }
    }

    {
        let mut tables = WriteTables::new(txn, name, serialization);
        extension.create_if_needed(&mut tables)?;
    }
    PersistedRegistration {
        class_name: extension.class_name().to_string(),
        version_tag,
        tables: extension.table_suffixes(),
    }
    .store(txn, name)?;

    tracing::debug!(extension = name, class = extension.class_name(), "extension registered");
    Ok(Some(current.with(name, extension)))
}

/// Unregisters `name` and every extension depending on it, dropping their
/// tables and persisted settings.
///
/// A name that is persisted from an earlier process but not registered now
/// can be unregistered too; only its persisted tables are dropped.
pub(crate) fn unregister(
    txn: &mut WriteTxn,
    serialization: &Serialization,
    current: &ExtensionMap,
    name: &str,
) -> CoreResult<(ExtensionMap, BTreeSet<String>)> {
    let doomed = if current.contains(name) {
        current.dependents_closure(name)
    } else if PersistedRegistration::load(&*txn, name)?.is_some() {
        BTreeSet::from([name.to_string()])
    } else {
        return Err(CoreError::ExtensionNotFound {
            name: name.to_string(),
        });
    };

    // Dependents go first.
    let mut order: Vec<String> = current
        .names()
        .into_iter()
        .filter(|n| doomed.contains(n))
        .collect();
    order.reverse();
    if !current.contains(name) {
        order.push(name.to_string());
    }

    for doomed_name in &order {
        if let Some(extension) = current.get(doomed_name) {
            let mut tables = WriteTables::new(txn, doomed_name, serialization);
            extension.drop_tables(&mut tables)?;
        }
        if let Some(previous) = PersistedRegistration::load(&*txn, doomed_name)? {
            for suffix in &previous.tables {
                txn.drop_table(&table_name(doomed_name, suffix));
            }
        }
        settings::remove_all(txn, doomed_name);
        tracing::debug!(extension = %doomed_name, "extension unregistered");
    }

    Ok((current.without(&doomed), doomed))
}
