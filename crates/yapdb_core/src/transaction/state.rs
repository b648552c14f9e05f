//! Abort bookkeeping and the enumeration guard.

use crate::error::CoreError;

/// Why a read-write transaction can no longer commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AbortReason {
    /// A collection was mutated while the transaction enumerated it.
    MutatedDuringEnumeration(Option<String>),
    /// A write failed part way.
    WriteFailed(String),
}

impl AbortReason {
    pub(crate) fn to_error(&self) -> CoreError {
        match self {
            Self::MutatedDuringEnumeration(collection) => CoreError::MutationDuringEnumeration {
                collection: collection.clone(),
            },
            Self::WriteFailed(message) => CoreError::invalid_operation(format!(
                "transaction aborted after a failed write: {message}"
            )),
        }
    }
}

/// Active enumerations of one transaction.
///
/// Each entry is the enumerated collection, or `None` for an enumeration
/// spanning every collection. Enumerations nest.
#[derive(Debug, Default)]
pub(crate) struct EnumerationGuard {
    active: Vec<Option<String>>,
}

impl EnumerationGuard {
    pub(crate) fn enter(&mut self, collection: Option<&str>) {
        self.active.push(collection.map(str::to_string));
    }

    pub(crate) fn exit(&mut self) {
        self.active.pop();
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// The enumeration a mutation of `collection` would disturb, if any.
    /// `None` as the argument means every collection.
    pub(crate) fn conflict(&self, collection: Option<&str>) -> Option<Option<String>> {
        self.active
            .iter()
            .rev()
            .find(|scope| match (scope.as_deref(), collection) {
                (None, _) | (_, None) => true,
                (Some(enumerated), Some(mutated)) => enumerated == mutated,
            })
            .cloned()
    }
}
