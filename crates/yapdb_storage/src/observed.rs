//! Disk-activity interception.
//!
//! [`ObservedBackend`] forwards every call to an inner backend and reports
//! what happened to a [`DiskActivityObserver`]. It changes no behavior and is
//! meant for instrumentation, e.g. counting syncs per commit.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use std::sync::Arc;

/// One completed backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskActivity {
    /// Bytes were read.
    Read {
        /// Offset of the read.
        offset: u64,
        /// Number of bytes read.
        len: usize,
    },
    /// Bytes were appended.
    Append {
        /// Offset the bytes were written at.
        offset: u64,
        /// Number of bytes written.
        len: usize,
    },
    /// Buffered writes were flushed.
    Flush,
    /// Data was synced to stable storage.
    Sync,
    /// Content was truncated.
    Truncate {
        /// New size.
        size: u64,
    },
    /// Content was replaced wholesale.
    Replace {
        /// New size.
        len: usize,
    },
}

/// Receives notifications of disk activity.
///
/// `label` identifies the wrapped file (the engine uses `"wal"` and
/// `"store"`). Calls happen on the thread performing the I/O.
pub trait DiskActivityObserver: Send + Sync {
    /// Called after each successful backend operation.
    fn on_activity(&self, label: &str, activity: DiskActivity);
}

impl<F> DiskActivityObserver for F
where
    F: Fn(&str, DiskActivity) + Send + Sync,
{
    fn on_activity(&self, label: &str, activity: DiskActivity) {
        self(label, activity);
    }
}

/// A backend wrapper reporting each operation to an observer.
pub struct ObservedBackend<B> {
    inner: B,
    label: String,
    observer: Arc<dyn DiskActivityObserver>,
}

impl<B: StorageBackend> ObservedBackend<B> {
    /// Wraps `inner`, reporting under `label`.
    pub fn new(
        inner: B,
        label: impl Into<String>,
        observer: Arc<dyn DiskActivityObserver>,
    ) -> Self {
        Self {
            inner,
            label: label.into(),
            observer,
        }
    }

    /// Returns the wrapped backend.
    pub fn into_inner(self) -> B {
        self.inner
    }

    fn report(&self, activity: DiskActivity) {
        self.observer.on_activity(&self.label, activity);
    }
}

impl<B> std::fmt::Debug for ObservedBackend<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedBackend")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend> StorageBackend for ObservedBackend<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.inner.read_at(offset, len)?;
        self.report(DiskActivity::Read { offset, len });
        Ok(data)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.inner.append(data)?;
        self.report(DiskActivity::Append {
            offset,
            len: data.len(),
        });
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()?;
        self.report(DiskActivity::Flush);
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()?;
        self.report(DiskActivity::Sync);
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)?;
        self.report(DiskActivity::Truncate { size: new_size });
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        self.inner.replace(data)?;
        self.report(DiskActivity::Replace { len: data.len() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBackend;
    use parking_lot::Mutex;

    #[test]
    fn reports_each_operation() {
        let seen: Arc<Mutex<Vec<(String, DiskActivity)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let observer: Arc<dyn DiskActivityObserver> =
            Arc::new(move |label: &str, activity: DiskActivity| {
                sink.lock().push((label.to_string(), activity));
            });

        let mut backend = ObservedBackend::new(InMemoryBackend::new(), "wal", observer);
        backend.append(b"abcd").unwrap();
        backend.read_at(1, 2).unwrap();
        backend.sync().unwrap();
        backend.truncate(0).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|(label, _)| label == "wal"));
        assert_eq!(seen[0].1, DiskActivity::Append { offset: 0, len: 4 });
        assert_eq!(seen[1].1, DiskActivity::Read { offset: 1, len: 2 });
        assert_eq!(seen[2].1, DiskActivity::Sync);
        assert_eq!(seen[3].1, DiskActivity::Truncate { size: 0 });
    }

    #[test]
    fn failed_operations_are_not_reported() {
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        let observer: Arc<dyn DiskActivityObserver> =
            Arc::new(move |_: &str, _: DiskActivity| *sink.lock() += 1);

        let backend = ObservedBackend::new(InMemoryBackend::new(), "store", observer);
        assert!(backend.read_at(0, 1).is_err());
        assert_eq!(*count.lock(), 0);
    }
}
