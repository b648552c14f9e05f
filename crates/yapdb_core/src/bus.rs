//! Snapshot bookkeeping and changeset fan-out.
//!
//! The bus holds the published snapshot, the changeset of the commit in
//! flight, and one record per live connection. A commit is announced twice:
//! [`SnapshotBus::note_pending`] before the engine commit and
//! [`SnapshotBus::note_committed`] after it. A connection that begins a
//! transaction between the two sees the engine's new snapshot and takes the
//! pending changeset along with its inbox.
//!
//! Violations of the bookkeeping invariants panic. They mean snapshots were
//! assigned out of order and no connection's cache can be trusted.

use crate::changeset::Changeset;
use crate::extension::ExtensionMap;
use crate::types::{ConnectionId, Snapshot};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// What a connection must do before its next transaction.
pub(crate) enum CatchUp {
    /// Nothing was committed since the connection's last transaction.
    Current,
    /// Fold in these changesets, oldest first.
    Replay(Vec<Arc<Changeset>>),
    /// Too far behind: drop every cache and adopt this extension map.
    Invalidate(Arc<ExtensionMap>),
}

struct ConnectionRecord {
    snapshot: Snapshot,
    inbox: VecDeque<Arc<Changeset>>,
    overflowed: bool,
}

/// Shared bookkeeping, guarded by the database's bus lock.
pub(crate) struct SnapshotBus {
    snapshot: Snapshot,
    pending: Option<Arc<Changeset>>,
    extensions: Arc<ExtensionMap>,
    connections: HashMap<ConnectionId, ConnectionRecord>,
    max_replay: usize,
    multiprocess: bool,
}

impl SnapshotBus {
    pub(crate) fn new(snapshot: Snapshot, max_replay: usize, multiprocess: bool) -> Self {
        Self {
            snapshot,
            pending: None,
            extensions: Arc::new(ExtensionMap::new()),
            connections: HashMap::new(),
            max_replay,
            multiprocess,
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    pub(crate) fn extensions(&self) -> Arc<ExtensionMap> {
        Arc::clone(&self.extensions)
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Oldest snapshot any live connection has processed.
    pub(crate) fn min_connection_snapshot(&self) -> Snapshot {
        self.connections
            .values()
            .map(|record| record.snapshot)
            .min()
            .unwrap_or(self.snapshot)
            .min(self.snapshot)
    }

    /// Adds a connection at the published snapshot.
    pub(crate) fn add_connection(&mut self, id: ConnectionId) -> (Snapshot, Arc<ExtensionMap>) {
        self.connections.insert(
            id,
            ConnectionRecord {
                snapshot: self.snapshot,
                inbox: VecDeque::new(),
                overflowed: false,
            },
        );
        (self.snapshot, self.extensions())
    }

    pub(crate) fn remove_connection(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Announces the changeset of the commit about to happen.
    pub(crate) fn note_pending(&mut self, changeset: Arc<Changeset>) {
        assert!(
            self.pending.is_none(),
            "a second commit became pending at {}",
            changeset.snapshot
        );
        assert_eq!(
            changeset.snapshot,
            self.snapshot.next(),
            "pending changeset does not follow the published snapshot"
        );
        self.pending = Some(changeset);
    }

    /// Withdraws the pending changeset after a failed engine commit.
    pub(crate) fn abandon_pending(&mut self) {
        self.pending = None;
    }

    /// Publishes the pending changeset and queues it for every connection
    /// still behind it. Returns the number of inboxes it was delivered to.
    pub(crate) fn note_committed(&mut self, origin: ConnectionId) -> usize {
        let Some(changeset) = self.pending.take() else {
            panic!("commit published without a pending changeset");
        };
        assert_eq!(
            changeset.snapshot,
            self.snapshot.next(),
            "committed changeset does not follow the published snapshot"
        );
        self.snapshot = changeset.snapshot;
        if let Some(map) = &changeset.registered_extensions {
            self.extensions = Arc::clone(map);
        }

        let mut delivered = 0;
        for (id, record) in &mut self.connections {
            if *id == origin {
                record.snapshot = changeset.snapshot;
                continue;
            }
            // A connection that began between pending and committed has
            // already taken this changeset.
            if record.snapshot >= changeset.snapshot || self.multiprocess || record.overflowed {
                continue;
            }
            if record.inbox.len() >= self.max_replay {
                record.inbox.clear();
                record.overflowed = true;
                continue;
            }
            record.inbox.push_back(Arc::clone(&changeset));
            delivered += 1;
        }
        delivered
    }

    /// Brings the record of `id` up to the engine snapshot `engine` observed
    /// by the transaction being begun.
    ///
    /// Must be called with the bus lock held across the engine's begin, so
    /// no commit can be published in between.
    pub(crate) fn catch_up(&mut self, id: ConnectionId, engine: Snapshot) -> CatchUp {
        let pending = match &self.pending {
            Some(pending) if pending.snapshot == engine => Some(Arc::clone(pending)),
            _ => None,
        };
        assert!(
            engine == self.snapshot || pending.is_some(),
            "engine at {engine} but the bus published {}",
            self.snapshot
        );
        let published = Arc::clone(&self.extensions);
        let Some(record) = self.connections.get_mut(&id) else {
            panic!("catch-up for unknown connection {id}");
        };
        assert!(
            record.snapshot <= engine,
            "{id} is at {} ahead of the engine at {engine}",
            record.snapshot
        );

        if record.snapshot == engine {
            debug_assert!(record.inbox.is_empty());
            return CatchUp::Current;
        }

        let behind = engine.as_u64() - record.snapshot.as_u64();
        let from = record.snapshot;
        record.snapshot = engine;

        if self.multiprocess || record.overflowed || behind > self.max_replay as u64 {
            record.inbox.clear();
            record.overflowed = false;
            let map = pending
                .and_then(|p| p.registered_extensions.clone())
                .unwrap_or(published);
            return CatchUp::Invalidate(map);
        }

        let mut changesets: Vec<Arc<Changeset>> = record.inbox.drain(..).collect();
        changesets.extend(pending);
        let mut expected = from;
        for changeset in &changesets {
            expected = expected.next();
            assert_eq!(
                changeset.snapshot, expected,
                "missing changeset while catching up {id}"
            );
        }
        assert_eq!(expected, engine, "catch-up for {id} stopped short");
        CatchUp::Replay(changesets)
    }
}
