//! Pool of idle engine handles.
//!
//! Connections check a handle out when they are created and check it back in
//! when they are dropped. The pool keeps at most `max_idle` handles and closes
//! any that sat idle longer than `lifetime`.

use super::handle::EngineHandle;
use super::StorageEngine;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles opened because the pool was empty.
    pub opened: u64,
    /// Checkouts served from the pool.
    pub reused: u64,
    /// Handles closed on checkin or expiry.
    pub closed: u64,
    /// Handles currently idle.
    pub idle: usize,
}

struct Idle {
    handle: EngineHandle,
    since: Instant,
}

/// Bounded pool with idle-timeout eviction.
pub struct HandlePool {
    engine: Arc<StorageEngine>,
    max_idle: usize,
    lifetime: Duration,
    idle: Mutex<VecDeque<Idle>>,
    stats: Mutex<PoolStats>,
}

impl HandlePool {
    /// Creates a pool for `engine`. A zero `lifetime` keeps idle handles
    /// forever.
    pub fn new(engine: Arc<StorageEngine>, max_idle: usize, lifetime: Duration) -> Self {
        Self {
            engine,
            max_idle,
            lifetime,
            idle: Mutex::new(VecDeque::new()),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Takes an idle handle, or opens a new one.
    pub fn checkout(&self) -> EngineHandle {
        let reused = {
            let mut idle = self.idle.lock();
            self.evict_expired(&mut idle);
            idle.pop_back()
        };
        let mut stats = self.stats.lock();
        match reused {
            Some(entry) => {
                stats.reused += 1;
                entry.handle
            }
            None => {
                stats.opened += 1;
                self.engine.open_handle()
            }
        }
    }

    /// Returns a handle. It is closed if the pool is full.
    pub fn checkin(&self, handle: EngineHandle) {
        let mut idle = self.idle.lock();
        self.evict_expired(&mut idle);
        if idle.len() < self.max_idle {
            idle.push_back(Idle {
                handle,
                since: Instant::now(),
            });
        } else {
            self.stats.lock().closed += 1;
            tracing::trace!(handle = handle.id(), "pool full, closing handle");
        }
    }

    /// Closes every idle handle.
    pub fn clear(&self) {
        let closed = {
            let mut idle = self.idle.lock();
            let n = idle.len();
            idle.clear();
            n
        };
        self.stats.lock().closed += closed as u64;
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().len();
        PoolStats {
            idle,
            ..*self.stats.lock()
        }
    }

    fn evict_expired(&self, idle: &mut VecDeque<Idle>) {
        if self.lifetime.is_zero() {
            return;
        }
        let before = idle.len();
        idle.retain(|entry| entry.since.elapsed() < self.lifetime);
        let evicted = before - idle.len();
        if evicted > 0 {
            self.stats.lock().closed += evicted as u64;
        }
    }
}
