//! Concurrent session registry
//!
//! [`SessionTable`] maps a [`SessionKey`] to at most one live value. Creation
//! is atomic: when several packets for an unseen key race, exactly one
//! constructor runs and every caller gets the same instance back.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use super::key::SessionKey;

/// Counters for a session table
#[derive(Debug, Default)]
pub struct SessionTableStats {
    /// Entries created through `get_or_create`
    pub created: AtomicU64,
    /// Entries removed
    pub removed: AtomicU64,
}

/// Snapshot of session table counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionTableStatsSnapshot {
    pub created: u64,
    pub removed: u64,
    pub active: u64,
}

/// Registry of live sessions keyed by endpoint pair
#[derive(Debug)]
pub struct SessionTable<V> {
    entries: DashMap<SessionKey, V>,
    stats: SessionTableStats,
}

impl<V: Clone> SessionTable<V> {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            stats: SessionTableStats::default(),
        }
    }

    /// Return the entry for `key`, creating it with `make` if absent.
    ///
    /// The boolean is `true` only for the caller whose constructor ran.
    /// `make` runs while the key's shard is locked, so it must be cheap and
    /// must not touch this table.
    pub fn get_or_create<F>(&self, key: SessionKey, make: F) -> (V, bool)
    where
        F: FnOnce() -> V,
    {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let value = make();
                entry.insert(value.clone());
                self.stats.created.fetch_add(1, Ordering::Relaxed);
                (value, true)
            }
        }
    }

    /// Get the entry for `key`
    #[must_use]
    pub fn get(&self, key: &SessionKey) -> Option<V> {
        self.entries.get(key).map(|r| r.value().clone())
    }

    /// Remove the entry for `key`. Removing a missing key is a no-op.
    pub fn remove(&self, key: &SessionKey) -> Option<V> {
        let removed = self.entries.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            self.stats.removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove the entry for `key` only if `predicate` accepts it.
    ///
    /// Returns whether an entry was removed.
    pub fn remove_if<P>(&self, key: &SessionKey, predicate: P) -> bool
    where
        P: FnOnce(&V) -> bool,
    {
        let removed = self.entries.remove_if(key, |_, v| predicate(v)).is_some();
        if removed {
            self.stats.removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Check whether `key` has an entry
    #[must_use]
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of all live entries
    #[must_use]
    pub fn keys(&self) -> Vec<SessionKey> {
        self.entries.iter().map(|r| *r.key()).collect()
    }

    /// Values of all live entries
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        self.entries.iter().map(|r| r.value().clone()).collect()
    }

    /// Get a snapshot of the counters
    #[must_use]
    pub fn stats_snapshot(&self) -> SessionTableStatsSnapshot {
        SessionTableStatsSnapshot {
            created: self.stats.created.load(Ordering::Relaxed),
            removed: self.stats.removed.load(Ordering::Relaxed),
            active: self.entries.len() as u64,
        }
    }
}

impl<V: Clone> Default for SessionTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
