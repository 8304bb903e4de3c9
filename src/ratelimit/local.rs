//! Process-local window store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::key::{normalize_identifier, WindowKey};
use super::store::{CounterEntry, StoreError, WindowStore};

/// Default cap on the number of live counters kept in memory.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// An in-process store of fixed-window counters.
///
/// Counters live in a sharded map; an increment holds the shard lock only
/// for the read-modify-write of a single entry. Expired entries are left in
/// place until [`LocalWindowStore::sweep`] removes them.
///
/// `max_entries` is a hard bound: a slot is reserved before a new key is
/// inserted, so concurrent first-time keys cannot overshoot it.
pub struct LocalWindowStore {
    /// Counters indexed by window key
    entries: DashMap<WindowKey, CounterEntry>,
    /// Reserved slots, never less than `entries.len()`
    reserved: AtomicUsize,
    /// Upper bound on `entries.len()`
    max_entries: usize,
}

impl LocalWindowStore {
    /// Create a store with the default capacity.
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    /// Create a store that holds at most `max_entries` counters.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_entries: max_entries.max(1),
        }
    }

    /// Increment `key` as of `now`.
    pub fn increment_at(
        &self,
        key: &WindowKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<CounterEntry, StoreError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            return Ok(bump(key, &mut entry, window, now));
        }

        if !self.reserve_slot() {
            let removed = self.sweep_at(now);
            debug!(removed = removed, "Local store at capacity, reclaimed expired counters");
            if !self.reserve_slot() {
                return Err(StoreError::Capacity(self.max_entries));
            }
        }

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                // Another caller inserted the key first
                self.release_slots(1);
                Ok(bump(key, occupied.get_mut(), window, now))
            }
            Entry::Vacant(vacant) => {
                // A fresh entry is born expired so that `bump` opens its window.
                let mut entry = vacant.insert(CounterEntry { count: 0, reset_at: now });
                Ok(bump(key, &mut entry, window, now))
            }
        }
    }

    fn reserve_slot(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                (reserved < self.max_entries).then_some(reserved + 1)
            })
            .is_ok()
    }

    fn release_slots(&self, count: usize) {
        if count > 0 {
            self.reserved.fetch_sub(count, Ordering::AcqRel);
        }
    }

    /// Remove every counter whose window ended at or before `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        self.release_slots(removed);
        removed
    }

    /// Remove every expired counter.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Remove every counter belonging to `identifier`, whatever its class
    /// or tier.
    pub fn purge_identifier(&self, identifier: &str) -> usize {
        let identifier = normalize_identifier(identifier);
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let keep = key.identifier != identifier;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.release_slots(removed);
        removed
    }

    /// Get the current entry for a key, expired or not.
    pub fn get(&self, key: &WindowKey) -> Option<CounterEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Get the number of stored counters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LocalWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Open a new window or count against the live one.
fn bump(
    key: &WindowKey,
    entry: &mut CounterEntry,
    window: Duration,
    now: DateTime<Utc>,
) -> CounterEntry {
    if entry.is_expired(now) {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let reset_at = now
            .checked_add_signed(chrono::Duration::milliseconds(window_ms))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        trace!(key = %key, reset_at = %reset_at, "Opening new local window");
        *entry = CounterEntry { count: 1, reset_at };
    } else {
        entry.count += 1;
    }
    *entry
}

#[async_trait]
impl WindowStore for LocalWindowStore {
    async fn increment(&self, key: &WindowKey, window: Duration) -> Result<CounterEntry, StoreError> {
        self.increment_at(key, window, Utc::now())
    }

    async fn purge(&self, identifier: &str) -> Result<usize, StoreError> {
        Ok(self.purge_identifier(identifier))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
