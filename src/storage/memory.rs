//! Implementation of in-memory cache storage.
//!
//! Entries are held in a [`moka`] cache bounded by a maximum number of
//! entries. Each entry is given the time remaining until its expiration as
//! its time to live in the cache.
//!
//! Presence is always decided against the storage's clock. Entries found
//! expired by that clock are dropped when they are next looked up, and the
//! whole cache is swept for them during writes.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use anyhow::Result;
use anyhow::anyhow;
use moka::Expiry;
use moka::sync::Cache;
use moka::sync::CacheBuilder;
use tracing::debug;

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::storage::CacheEntry;
use crate::storage::CacheStorage;
use crate::storage::CachedValue;
use crate::storage::new_generation;

/// The default maximum number of entries held.
pub const DEFAULT_MAX_CAPACITY: u64 = 10_000;

/// The minimum time between two sweeps of expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Represents an entry held in memory.
#[derive(Debug)]
struct MemoryEntry {
    /// The value of the entry.
    value: CachedValue,
    /// The instant at which the entry stops being present.
    expires_at: SystemTime,
    /// The generation of the entry, used when it acts as a base key.
    generation: u64,
    /// The base key and base generation of the entry's group.
    group: Option<(String, u64)>,
}

/// The cache of keys to entries.
type Entries = Cache<String, Arc<MemoryEntry>>;

/// Gives each entry the time remaining until its expiration.
struct EntryExpiry {
    /// The clock of the storage.
    clock: Arc<dyn Clock>,
}

impl EntryExpiry {
    /// Gets the time remaining until an entry expires.
    fn remaining(&self, entry: &MemoryEntry) -> Duration {
        entry
            .expires_at
            .duration_since(self.clock.now())
            .unwrap_or_default()
    }
}

impl Expiry<String, Arc<MemoryEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<MemoryEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.remaining(value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<MemoryEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.remaining(value))
    }
}

/// Gets an entry if it is present at the given instant.
///
/// An entry in a group is present only while its base key is present with
/// the generation recorded for the entry.
fn live(entries: &Entries, key: &str, now: SystemTime) -> Option<Arc<MemoryEntry>> {
    let entry = entries.get(key)?;
    if entry.expires_at <= now {
        return None;
    }

    if let Some((base_key, generation)) = &entry.group {
        let base = entries.get(base_key.as_str())?;
        if base.expires_at <= now || base.generation != *generation {
            return None;
        }
    }

    Some(entry)
}

/// Inserts an entry, returning the entry it replaced.
fn insert(
    entries: &Entries,
    key: &str,
    value: CachedValue,
    expires_at: SystemTime,
    base_key: Option<&str>,
    now: SystemTime,
) -> Result<Option<Arc<MemoryEntry>>> {
    let group = match base_key {
        Some(base_key) if base_key != key => {
            let base = live(entries, base_key, now)
                .ok_or_else(|| anyhow!("base key `{base_key}` is not present in the cache"))?;
            Some((base_key.to_string(), base.generation))
        }
        _ => None,
    };

    // A present entry keeps its generation so the rest of its group survives
    let generation = live(entries, key, now)
        .map(|e| e.generation)
        .unwrap_or_else(new_generation);

    let previous = entries.get(key);
    entries.insert(
        key.to_string(),
        Arc::new(MemoryEntry {
            value,
            expires_at,
            generation,
            group,
        }),
    );
    Ok(previous)
}

/// Builds the entry cache.
fn build(max_capacity: u64, clock: Arc<dyn Clock>) -> Entries {
    CacheBuilder::new(max_capacity)
        .expire_after(EntryExpiry { clock })
        .build()
}

/// Cache storage that keeps entries in process memory.
///
/// Holds at most [`DEFAULT_MAX_CAPACITY`] entries unless configured with
/// [`MemoryCacheStorage::with_max_capacity`]. Entries evicted for capacity
/// are simply absent; evicting a base key makes its whole group absent.
pub struct MemoryCacheStorage {
    /// The stored entries.
    entries: Entries,
    /// Serializes writers and holds the instant of the last sweep.
    writer: Mutex<SystemTime>,
    /// The clock used to expire entries.
    clock: Arc<dyn Clock>,
}

impl MemoryCacheStorage {
    /// Constructs a new, empty memory storage using the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Constructs a new, empty memory storage using the given clock.
    pub fn with_clock(clock: impl Clock) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        Self {
            entries: build(DEFAULT_MAX_CAPACITY, clock.clone()),
            writer: Mutex::new(clock.now()),
            clock,
        }
    }

    /// Sets the maximum number of entries held.
    ///
    /// Any entries already held are discarded.
    pub fn with_max_capacity(mut self, max_capacity: u64) -> Self {
        self.entries = build(max_capacity, self.clock.clone());
        self
    }

    /// Gets the number of entries held, including any not yet dropped after
    /// expiring.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    /// Determines if the storage holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks out other writers.
    fn lock(&self) -> Result<MutexGuard<'_, SystemTime>> {
        self.writer
            .lock()
            .map_err(|_| anyhow!("memory cache storage lock is poisoned"))
    }

    /// Drops every entry that is no longer present, at most once per sweep
    /// interval.
    ///
    /// Must be called with the writer lock held.
    fn sweep(&self, last_sweep: &mut SystemTime, now: SystemTime) {
        if now
            .duration_since(*last_sweep)
            .is_ok_and(|elapsed| elapsed < SWEEP_INTERVAL)
        {
            return;
        }

        *last_sweep = now;
        let dead: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, _)| live(&self.entries, key, now).is_none())
            .map(|(key, _)| key)
            .collect();

        for key in &dead {
            self.entries.invalidate(key.as_str());
        }

        if !dead.is_empty() {
            debug!(count = dead.len(), "swept expired cache entries");
        }
    }

    /// Gets the value of a present entry, dropping the entry if it is no
    /// longer present.
    fn lookup(&self, key: &str) -> Result<Option<CachedValue>> {
        let now = self.clock.now();
        if let Some(entry) = live(&self.entries, key, now) {
            return Ok(Some(entry.value.clone()));
        }

        if self.entries.contains_key(key) {
            let _writer = self.lock()?;
            if live(&self.entries, key, now).is_none() {
                self.entries.invalidate(key);
                debug!(key, "dropped expired cache entry");
            }
        }

        Ok(None)
    }
}

impl Default for MemoryCacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryCacheStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCacheStorage")
            .field("entries", &self.entries.entry_count())
            .finish_non_exhaustive()
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        self.lookup(key)
    }

    fn add(
        &self,
        key: &str,
        value: CachedValue,
        expires_at: SystemTime,
        base_key: Option<&str>,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut last_sweep = self.lock()?;
        self.sweep(&mut last_sweep, now);
        insert(&self.entries, key, value, expires_at, base_key, now)?;
        Ok(())
    }

    /// Adds the entries while holding out other writers.
    ///
    /// If any entry cannot be added, every entry already added by this call
    /// is rolled back.
    fn add_group(&self, group: Vec<CacheEntry>) -> Result<()> {
        let now = self.clock.now();
        let mut last_sweep = self.lock()?;
        self.sweep(&mut last_sweep, now);
        let mut undo = Vec::with_capacity(group.len());

        for entry in group {
            match insert(
                &self.entries,
                &entry.key,
                entry.value,
                entry.expires_at,
                entry.base_key.as_deref(),
                now,
            ) {
                Ok(previous) => undo.push((entry.key, previous)),
                Err(e) => {
                    for (key, previous) in undo.into_iter().rev() {
                        match previous {
                            Some(previous) => self.entries.insert(key, previous),
                            None => self.entries.invalidate(&key),
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _writer = self.lock()?;
        self.entries.invalidate(key);
        Ok(())
    }

    fn remove_group(&self, base_key: &str) -> Result<()> {
        let _writer = self.lock()?;
        self.entries.invalidate(base_key);

        let members: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .group
                    .as_ref()
                    .is_some_and(|(group, _)| group == base_key)
            })
            .map(|(key, _)| key)
            .collect();

        for key in &members {
            self.entries.invalidate(key.as_str());
        }

        Ok(())
    }
}
