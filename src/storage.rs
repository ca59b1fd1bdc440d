//! Implementation of cache storage.
//!
//! Storage comes in two flavors with the same contract: [`CacheStorage`]
//! blocks the caller and [`AsyncCacheStorage`] may suspend it. The output
//! cache is written against [`AsyncCacheStorage`]; wrap a blocking storage in
//! [`BlockingStorage`] to use it there.
//!
//! Entries may belong to a group identified by a base key. Every entry
//! records the generation of its base key when written, and is only
//! considered present while that base key is present with the same
//! generation. Removing a base key therefore removes its whole group, and
//! re-adding it later does not bring old entries back.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Result;
use bytes::Bytes;
use http::HeaderValue;
use serde::Deserialize;
use serde::Serialize;

mod file;
mod memory;

pub use file::*;
pub use memory::*;

/// Represents a value held by cache storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachedValue {
    /// A marker with no payload, used for base keys.
    Empty,
    /// A response body.
    Bytes(Bytes),
    /// A response content type.
    ContentType(String),
    /// A text value, such as an entity tag.
    Text(String),
}

/// A trait for types that can be read out of a [`CachedValue`].
///
/// Reading a value of the wrong kind yields `None` rather than an error.
pub trait FromCachedValue: Sized {
    /// Converts the cached value, if it holds the expected kind.
    fn from_cached_value(value: CachedValue) -> Option<Self>;
}

impl FromCachedValue for () {
    fn from_cached_value(value: CachedValue) -> Option<Self> {
        match value {
            CachedValue::Empty => Some(()),
            _ => None,
        }
    }
}

impl FromCachedValue for Bytes {
    fn from_cached_value(value: CachedValue) -> Option<Self> {
        match value {
            CachedValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl FromCachedValue for String {
    fn from_cached_value(value: CachedValue) -> Option<Self> {
        match value {
            CachedValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl FromCachedValue for HeaderValue {
    fn from_cached_value(value: CachedValue) -> Option<Self> {
        match value {
            CachedValue::ContentType(content_type) => HeaderValue::from_str(&content_type).ok(),
            _ => None,
        }
    }
}

/// Represents an entry to add to cache storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The key of the entry.
    pub key: String,
    /// The value of the entry.
    pub value: CachedValue,
    /// The instant at which the entry stops being present.
    pub expires_at: SystemTime,
    /// The base key of the group the entry belongs to.
    pub base_key: Option<String>,
}

impl CacheEntry {
    /// Constructs a new cache entry.
    pub fn new(
        key: impl Into<String>,
        value: CachedValue,
        expires_at: SystemTime,
        base_key: Option<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            expires_at,
            base_key,
        }
    }
}

/// A trait implemented on blocking cache storage.
pub trait CacheStorage: Send + Sync + 'static {
    /// Determines if a present entry exists for the given key.
    fn contains(&self, key: &str) -> Result<bool>;

    /// Gets the value of the entry for the given key.
    ///
    /// Returns `Ok(None)` if the entry is absent or expired.
    fn get(&self, key: &str) -> Result<Option<CachedValue>>;

    /// Adds an entry, replacing any existing entry for the key.
    ///
    /// If `base_key` is given, the entry joins that base key's group; the
    /// base key must be present.
    fn add(
        &self,
        key: &str,
        value: CachedValue,
        expires_at: SystemTime,
        base_key: Option<&str>,
    ) -> Result<()>;

    /// Adds several entries in order.
    ///
    /// Storage able to write the entries atomically should override this.
    fn add_group(&self, entries: Vec<CacheEntry>) -> Result<()> {
        for entry in entries {
            self.add(
                &entry.key,
                entry.value,
                entry.expires_at,
                entry.base_key.as_deref(),
            )?;
        }

        Ok(())
    }

    /// Removes the entry for the given key.
    ///
    /// Does not return an error for unrecognized keys.
    fn remove(&self, key: &str) -> Result<()>;

    /// Removes a base key and every entry of its group.
    fn remove_group(&self, base_key: &str) -> Result<()>;
}

/// A trait implemented on cache storage that may suspend the caller.
pub trait AsyncCacheStorage: Send + Sync + 'static {
    /// Determines if a present entry exists for the given key.
    fn contains(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Gets the value of the entry for the given key.
    ///
    /// Returns `Ok(None)` if the entry is absent or expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<CachedValue>>> + Send;

    /// Adds an entry, replacing any existing entry for the key.
    ///
    /// If `base_key` is given, the entry joins that base key's group; the
    /// base key must be present.
    fn add(
        &self,
        key: &str,
        value: CachedValue,
        expires_at: SystemTime,
        base_key: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Adds several entries in order.
    fn add_group(&self, entries: Vec<CacheEntry>) -> impl Future<Output = Result<()>> + Send {
        async move {
            for entry in entries {
                self.add(
                    &entry.key,
                    entry.value,
                    entry.expires_at,
                    entry.base_key.as_deref(),
                )
                .await?;
            }

            Ok(())
        }
    }

    /// Removes the entry for the given key.
    fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Removes a base key and every entry of its group.
    fn remove_group(&self, base_key: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Adapts a blocking [`CacheStorage`] to [`AsyncCacheStorage`].
///
/// The returned futures complete on their first poll, so the wrapped storage
/// should be quick to answer (such as [`MemoryCacheStorage`]).
#[derive(Debug, Default, Clone)]
pub struct BlockingStorage<S>(S);

impl<S> BlockingStorage<S> {
    /// Wraps the given blocking storage.
    pub fn new(storage: S) -> Self {
        Self(storage)
    }

    /// Gets the wrapped storage.
    pub fn inner(&self) -> &S {
        &self.0
    }

    /// Unwraps the storage.
    pub fn into_inner(self) -> S {
        self.0
    }
}

impl<S: CacheStorage> AsyncCacheStorage for BlockingStorage<S> {
    async fn contains(&self, key: &str) -> Result<bool> {
        self.0.contains(key)
    }

    async fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        self.0.get(key)
    }

    async fn add(
        &self,
        key: &str,
        value: CachedValue,
        expires_at: SystemTime,
        base_key: Option<&str>,
    ) -> Result<()> {
        self.0.add(key, value, expires_at, base_key)
    }

    async fn add_group(&self, entries: Vec<CacheEntry>) -> Result<()> {
        self.0.add_group(entries)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.0.remove(key)
    }

    async fn remove_group(&self, base_key: &str) -> Result<()> {
        self.0.remove_group(base_key)
    }
}

/// Creates a new group generation.
///
/// Generations only need to differ between successive incarnations of the
/// same base key, including across process restarts for persistent storage.
pub(crate) fn new_generation() -> u64 {
    /// Distinguishes generations created within the same clock tick.
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = blake3::Hasher::new();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());

    let mut bytes = [0; 8];
    bytes.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mismatched_kinds_are_absent() {
        let body = CachedValue::Bytes(Bytes::from_static(b"hello"));
        assert_eq!(
            Bytes::from_cached_value(body.clone()),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(String::from_cached_value(body.clone()), None);
        assert_eq!(HeaderValue::from_cached_value(body.clone()), None);
        assert_eq!(<()>::from_cached_value(body), None);

        let content_type = CachedValue::ContentType("text/plain".to_string());
        assert_eq!(
            HeaderValue::from_cached_value(content_type.clone()),
            Some(HeaderValue::from_static("text/plain"))
        );
        assert_eq!(String::from_cached_value(content_type), None);
        assert_eq!(<()>::from_cached_value(CachedValue::Empty), Some(()));
    }

    #[test]
    fn generations_differ() {
        assert_ne!(new_generation(), new_generation());
    }
}
