//! Implementation of file-backed cache storage.
//!
//! ## Layout
//!
//! This storage implementation uses the following directory structure:
//!
//! ```text
//! <root>/
//! ├─ <storage-version>/
//! │  ├─ <digest>
//! │  ├─ <digest>
//! │  ├─ ...
//! ```
//!
//! Where `<root>` is the root storage directory and `<digest>` is the
//! hex-encoded SHA-256 digest of an entry's key.
//!
//! Each entry file contains a bincode-encoded entry holding the key, the
//! value, the expiration, and the entry's group membership.
//!
//! ## Atomicity
//!
//! Entries are written to a temporary file in the version directory and then
//! renamed over the entry file, so readers see either the previous entry or
//! the new one in full.
//!
//! Writers are not coordinated: when two writers race on the same key, the
//! last rename wins.
//!
//! ## Expiration
//!
//! Expired entries, and entries whose group's base key is gone, are treated
//! as not present. Their files are deleted by
//! [`FileCacheStorage::purge_expired`], which also runs whenever a group is
//! removed. A writer racing with a purge may lose the entry it just wrote;
//! later readers then see it as not present.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::runtime;
use crate::storage::AsyncCacheStorage;
use crate::storage::CacheStorage;
use crate::storage::CachedValue;
use crate::storage::new_generation;

/// Determines if a path names an entry file.
fn is_entry_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// The current directory layout version.
const STORAGE_VERSION: &str = "v1";

/// Represents the group membership of a stored entry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredGroup {
    /// The base key of the group.
    base_key: String,
    /// The generation of the base key when the entry was written.
    generation: u64,
}

/// Represents an entry as serialized to an entry file.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    /// The key of the entry.
    ///
    /// Used to detect digest collisions.
    key: String,
    /// The value of the entry.
    value: CachedValue,
    /// The instant at which the entry stops being present.
    expires_at: SystemTime,
    /// The generation of the entry, used when it acts as a base key.
    generation: u64,
    /// The group of the entry.
    group: Option<StoredGroup>,
}

/// Cache storage that keeps entries in files under a root directory.
///
/// The storage implements both [`CacheStorage`] and [`AsyncCacheStorage`];
/// the latter performs file operations on the async runtime's blocking
/// thread pool.
#[derive(Clone)]
pub struct FileCacheStorage {
    /// The root storage directory.
    root: PathBuf,
    /// The clock used to expire entries.
    clock: Arc<dyn Clock>,
}

impl FileCacheStorage {
    /// Constructs a new file storage with the given root directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root_dir.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the clock used to expire entries.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Gets the root storage directory.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Calculates the path to the version directory.
    fn version_dir(&self) -> PathBuf {
        self.root.join(STORAGE_VERSION)
    }

    /// Calculates the path to an entry file.
    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.version_dir().join(hex::encode(digest))
    }

    /// Reads the entry file for a key.
    ///
    /// Returns `Ok(None)` if the file does not exist, cannot be decoded or
    /// belongs to a different key.
    fn read(&self, key: &str) -> Result<Option<StoredEntry>> {
        let Some(entry) = Self::read_file(&self.entry_path(key))? else {
            return Ok(None);
        };

        if entry.key != key {
            debug!(
                key,
                stored = %entry.key,
                "entry file belongs to a different key: treating as not present"
            );
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Reads an entry file.
    ///
    /// Returns `Ok(None)` if the file does not exist or cannot be decoded.
    fn read_file(path: &Path) -> Result<Option<StoredEntry>> {
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to open entry file `{path}`", path = path.display())
                });
            }
        };

        let entry = match bincode::serde::decode_from_std_read::<StoredEntry, _, _>(
            &mut file,
            bincode::config::standard(),
        ) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(
                    "failed to deserialize entry file `{path}`: {e} (cache entry will be ignored)",
                    path = path.display()
                );
                return Ok(None);
            }
        };

        Ok(Some(entry))
    }

    /// Determines if an entry is present at the given instant.
    ///
    /// An entry in a group is present only while its base key is present with
    /// the generation recorded for the entry.
    fn is_present(&self, entry: &StoredEntry, now: SystemTime) -> Result<bool> {
        if entry.expires_at <= now {
            return Ok(false);
        }

        match &entry.group {
            Some(group) => Ok(matches!(
                self.read(&group.base_key)?,
                Some(base) if base.expires_at > now && base.generation == group.generation
            )),
            None => Ok(true),
        }
    }

    /// Reads an entry if it is present at the given instant.
    fn live(&self, key: &str, now: SystemTime) -> Result<Option<StoredEntry>> {
        match self.read(key)? {
            Some(entry) if self.is_present(&entry, now)? => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    /// Deletes the files of entries that are no longer present.
    ///
    /// Files that cannot be decoded are deleted as well. Returns the number of
    /// files deleted.
    pub fn purge_expired(&self) -> Result<usize> {
        let dir = self.version_dir();
        let now = self.clock.now();
        let files = match fs::read_dir(&dir) {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read directory `{dir}`", dir = dir.display())
                });
            }
        };

        let mut purged = 0;
        for file in files {
            let path = file
                .with_context(|| format!("failed to read directory `{dir}`", dir = dir.display()))?
                .path();

            // Skips temporary files of in-flight writes
            if !is_entry_file(&path) {
                continue;
            }

            let dead = match Self::read_file(&path)? {
                Some(entry) => {
                    self.entry_path(&entry.key) != path || !self.is_present(&entry, now)?
                }
                None => true,
            };

            if dead {
                match fs::remove_file(&path) {
                    Ok(()) => purged += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!(
                                "failed to remove entry file `{path}`",
                                path = path.display()
                            )
                        });
                    }
                }
            }
        }

        if purged > 0 {
            debug!(dir = %dir.display(), purged, "purged expired cache entries");
        }

        Ok(purged)
    }

    /// Writes an entry file.
    fn write(&self, entry: &StoredEntry) -> Result<()> {
        let dir = self.version_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory `{dir}`", dir = dir.display()))?;

        let mut temp = NamedTempFile::new_in(&dir).with_context(|| {
            format!(
                "failed to create temporary entry file in `{dir}`",
                dir = dir.display()
            )
        })?;

        bincode::serde::encode_into_std_write(entry, &mut temp, bincode::config::standard())
            .with_context(|| format!("failed to serialize entry `{key}`", key = entry.key))?;

        let path = self.entry_path(&entry.key);
        temp.persist(&path).with_context(|| {
            format!(
                "failed to persist entry file `{path}`",
                path = path.display()
            )
        })?;

        Ok(())
    }

    /// Deletes an entry file.
    ///
    /// Does not return an error if the file does not exist.
    fn delete(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "failed to remove entry file `{path}`",
                    path = path.display()
                )
            }),
        }
    }

    /// Runs a blocking storage operation on the runtime's blocking pool.
    async fn offload<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Self) -> Result<T> + Send + 'static,
    {
        let storage = self.clone();
        runtime::unwrap_task_output(runtime::spawn_blocking(move || f(storage)).await)
            .ok_or_else(|| anyhow!("file cache storage task failed"))?
    }
}

impl fmt::Debug for FileCacheStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCacheStorage")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl CacheStorage for FileCacheStorage {
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.live(key, self.clock.now())?.is_some())
    }

    fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        Ok(self.live(key, self.clock.now())?.map(|entry| entry.value))
    }

    fn add(
        &self,
        key: &str,
        value: CachedValue,
        expires_at: SystemTime,
        base_key: Option<&str>,
    ) -> Result<()> {
        let now = self.clock.now();
        let group = match base_key {
            Some(base_key) if base_key != key => {
                let base = self
                    .live(base_key, now)?
                    .ok_or_else(|| anyhow!("base key `{base_key}` is not present in the cache"))?;
                Some(StoredGroup {
                    base_key: base_key.to_string(),
                    generation: base.generation,
                })
            }
            _ => None,
        };

        // A present entry keeps its generation so the rest of its group survives
        let generation = match self.live(key, now)? {
            Some(existing) => existing.generation,
            None => new_generation(),
        };

        self.write(&StoredEntry {
            key: key.to_string(),
            value,
            expires_at,
            generation,
            group,
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.delete(key)
    }

    fn remove_group(&self, base_key: &str) -> Result<()> {
        // Members stop being present once the base key is gone
        self.delete(base_key)?;
        self.purge_expired()?;
        Ok(())
    }
}

impl AsyncCacheStorage for FileCacheStorage {
    async fn contains(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.offload(move |storage| CacheStorage::contains(&storage, &key))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        let key = key.to_string();
        self.offload(move |storage| CacheStorage::get(&storage, &key))
            .await
    }

    async fn add(
        &self,
        key: &str,
        value: CachedValue,
        expires_at: SystemTime,
        base_key: Option<&str>,
    ) -> Result<()> {
        let key = key.to_string();
        let base_key = base_key.map(str::to_string);
        self.offload(move |storage| {
            CacheStorage::add(&storage, &key, value, expires_at, base_key.as_deref())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.offload(move |storage| CacheStorage::remove(&storage, &key))
            .await
    }

    async fn remove_group(&self, base_key: &str) -> Result<()> {
        let base_key = base_key.to_string();
        self.offload(move |storage| CacheStorage::remove_group(&storage, &base_key))
            .await
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use tempfile::tempdir;

    use super::*;
    use crate::clock::ManualClock;

    fn start() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(10_000)
    }

    #[test]
    fn round_trip() {
        let dir = tempdir().unwrap();
        let storage = FileCacheStorage::new(dir.path()).with_clock(ManualClock::new(start()));
        let expires_at = start() + Duration::from_secs(60);
        let body = CachedValue::Bytes(Bytes::from_static(b"\x00\x01binary\xff"));

        CacheStorage::add(&storage, "k", body.clone(), expires_at, None).unwrap();
        assert!(CacheStorage::contains(&storage, "k").unwrap());
        assert_eq!(CacheStorage::get(&storage, "k").unwrap(), Some(body));
        assert_eq!(CacheStorage::get(&storage, "missing").unwrap(), None);
    }

    #[test]
    fn expiration_boundary() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(start());
        let storage = FileCacheStorage::new(dir.path()).with_clock(clock.clone());
        let expires_at = start() + Duration::from_secs(60);

        CacheStorage::add(
            &storage,
            "k",
            CachedValue::Text("v".to_string()),
            expires_at,
            None,
        )
        .unwrap();

        clock.set(expires_at - Duration::from_secs(1));
        assert!(CacheStorage::contains(&storage, "k").unwrap());
        clock.set(expires_at);
        assert!(!CacheStorage::contains(&storage, "k").unwrap());
    }

    #[test]
    fn corrupt_entry_is_absent() {
        let dir = tempdir().unwrap();
        let storage = FileCacheStorage::new(dir.path()).with_clock(ManualClock::new(start()));
        let expires_at = start() + Duration::from_secs(60);
        CacheStorage::add(&storage, "k", CachedValue::Empty, expires_at, None).unwrap();

        fs::write(storage.entry_path("k"), b"garbage").unwrap();
        assert_eq!(CacheStorage::get(&storage, "k").unwrap(), None);
    }

    #[test]
    fn group_is_not_resurrected() {
        let dir = tempdir().unwrap();
        let storage = FileCacheStorage::new(dir.path()).with_clock(ManualClock::new(start()));
        let expires_at = start() + Duration::from_secs(60);

        CacheStorage::add(&storage, "base", CachedValue::Empty, expires_at, None).unwrap();
        CacheStorage::add(
            &storage,
            "a",
            CachedValue::Text("a".to_string()),
            expires_at,
            Some("base"),
        )
        .unwrap();
        assert!(CacheStorage::contains(&storage, "a").unwrap());

        CacheStorage::remove_group(&storage, "base").unwrap();
        assert!(!CacheStorage::contains(&storage, "a").unwrap());

        CacheStorage::add(&storage, "base", CachedValue::Empty, expires_at, None).unwrap();
        assert!(CacheStorage::contains(&storage, "base").unwrap());
        assert!(!CacheStorage::contains(&storage, "a").unwrap());
    }

    fn entry_files(storage: &FileCacheStorage) -> usize {
        fs::read_dir(storage.version_dir())
            .unwrap()
            .filter(|file| is_entry_file(&file.as_ref().unwrap().path()))
            .count()
    }

    #[test]
    fn purge_deletes_expired_entries() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(start());
        let storage = FileCacheStorage::new(dir.path()).with_clock(clock.clone());
        assert_eq!(storage.purge_expired().unwrap(), 0);

        let short = start() + Duration::from_secs(10);
        let long = start() + Duration::from_secs(60);
        CacheStorage::add(&storage, "base", CachedValue::Empty, short, None).unwrap();
        CacheStorage::add(&storage, "a", CachedValue::Empty, long, Some("base")).unwrap();
        CacheStorage::add(&storage, "kept", CachedValue::Empty, long, None).unwrap();
        fs::write(storage.version_dir().join(".tmp-in-flight"), b"partial").unwrap();
        assert_eq!(entry_files(&storage), 3);

        assert_eq!(storage.purge_expired().unwrap(), 0);

        clock.advance(Duration::from_secs(10));
        assert_eq!(storage.purge_expired().unwrap(), 2);
        assert_eq!(entry_files(&storage), 1);
        assert!(CacheStorage::contains(&storage, "kept").unwrap());
        assert!(storage.version_dir().join(".tmp-in-flight").exists());
    }

    #[test]
    fn removing_group_deletes_member_files() {
        let dir = tempdir().unwrap();
        let storage = FileCacheStorage::new(dir.path()).with_clock(ManualClock::new(start()));
        let expires_at = start() + Duration::from_secs(60);

        CacheStorage::add(&storage, "base", CachedValue::Empty, expires_at, None).unwrap();
        CacheStorage::add(&storage, "a", CachedValue::Empty, expires_at, Some("base")).unwrap();
        CacheStorage::add(&storage, "b", CachedValue::Empty, expires_at, Some("base")).unwrap();
        CacheStorage::add(&storage, "other", CachedValue::Empty, expires_at, None).unwrap();

        CacheStorage::remove_group(&storage, "base").unwrap();
        assert_eq!(entry_files(&storage), 1);
        assert!(CacheStorage::contains(&storage, "other").unwrap());
    }

    #[tokio::test]
    async fn async_operations() {
        let dir = tempdir().unwrap();
        let storage = FileCacheStorage::new(dir.path()).with_clock(ManualClock::new(start()));
        let expires_at = start() + Duration::from_secs(60);

        AsyncCacheStorage::add(&storage, "base", CachedValue::Empty, expires_at, None)
            .await
            .unwrap();
        AsyncCacheStorage::add(
            &storage,
            "k",
            CachedValue::ContentType("text/plain".to_string()),
            expires_at,
            Some("base"),
        )
        .await
        .unwrap();

        assert_eq!(
            AsyncCacheStorage::get(&storage, "k").await.unwrap(),
            Some(CachedValue::ContentType("text/plain".to_string()))
        );

        AsyncCacheStorage::remove(&storage, "k").await.unwrap();
        assert!(!AsyncCacheStorage::contains(&storage, "k").await.unwrap());
        AsyncCacheStorage::remove(&storage, "k").await.unwrap();
    }
}
