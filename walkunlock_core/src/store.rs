//! Durable key-value storage behind the ledger and the registry.
//!
//! `FileStore` keeps one file per key so that the CLI and a running service
//! can share a data directory. Writes go to a temp file that is synced and
//! renamed over the original, so readers only ever see a complete value.
//! Every write to a key runs under an exclusive lock on a sidecar
//! `.<key>.lock` file, which makes [`KeyValueStore::update`] an atomic
//! read-modify-write across handles and processes. Changes made by other
//! processes are picked up by [`FileStore::watch_dir`].

use crate::{Error, Result};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Generic durable key-value interface
pub trait KeyValueStore: Send + Sync {
    /// Read the last written value, `None` if the key was never set
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value for `key`
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete `key`; deleting a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    /// Atomically read `key`, pass the current value to `f` and store what it
    /// returns. `Ok(None)` from `f` leaves the value as is; an error from `f`
    /// or from the write leaves it untouched and is returned.
    fn update(&self, key: &str, f: Updater<'_>) -> Result<()>;

    /// Receive the name of every key changed through this store handle
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// Read-modify-write callback for [`KeyValueStore::update`]
pub type Updater<'a> = &'a mut dyn FnMut(Option<&[u8]>) -> Result<Option<Vec<u8>>>;

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Store(format!("invalid key {:?}", key)))
    }
}

/// File-per-key store rooted at a data directory
pub struct FileStore {
    dir: PathBuf,
    changes: broadcast::Sender<String>,
}

impl FileStore {
    /// Open (and create if needed) a store in `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        tracing::debug!("Opened file store at {:?}", dir);
        Ok(Self { dir, changes })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }

    fn notify(&self, key: &str) {
        // No receivers is fine.
        let _ = self.changes.send(key.to_string());
    }

    /// Open and exclusively lock the sidecar lock file for `key`
    fn lock_key(&self, key: &str) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(format!(".{}.lock", key)))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn read_value(path: &Path) -> Result<Option<Vec<u8>>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Acquire shared lock for reading
        file.lock_shared()?;
        let mut contents = Vec::new();
        let read = std::io::BufReader::new(&file).read_to_end(&mut contents);
        file.unlock()?;
        read?;

        Ok(Some(contents))
    }

    fn write_value(&self, path: &Path, value: &[u8]) -> Result<()> {
        // Temp file in the same directory so the rename is atomic
        let temp = NamedTempFile::new_in(&self.dir)?;
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            writer.write_all(value)?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Poll the directory and report keys changed by other processes
    ///
    /// Keys are compared by modification time and size on each pass. The task
    /// stops once every other handle to the store is dropped.
    pub fn watch_dir(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let dir = self.dir.clone();

        tokio::spawn(async move {
            let mut seen = scan_dir(&dir).unwrap_or_default();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };

                let scan_from = dir.clone();
                let current = match tokio::task::spawn_blocking(move || scan_dir(&scan_from)).await
                {
                    Ok(Ok(current)) => current,
                    Ok(Err(e)) => {
                        tracing::warn!("Failed to scan data directory: {}", e);
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("Data directory scan failed: {}", e);
                        break;
                    }
                };

                for key in changed_keys(&seen, &current) {
                    tracing::debug!(key = %key, "Stored value changed externally");
                    store.notify(&key);
                }
                seen = current;
            }
            tracing::debug!("Data directory watcher stopped");
        })
    }
}

type DirSnapshot = HashMap<String, (SystemTime, u64)>;

/// Modification time and size of every key file (dot files are locks and temps)
fn scan_dir(dir: &Path) -> std::io::Result<DirSnapshot> {
    let mut snapshot = HashMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.is_file() {
            snapshot.insert(name, (meta.modified()?, meta.len()));
        }
    }
    Ok(snapshot)
}

fn changed_keys(before: &DirSnapshot, after: &DirSnapshot) -> Vec<String> {
    let mut keys: Vec<String> = after
        .iter()
        .filter(|(key, stamp)| before.get(*key) != Some(*stamp))
        .map(|(key, _)| key.clone())
        .chain(before.keys().filter(|key| !after.contains_key(*key)).cloned())
        .collect();
    keys.sort();
    keys
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        Self::read_value(&path)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let lock = self.lock_key(key)?;
        let written = self.write_value(&path, value);
        lock.unlock()?;
        written?;

        tracing::debug!(key, bytes = value.len(), "Stored value");
        self.notify(key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let lock = self.lock_key(key)?;
        let removed = match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        };
        lock.unlock()?;

        if removed? {
            tracing::debug!(key, "Removed value");
            self.notify(key);
        }
        Ok(())
    }

    fn update(&self, key: &str, f: Updater<'_>) -> Result<()> {
        let path = self.path_for(key)?;
        let lock = self.lock_key(key)?;

        let outcome = Self::read_value(&path).and_then(|current| {
            match f(current.as_deref())? {
                Some(next) => self.write_value(&path, &next).map(|()| Some(next.len())),
                None => Ok(None),
            }
        });
        lock.unlock()?;

        if let Some(bytes) = outcome? {
            tracing::debug!(key, bytes, "Updated value");
            self.notify(key);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

/// Process-local store for tests and ephemeral runs
pub struct MemoryStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
    changes: broadcast::Sender<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.values
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.values()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.values()?.insert(key.to_string(), value.to_vec());
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        if self.values()?.remove(key).is_some() {
            let _ = self.changes.send(key.to_string());
        }
        Ok(())
    }

    fn update(&self, key: &str, f: Updater<'_>) -> Result<()> {
        validate_key(key)?;
        let mut values = self.values()?;
        if let Some(next) = f(values.get(key).map(Vec::as_slice))? {
            values.insert(key.to_string(), next);
            drop(values);
            let _ = self.changes.send(key.to_string());
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

/// Store wrapper whose writes can be switched to fail, for error-path tests
#[cfg(test)]
pub(crate) struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_writes: std::sync::atomic::AtomicBool,
    pub fail_reads: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_writes: Default::default(),
            fail_reads: Default::default(),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn write_guard(&self) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            Err(Error::Store("disk full".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
impl KeyValueStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.fail_reads.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Store("read failed".into()));
        }
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.write_guard()?;
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write_guard()?;
        self.inner.remove(key)
    }

    fn update(&self, key: &str, f: Updater<'_>) -> Result<()> {
        if self.fail_reads.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Store("read failed".into()));
        }
        self.inner.update(key, &mut |current: Option<&[u8]>| {
            let next = f(current)?;
            if next.is_some() {
                self.write_guard()?;
            }
            Ok(next)
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.subscribe()
    }
}
