use bincode::error::{DecodeError, EncodeError};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use thiserror::Error;
use tracing::{debug, warn};

/// Defines errors that can arise while talking to the persistent store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An I/O error occurred while reading or writing the backing storage.
    #[error("Store I/O error: {0}")]
    Io(String),

    /// A value could not be encoded for storage.
    #[error("Store serialization error: {0}")]
    Serialization(String),

    /// A stored value could not be decoded.
    #[error("Store deserialization error: {0}")]
    Deserialization(String),

    /// Fuzzing was started without any persistent store configured.
    #[error("No persistent store configured; refusing to fuzz without persistence")]
    NotConfigured,
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Deserialization(format!("JSON operation error: {}", err))
    }
}
impl From<EncodeError> for StoreError {
    fn from(err: EncodeError) -> Self {
        StoreError::Serialization(format!("Bincode encoding error: {}", err))
    }
}
impl From<DecodeError> for StoreError {
    fn from(err: DecodeError) -> Self {
        StoreError::Deserialization(format!("Bincode decoding error: {}", err))
    }
}

/// A change notification delivered to store listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Save { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8>, value: Vec<u8> },
}

/// A key-value store of opaque byte blobs, where each key maps to a *set* of values.
///
/// This is the only resource shared between fuzzing processes. Implementations must
/// tolerate concurrent writers with last-write-wins semantics: saving a value that is
/// already present, or deleting one that is already gone, is not an error.
pub trait Database: Send + Sync {
    /// Adds `value` to the set stored under `key`.
    fn save(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Returns every value currently stored under `key`, in no particular order.
    fn fetch(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Removes `value` from the set stored under `key`.
    fn delete(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Moves `value` from `src` to `dst`. The default saves before deleting, so a
    /// crash in between leaves a duplicate rather than losing the value.
    fn move_value(&self, src: &[u8], dst: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if src == dst {
            return self.save(dst, value);
        }
        self.save(dst, value)?;
        self.delete(src, value)
    }

    /// Registers a channel that receives every subsequent save/delete event under
    /// `key`. Listeners whose receiving end has been dropped are pruned the next
    /// time an event for their key is broadcast.
    ///
    /// Only changes made through this handle are delivered. Writers in other
    /// processes are not observed; callers that need them must `fetch` the key.
    fn add_listener(&self, key: &[u8], listener: Sender<StoreEvent>);
}

#[derive(Default)]
struct Listeners(Mutex<Vec<(Vec<u8>, Sender<StoreEvent>)>>);

impl Listeners {
    fn add(&self, key: &[u8], listener: Sender<StoreEvent>) {
        self.0.lock().push((key.to_vec(), listener));
    }

    fn broadcast(&self, event: StoreEvent) {
        let key = match &event {
            StoreEvent::Save { key, .. } | StoreEvent::Delete { key, .. } => key,
        };
        self.0.lock().retain(|(watched, listener)| {
            watched != key || listener.send(event.clone()).is_ok()
        });
    }
}

/// A store that lives only as long as the process. Shared between workers running
/// as threads of one process, and used heavily in tests.
#[derive(Default)]
pub struct InMemoryStore {
    data: RwLock<HashMap<Vec<u8>, BTreeSet<Vec<u8>>>>,
    listeners: Listeners,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for InMemoryStore {
    fn save(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let inserted = self
            .data
            .write()
            .entry(key.to_vec())
            .or_default()
            .insert(value.to_vec());
        if inserted {
            self.listeners.broadcast(StoreEvent::Save {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        Ok(())
    }

    fn fetch(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .data
            .read()
            .get(key)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let removed = self
            .data
            .write()
            .get_mut(key)
            .is_some_and(|values| values.remove(value));
        if removed {
            self.listeners.broadcast(StoreEvent::Delete {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        Ok(())
    }

    fn add_listener(&self, key: &[u8], listener: Sender<StoreEvent>) {
        self.listeners.add(key, listener);
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A store that keeps one directory per key and one file per value.
///
/// Directory and file names are MD5 digests of the key and value respectively, so
/// arbitrary byte keys map onto portable file names and saving the same value twice
/// is naturally idempotent. Values are written to a temporary file and renamed into
/// place, so readers never observe a partially written value.
///
/// Listeners only see changes made through this handle; other processes writing to
/// the same directory are picked up on the next `fetch`, which is how drivers poll
/// for corpus entries saved elsewhere.
pub struct DirectoryStore {
    root: PathBuf,
    listeners: Listeners,
}

impl DirectoryStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn new(root: PathBuf) -> Result<Self, StoreError> {
        if !root.exists() {
            fs::create_dir_all(&root).map_err(|e| {
                StoreError::Io(format!(
                    "Failed to create store directory at {:?}: {}",
                    root, e
                ))
            })?;
        } else if !root.is_dir() {
            return Err(StoreError::Io(format!(
                "Store path {:?} exists but is not a directory",
                root
            )));
        }
        debug!(path = ?root, "opened directory store");
        Ok(Self {
            root,
            listeners: Listeners::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &[u8]) -> PathBuf {
        self.root.join(format!("{:x}", md5::compute(key)))
    }

    fn value_path(&self, key: &[u8], value: &[u8]) -> PathBuf {
        self.key_dir(key)
            .join(format!("{:x}", md5::compute(value)))
    }
}

impl Database for DirectoryStore {
    fn save(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let path = self.value_path(key, value);
        if path.exists() {
            return Ok(());
        }
        let dir = self.key_dir(key);
        fs::create_dir_all(&dir).map_err(|e| {
            StoreError::Io(format!("Failed to create key directory {:?}: {}", dir, e))
        })?;

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("value");
        let tmp_path = dir.join(format!(
            ".{}.{}.{}.tmp",
            file_name,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file = fs::File::create(&tmp_path).map_err(|e| {
            StoreError::Io(format!("Failed to create value file {:?}: {}", tmp_path, e))
        })?;
        file.write_all(value).map_err(|e| {
            StoreError::Io(format!("Failed to write value file {:?}: {}", tmp_path, e))
        })?;
        drop(file);
        fs::rename(&tmp_path, &path).map_err(|e| {
            StoreError::Io(format!(
                "Failed to move {:?} into place at {:?}: {}",
                tmp_path, path, e
            ))
        })?;

        self.listeners.broadcast(StoreEvent::Save {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn fetch(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let dir = self.key_dir(key);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut values = Vec::new();
        for entry_result in fs::read_dir(&dir).map_err(|e| {
            StoreError::Io(format!("Failed to read key directory {:?}: {}", dir, e))
        })? {
            let entry = entry_result
                .map_err(|e| StoreError::Io(format!("Error reading entry in {:?}: {}", dir, e)))?;
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with('.'));
            if hidden || !path.is_file() {
                continue;
            }
            match fs::read(&path) {
                Ok(bytes) => values.push(bytes),
                // Another writer deleted it between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = ?path, error = %e, "skipping unreadable store value");
                }
            }
        }
        Ok(values)
    }

    fn delete(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let path = self.value_path(key, value);
        match fs::remove_file(&path) {
            Ok(()) => {
                self.listeners.broadcast(StoreEvent::Delete {
                    key: key.to_vec(),
                    value: value.to_vec(),
                });
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!(
                "Failed to delete value file {:?}: {}",
                path, e
            ))),
        }
    }

    fn add_listener(&self, key: &[u8], listener: Sender<StoreEvent>) {
        self.listeners.add(key, listener);
    }
}

/// The family of store keys used by one fuzz target, all derived from its
/// database key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetKeys {
    base: Vec<u8>,
}

impl TargetKeys {
    pub fn new(database_key: &[u8]) -> Self {
        Self {
            base: database_key.to_vec(),
        }
    }

    fn sub(&self, suffix: &str) -> Vec<u8> {
        let mut key = self.base.clone();
        key.extend_from_slice(b".hivefuzz.");
        key.extend_from_slice(suffix.as_bytes());
        key
    }

    pub fn database_key(&self) -> &[u8] {
        &self.base
    }

    pub fn corpus(&self) -> Vec<u8> {
        self.sub("corpus")
    }

    pub fn failures_shrunk(&self) -> Vec<u8> {
        self.sub("failures.shrunk")
    }

    pub fn failures_unshrunk(&self) -> Vec<u8> {
        self.sub("failures.unshrunk")
    }

    pub fn failures_fixed(&self) -> Vec<u8> {
        self.sub("failures.fixed")
    }

    /// Key holding the observations recorded for one corpus entry, identified by its
    /// encoded choices.
    pub fn observations(&self, encoded_choices: &[u8]) -> Vec<u8> {
        self.sub(&format!("observations.{:x}", md5::compute(encoded_choices)))
    }

    pub fn failure_observations(&self) -> Vec<u8> {
        self.sub("failures.observations")
    }

    pub fn reports(&self) -> Vec<u8> {
        self.sub("reports")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn exercise_set_semantics(store: &dyn Database) {
        assert!(store.fetch(b"k").unwrap().is_empty());
        store.save(b"k", b"one").unwrap();
        store.save(b"k", b"one").unwrap();
        store.save(b"k", b"two").unwrap();
        let mut values = store.fetch(b"k").unwrap();
        values.sort();
        assert_eq!(values, vec![b"one".to_vec(), b"two".to_vec()]);

        store.delete(b"k", b"one").unwrap();
        store.delete(b"k", b"one").unwrap();
        assert_eq!(store.fetch(b"k").unwrap(), vec![b"two".to_vec()]);

        store.move_value(b"k", b"other", b"two").unwrap();
        assert!(store.fetch(b"k").unwrap().is_empty());
        assert_eq!(store.fetch(b"other").unwrap(), vec![b"two".to_vec()]);
    }

    #[test]
    fn in_memory_store_is_a_set_per_key() {
        exercise_set_semantics(&InMemoryStore::new());
    }

    #[test]
    fn directory_store_is_a_set_per_key() {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().join("db")).unwrap();
        exercise_set_semantics(&store);
    }

    #[test]
    fn directory_store_persists_across_handles() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("db");
        {
            let store = DirectoryStore::new(root.clone()).unwrap();
            store.save(b"key", &[1, 2, 3]).unwrap();
        }
        let reopened = DirectoryStore::new(root).unwrap();
        assert_eq!(reopened.fetch(b"key").unwrap(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn directory_store_skips_hidden_files() {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().to_path_buf()).unwrap();
        store.save(b"key", b"visible").unwrap();
        fs::write(store.key_dir(b"key").join(".partial.tmp"), b"junk").unwrap();
        assert_eq!(store.fetch(b"key").unwrap(), vec![b"visible".to_vec()]);
    }

    #[test]
    fn directory_store_rejects_file_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("file.txt");
        fs::File::create(&file_path).unwrap();
        match DirectoryStore::new(file_path) {
            Err(StoreError::Io(msg)) => assert!(msg.contains("not a directory")),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("a plain file must not open as a store"),
        }
    }

    #[test]
    fn listeners_see_changes_and_are_pruned_when_dropped() {
        let store = InMemoryStore::new();
        let (tx, rx) = mpsc::channel();
        let (dead_tx, dead_rx) = mpsc::channel();
        let (other_tx, other_rx) = mpsc::channel();
        store.add_listener(b"k", tx);
        store.add_listener(b"k", dead_tx);
        store.add_listener(b"elsewhere", other_tx);
        drop(dead_rx);

        store.save(b"unwatched", b"v").unwrap();
        store.save(b"k", b"v").unwrap();
        store.save(b"k", b"v").unwrap();
        store.delete(b"k", b"v").unwrap();

        let events: Vec<StoreEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                StoreEvent::Save {
                    key: b"k".to_vec(),
                    value: b"v".to_vec()
                },
                StoreEvent::Delete {
                    key: b"k".to_vec(),
                    value: b"v".to_vec()
                },
            ]
        );
        assert_eq!(other_rx.try_iter().count(), 0);
        assert_eq!(store.listeners.0.lock().len(), 2);
    }

    #[test]
    fn target_keys_are_distinct_per_purpose() {
        let keys = TargetKeys::new(b"tests::my_test");
        let all = [
            keys.corpus(),
            keys.failures_shrunk(),
            keys.failures_unshrunk(),
            keys.failures_fixed(),
            keys.observations(b"a"),
            keys.observations(b"b"),
            keys.failure_observations(),
            keys.reports(),
        ];
        let unique: BTreeSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
        assert!(all.iter().all(|k| k.starts_with(b"tests::my_test")));
    }
}
