//! Storage backends for the persistent cache.
//!
//! [`FsStore`] lays entries out as `<root>/<namespace>/<digest>.json`, one
//! file per key. Writes go through a temp file in the same directory followed
//! by an atomic rename, so concurrent readers (including other processes
//! sharing the directory) never observe a half-written entry.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::CacheFault;
use super::keys::{CacheKey, CacheNamespace};

const ENTRY_EXTENSION: &str = "json";

/// One persisted memoisation result. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: String,
    pub value: Value,
    pub created_at: i64,
    pub expires_at: i64,
}

impl StoredEntry {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Valid { created_at: i64, expires_at: i64 },
    Corrupted,
}

/// Entry summary produced by [`CacheStore::scan`].
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub key: CacheKey,
    pub size_bytes: u64,
    pub state: EntryState,
}

impl EntryMeta {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        matches!(self.state, EntryState::Valid { expires_at, .. } if now_millis >= expires_at)
    }
}

/// Key/value storage behind [`super::PersistentCache`].
///
/// Implementations report every failure as a [`CacheFault`]; the cache decides
/// how to degrade.
pub trait CacheStore: Send + Sync + fmt::Debug {
    fn load(&self, key: &CacheKey) -> Result<Option<StoredEntry>, CacheFault>;
    /// Persist `entry`, returning the number of bytes written.
    fn save(&self, key: &CacheKey, entry: &StoredEntry) -> Result<u64, CacheFault>;
    fn remove(&self, key: &CacheKey) -> Result<bool, CacheFault>;
    fn remove_namespace(&self, namespace: &CacheNamespace) -> Result<usize, CacheFault>;
    fn clear(&self) -> Result<usize, CacheFault>;
    fn scan(&self) -> Result<Vec<EntryMeta>, CacheFault>;
    fn usage_bytes(&self) -> Result<u64, CacheFault>;
}

#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Directories are created lazily on first write, so opening never fails.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &CacheNamespace) -> PathBuf {
        self.root.join(namespace.as_str())
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.namespace_dir(key.namespace())
            .join(format!("{}.{ENTRY_EXTENSION}", key.digest()))
    }

    /// Namespace directories currently present under the root.
    fn namespaces(&self) -> Result<Vec<CacheNamespace>, CacheFault> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheFault::io(&self.root, err)),
        };

        let mut namespaces = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CacheFault::io(&self.root, err))?;
            let is_dir = entry
                .file_type()
                .map_err(|err| CacheFault::io(entry.path(), err))?
                .is_dir();
            if !is_dir {
                continue;
            }
            if let Some(namespace) = entry.file_name().to_str().and_then(CacheNamespace::parse) {
                namespaces.push(namespace);
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }

    /// Entry files (digest, path, size) of one namespace.
    fn entry_files(&self, namespace: &CacheNamespace) -> Result<Vec<(String, PathBuf, u64)>, CacheFault> {
        let dir = self.namespace_dir(namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheFault::io(&dir, err)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CacheFault::io(&dir, err))?;
            let path = entry.path();
            let Some(digest) = entry_digest(&path) else {
                continue;
            };
            let size = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => continue,
                // Removed by a concurrent writer between listing and stat.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(CacheFault::io(&path, err)),
            };
            files.push((digest, path, size));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

fn entry_digest(path: &Path) -> Option<String> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    // Temp files from in-flight writes start with a dot.
    if stem.starts_with('.') || stem.is_empty() {
        return None;
    }
    Some(stem.to_string())
}

fn decode_entry(key: &CacheKey, bytes: &[u8]) -> Result<StoredEntry, CacheFault> {
    let entry: StoredEntry = serde_json::from_slice(bytes)
        .map_err(|err| CacheFault::corrupted(key.to_string(), err.to_string()))?;
    if entry.key != key.to_string() {
        return Err(CacheFault::corrupted(
            key.to_string(),
            format!("entry records foreign key `{}`", entry.key),
        ));
    }
    Ok(entry)
}

fn remove_file(path: &Path) -> Result<bool, CacheFault> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CacheFault::io(path, err)),
    }
}

impl CacheStore for FsStore {
    fn load(&self, key: &CacheKey) -> Result<Option<StoredEntry>, CacheFault> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CacheFault::io(&path, err)),
        };
        decode_entry(key, &bytes).map(Some)
    }

    fn save(&self, key: &CacheKey, entry: &StoredEntry) -> Result<u64, CacheFault> {
        let dir = self.namespace_dir(key.namespace());
        fs::create_dir_all(&dir).map_err(|err| CacheFault::io(&dir, err))?;

        let bytes = serde_json::to_vec(entry)?;
        let mut staged = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|err| CacheFault::io(&dir, err))?;
        staged
            .write_all(&bytes)
            .and_then(|()| staged.flush())
            .map_err(|err| CacheFault::io(staged.path(), err))?;

        let path = self.entry_path(key);
        staged
            .persist(&path)
            .map_err(|err| CacheFault::io(&path, err.error))?;
        Ok(bytes.len() as u64)
    }

    fn remove(&self, key: &CacheKey) -> Result<bool, CacheFault> {
        remove_file(&self.entry_path(key))
    }

    fn remove_namespace(&self, namespace: &CacheNamespace) -> Result<usize, CacheFault> {
        let mut removed = 0;
        for (_, path, _) in self.entry_files(namespace)? {
            if remove_file(&path)? {
                removed += 1;
            }
        }
        // Leftover temp files keep the directory alive; that is fine.
        let _ = fs::remove_dir(self.namespace_dir(namespace));
        Ok(removed)
    }

    fn clear(&self) -> Result<usize, CacheFault> {
        let mut removed = 0;
        for namespace in self.namespaces()? {
            removed += self.remove_namespace(&namespace)?;
        }
        Ok(removed)
    }

    fn scan(&self) -> Result<Vec<EntryMeta>, CacheFault> {
        let mut metas = Vec::new();
        for namespace in self.namespaces()? {
            for (digest, path, size_bytes) in self.entry_files(&namespace)? {
                let key = CacheKey::from_parts(namespace.clone(), digest);
                let bytes = match fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(CacheFault::io(&path, err)),
                };
                let state = match decode_entry(&key, &bytes) {
                    Ok(entry) => EntryState::Valid {
                        created_at: entry.created_at,
                        expires_at: entry.expires_at,
                    },
                    Err(_) => EntryState::Corrupted,
                };
                metas.push(EntryMeta {
                    key,
                    size_bytes,
                    state,
                });
            }
        }
        Ok(metas)
    }

    fn usage_bytes(&self) -> Result<u64, CacheFault> {
        let mut total = 0u64;
        for namespace in self.namespaces()? {
            for (_, _, size) in self.entry_files(&namespace)? {
                total = total.saturating_add(size);
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::keys::CacheKeyBuilder;

    fn key(namespace: CacheNamespace, target: &str) -> CacheKey {
        CacheKeyBuilder::new(namespace).arg(target).build()
    }

    fn entry(key: &CacheKey, value: Value) -> StoredEntry {
        StoredEntry {
            key: key.to_string(),
            value,
            created_at: 1_000,
            expires_at: 2_000,
        }
    }

    #[test]
    fn load_missing_key_is_none() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsStore::new(dir.path().join("never-created"));
        let key = key(CacheNamespace::GA4_REPORT, "123456789");
        assert!(store.load(&key).expect("load").is_none());
        assert_eq!(store.usage_bytes().expect("usage"), 0);
        assert!(store.scan().expect("scan").is_empty());
    }

    #[test]
    fn save_then_load_preserves_metric_precision() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsStore::new(dir.path());
        let key = key(CacheNamespace::GA4_REPORT, "123456789");
        let value = json!([{"sessions": 9_007_199_254_740_993_u64, "ctr": 0.1234567890123}]);

        let written = store.save(&key, &entry(&key, value.clone())).expect("save");
        assert!(written > 0);

        let loaded = store.load(&key).expect("load").expect("present");
        assert_eq!(loaded.value, value);
        assert_eq!(store.usage_bytes().expect("usage"), written);
    }

    #[test]
    fn garbage_file_is_reported_as_corrupted() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsStore::new(dir.path());
        let key = key(CacheNamespace::GSC_REPORT, "example.com");
        let ns_dir = dir.path().join("gsc_report");
        fs::create_dir_all(&ns_dir).expect("mkdir");
        fs::write(ns_dir.join(format!("{}.json", key.digest())), b"{not json").expect("write");

        assert!(matches!(
            store.load(&key),
            Err(CacheFault::Corrupted { .. })
        ));
        let scanned = store.scan().expect("scan");
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].state, EntryState::Corrupted);
    }

    #[test]
    fn remove_namespace_leaves_other_namespaces() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsStore::new(dir.path());
        let ga4 = key(CacheNamespace::GA4_REPORT, "123456789");
        let gsc = key(CacheNamespace::GSC_REPORT, "123456789");
        store.save(&ga4, &entry(&ga4, json!(1))).expect("save ga4");
        store.save(&gsc, &entry(&gsc, json!(2))).expect("save gsc");

        assert_eq!(store.remove_namespace(&CacheNamespace::GA4_REPORT).expect("remove"), 1);
        assert!(store.load(&ga4).expect("load").is_none());
        assert!(store.load(&gsc).expect("load").is_some());
        assert_eq!(store.remove_namespace(&CacheNamespace::GA4_REPORT).expect("again"), 0);
    }

    #[test]
    fn clear_ignores_foreign_files_in_root() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("notes.txt"), b"keep me").expect("write");
        let store = FsStore::new(dir.path());
        let a = key(CacheNamespace::GA4_REPORT, "1");
        let b = key(CacheNamespace::GSC_REPORT_ASYNC, "2");
        store.save(&a, &entry(&a, json!(null))).expect("save a");
        store.save(&b, &entry(&b, json!(null))).expect("save b");

        assert_eq!(store.clear().expect("clear"), 2);
        assert!(dir.path().join("notes.txt").exists());
        assert!(!store.remove(&a).expect("remove"));
    }
}
