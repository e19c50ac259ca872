//! Namespaced key-value persistence.
//!
//! A backend is used as a scope: `open` a namespace, issue a bounded run of
//! `get`/`put` calls, then `close`. Only one namespace may be open at a time
//! and keys are limited to [`MAX_KEY_LEN`] bytes, the limit of the
//! ESP32 NVS preferences store.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use thiserror::Error;

pub const MAX_KEY_LEN: usize = 15;

type Namespaces = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no namespace is open")]
    NotOpen,
    #[error("namespace {0:?} is already open")]
    AlreadyOpen(String),
    #[error("key {key:?} is {len} bytes; backend limit is {max}")]
    KeyTooLong { key: String, len: usize, max: usize },
    #[error("store file {path} unreadable: {reason}")]
    Io { path: PathBuf, reason: String },
    #[error("store file {path} is not valid JSON: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Durable string storage partitioned into namespaces.
pub trait Backend {
    fn open(&mut self, namespace: &str) -> Result<(), StorageError>;

    /// Returns the stored string, or `None` when the key has no entry.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value`. Returns `false` when the entry already held exactly
    /// this value and nothing was written.
    fn put(&mut self, key: &str, value: &str) -> Result<bool, StorageError>;

    fn close(&mut self) -> Result<(), StorageError>;

    fn max_key_len(&self) -> usize {
        MAX_KEY_LEN
    }
}

pub fn check_key(key: &str, max: usize) -> Result<(), StorageError> {
    let len = key.len();
    if len == 0 || len > max {
        return Err(StorageError::KeyTooLong {
            key: key.to_string(),
            len,
            max,
        });
    }
    Ok(())
}

fn open_scope(current: &mut Option<String>, namespace: &str) -> Result<(), StorageError> {
    if let Some(open) = current {
        return Err(StorageError::AlreadyOpen(open.clone()));
    }
    *current = Some(namespace.to_string());
    Ok(())
}

/// In-memory backend for tests and simulated devices. Counts effective writes.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    namespaces: Namespaces,
    open: Option<String>,
    writes: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a raw entry directly, bypassing scope and write counting.
    pub fn seed(&mut self, namespace: &str, key: &str, raw: &str) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), raw.to_string());
    }

    pub fn raw(&self, namespace: &str, key: &str) -> Option<&str> {
        self.namespaces
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }
}

impl Backend for MemoryBackend {
    fn open(&mut self, namespace: &str) -> Result<(), StorageError> {
        open_scope(&mut self.open, namespace)
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let namespace = self.open.as_deref().ok_or(StorageError::NotOpen)?;
        check_key(key, self.max_key_len())?;
        Ok(self.raw(namespace, key).map(str::to_string))
    }

    fn put(&mut self, key: &str, value: &str) -> Result<bool, StorageError> {
        let namespace = self.open.clone().ok_or(StorageError::NotOpen)?;
        check_key(key, self.max_key_len())?;
        if self.raw(&namespace, key) == Some(value) {
            return Ok(false);
        }
        self.seed(&namespace, key, value);
        self.writes += 1;
        Ok(true)
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.open.take().map(|_| ()).ok_or(StorageError::NotOpen)
    }
}

/// Backend persisted as a single JSON document `{namespace: {key: value}}`.
///
/// Each effective `put` rewrites the file via temp file + fsync + rename, so a
/// power cut leaves either the old or the new document on disk.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    namespaces: Namespaces,
    open: Option<String>,
}

impl JsonFileBackend {
    /// Loads the store file, starting empty when it does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let namespaces = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| StorageError::Io {
                path: path.clone(),
                reason: format!("{e}"),
            })?;
            serde_json::from_str(&content).map_err(|e| StorageError::Parse {
                path: path.clone(),
                reason: format!("{e}"),
            })?
        } else {
            Namespaces::new()
        };

        tracing::debug!(
            op = "storage.load",
            path = %path.display(),
            namespaces = namespaces.len(),
            "Store file loaded"
        );

        Ok(Self {
            path,
            namespaces,
            open: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `namespaces` to disk without touching the in-memory copy.
    fn persist(&self, namespaces: &Namespaces) -> Result<(), StorageError> {
        let io_err = |e: std::io::Error| StorageError::Io {
            path: self.path.clone(),
            reason: format!("{e}"),
        };
        let json = serde_json::to_string_pretty(namespaces).map_err(|e| StorageError::Parse {
            path: self.path.clone(),
            reason: format!("{e}"),
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o600);

            let mut file = options.open(&temp_path).map_err(io_err)?;
            file.write_all(json.as_bytes()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&temp_path, &self.path).map_err(io_err)?;

        #[cfg(unix)]
        {
            let dir = match self.path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            fs::File::open(dir)
                .and_then(|d| d.sync_all())
                .map_err(io_err)?;
        }
        Ok(())
    }
}

impl Backend for JsonFileBackend {
    fn open(&mut self, namespace: &str) -> Result<(), StorageError> {
        open_scope(&mut self.open, namespace)
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let namespace = self.open.as_deref().ok_or(StorageError::NotOpen)?;
        check_key(key, self.max_key_len())?;
        Ok(self
            .namespaces
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn put(&mut self, key: &str, value: &str) -> Result<bool, StorageError> {
        let namespace = self.open.clone().ok_or(StorageError::NotOpen)?;
        check_key(key, self.max_key_len())?;
        let current = self
            .namespaces
            .get(&namespace)
            .and_then(|entries| entries.get(key));
        if current.map(String::as_str) == Some(value) {
            return Ok(false);
        }

        let mut next = self.namespaces.clone();
        next.entry(namespace.clone())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.persist(&next)?;
        self.namespaces = next;

        tracing::debug!(
            op = "storage.put",
            namespace = %namespace,
            key = key,
            "Entry written"
        );
        Ok(true)
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.open.take().map(|_| ()).ok_or(StorageError::NotOpen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_suppresses_identical_writes() {
        let mut backend = MemoryBackend::new();
        backend.open("config").expect("open");
        assert!(backend.put("tz", "p1:UTC").expect("first put"));
        assert!(!backend.put("tz", "p1:UTC").expect("repeat put"));
        assert_eq!(backend.get("tz").expect("get").as_deref(), Some("p1:UTC"));
        backend.close().expect("close");
        assert_eq!(backend.write_count(), 1);
    }

    #[test]
    fn namespaces_are_isolated() {
        let mut backend = MemoryBackend::new();
        backend.seed("config", "dvc_id", "p1:a");
        backend.open("secrets").expect("open");
        assert_eq!(backend.get("dvc_id").expect("get"), None);
        backend.close().expect("close");
    }

    #[test]
    fn rejects_use_without_open_namespace() {
        let mut backend = MemoryBackend::new();
        assert!(matches!(backend.get("tz"), Err(StorageError::NotOpen)));
        assert!(matches!(backend.put("tz", "p1:"), Err(StorageError::NotOpen)));
        assert!(matches!(backend.close(), Err(StorageError::NotOpen)));
    }

    #[test]
    fn rejects_nested_open() {
        let mut backend = MemoryBackend::new();
        backend.open("config").expect("open");
        let err = backend.open("secrets").unwrap_err();
        assert!(format!("{err}").contains("already open"));
    }

    #[test]
    fn rejects_long_keys() {
        let mut backend = MemoryBackend::new();
        backend.open("config").expect("open");
        let err = backend.put("sixteen_chars_ky", "p1:x").unwrap_err();
        assert!(matches!(err, StorageError::KeyTooLong { len: 16, max: 15, .. }));
    }

    #[test]
    fn file_backend_persists_across_reload() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("store.json");

        let mut backend = JsonFileBackend::load(&path).expect("load empty");
        backend.open("secrets").expect("open");
        assert!(backend.put("s_wifi_ssid", "s1:abc").expect("put"));
        assert!(!backend.put("s_wifi_ssid", "s1:abc").expect("repeat put"));
        backend.close().expect("close");

        let mut reloaded = JsonFileBackend::load(&path).expect("reload");
        reloaded.open("secrets").expect("open");
        assert_eq!(
            reloaded.get("s_wifi_ssid").expect("get").as_deref(),
            Some("s1:abc")
        );
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn key_limit_counts_bytes() {
        check_key("dvc_id", MAX_KEY_LEN).expect("short ascii key");
        let wide = "é".repeat(8);
        assert!(matches!(
            check_key(&wide, MAX_KEY_LEN),
            Err(StorageError::KeyTooLong { len: 16, .. })
        ));
    }

    #[test]
    fn failed_persist_leaves_store_unchanged() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("missing").join("store.json");
        let mut backend = JsonFileBackend::load(&path).expect("load");
        backend.open("config").expect("open");

        assert!(matches!(backend.put("tz", "p1:UTC"), Err(StorageError::Io { .. })));
        assert_eq!(backend.get("tz").expect("get"), None);
        assert!(matches!(backend.put("tz", "p1:UTC"), Err(StorageError::Io { .. })));

        fs::create_dir(dir.path().join("missing")).expect("create dir");
        assert!(backend.put("tz", "p1:UTC").expect("put after recovery"));
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn file_backend_writes_private_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("store.json");
        let mut backend = JsonFileBackend::load(&path).expect("load");
        backend.open("config").expect("open");
        backend.put("tz", "p1:UTC").expect("put");
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn file_backend_reports_corrupt_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("store.json");
        fs::write(&path, "{not json").expect("write");
        let err = JsonFileBackend::load(&path).unwrap_err();
        assert!(matches!(err, StorageError::Parse { .. }));
    }
}
