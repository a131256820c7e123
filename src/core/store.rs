//! Key/value persistence for reservoir state, batch progress and preferences

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Prefix for per-file batch progress keys
const PROGRESS_PREFIX: &str = "progress_";

/// String key/value store with no transactional guarantees
pub trait KeyValueStore: Send + Sync + Debug {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// JSON file backed store.
///
/// The whole map is rewritten on each mutation. Read or write failures are
/// logged and otherwise ignored, so a broken file behaves like an empty one.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring unreadable store {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        debug!("Opened store {} with {} keys", path.display(), entries.len());

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &HashMap<String, String>) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let content = serde_json::to_string_pretty(entries)?;
            std::fs::write(&self.path, content)
        };

        if let Err(e) = write() {
            warn!("Failed to persist store {}: {}", self.path.display(), e);
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.flush(&entries);
        }
    }
}

/// Saved state of a partially translated file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub timestamp: i64,
    pub lines: Vec<Option<String>>,
}

impl BatchProgress {
    pub fn completed(&self) -> usize {
        self.lines.iter().filter(|l| l.is_some()).count()
    }
}

/// Progress key for a file, derived from its name and byte size
pub fn progress_key(file_name: &str, file_size: u64) -> String {
    format!("{PROGRESS_PREFIX}{file_name}_{file_size}")
}

/// Progress key for the lines of a file, sized as the lines joined by `\n`.
///
/// The size ignores the original line terminators, so one document keys
/// the same whether it arrives as a file or as a line array.
pub fn progress_key_for_lines(file_name: &str, lines: &[String]) -> String {
    let size = lines.iter().map(String::len).sum::<usize>() + lines.len().saturating_sub(1);
    progress_key(file_name, size as u64)
}

/// Persist batch progress under `key`
pub fn save_progress(store: &dyn KeyValueStore, key: &str, progress: &BatchProgress) {
    match serde_json::to_string(progress) {
        Ok(json) => store.set(key, &json),
        Err(e) => warn!("Failed to encode progress for {}: {}", key, e),
    }
}

/// Restore progress, only when it matches the current line count
pub fn load_progress(store: &dyn KeyValueStore, key: &str, line_count: usize) -> Option<BatchProgress> {
    let raw = store.get(key)?;
    match serde_json::from_str::<BatchProgress>(&raw) {
        Ok(progress) if progress.lines.len() == line_count => Some(progress),
        Ok(progress) => {
            debug!(
                "Discarding progress for {}: {} lines saved, {} expected",
                key,
                progress.lines.len(),
                line_count
            );
            None
        }
        Err(e) => {
            warn!("Failed to parse saved progress for {}: {}", key, e);
            None
        }
    }
}

pub fn clear_progress(store: &dyn KeyValueStore, key: &str) {
    store.remove(key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.get("a").is_none());
        store.set("a", "1");
        assert_eq!(store.get("a").as_deref(), Some("1"));
        store.remove("a");
        store.remove("a");
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store = FileStore::open(&path);
        store.set("k", "v");
        drop(store);

        let reopened = FileStore::open(&path);
        assert_eq!(reopened.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_file_store_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileStore::open(&path);
        assert!(store.get("anything").is_none());
    }

    #[test]
    fn test_progress_key_for_lines() {
        let lines = vec!["Hello".to_string(), "".to_string(), "ဟယ်လို".to_string()];
        assert_eq!(
            progress_key_for_lines("ep01.srt", &lines),
            progress_key("ep01.srt", lines.join("\n").len() as u64)
        );
        assert_eq!(progress_key_for_lines("a.txt", &[]), "progress_a.txt_0");
        assert_eq!(
            progress_key_for_lines("a.txt", &["ab".to_string(), "c".to_string()]),
            "progress_a.txt_4"
        );
    }

    #[test]
    fn test_progress_shape_and_line_count_check() {
        let store = MemoryStore::new();
        let key = progress_key("ep01.srt", 2048);
        assert_eq!(key, "progress_ep01.srt_2048");

        let progress = BatchProgress {
            timestamp: 42,
            lines: vec![Some("1".to_string()), None],
        };
        save_progress(&store, &key, &progress);

        let raw: serde_json::Value = serde_json::from_str(&store.get(&key).unwrap()).unwrap();
        assert_json_eq!(raw, json!({ "timestamp": 42, "lines": ["1", null] }));

        assert_eq!(load_progress(&store, &key, 2).unwrap().completed(), 1);
        assert!(load_progress(&store, &key, 3).is_none());

        clear_progress(&store, &key);
        assert!(load_progress(&store, &key, 2).is_none());
    }
}
