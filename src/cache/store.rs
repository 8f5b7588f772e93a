//! Size-Accounted Key-Value Store
//!
//! Persistent storage for downloaded build payloads, wrapped so that the
//! total bytes in use are tracked incrementally instead of recomputed by
//! scanning every key on each write.
//!
//! Two things distinguish this from a plain KV map:
//!
//! 1. Every key is namespaced under an application prefix, since the backing
//!    store may be shared with other tools.
//! 2. A `usage` counter entry is maintained alongside the data. The counter
//!    is adjusted by the delta of each write: new value length minus the old
//!    value length, or plus the full key length when no old value existed
//!    (an approximation of per-key overhead). The accounting is best-effort,
//!    not bit-exact; callers compare it against a budget with headroom.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::warn;

use crate::error::{Error, Result};

// =============================================================================
// Backend Trait
// =============================================================================

/// A flat string-keyed byte store. Implementations must be safe to share
/// across tasks; all methods are synchronous (writes are small).
pub trait KvBackend: Send + Sync {
    /// Read a value. Missing keys are `None`, never an error.
    fn get(&self, key: &str) -> Option<Bytes>;

    /// Write a value. May fail if the backend is out of space.
    fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Delete a key. Deleting a missing key is a no-op.
    fn remove(&self, key: &str);

    /// Enumerate every stored key.
    fn keys(&self) -> Vec<String>;
}

// =============================================================================
// Memory Backend
// =============================================================================

/// In-memory backend, optionally with a simulated quota. Used in tests and
/// as a scratch store when persistence is disabled.
#[derive(Default)]
pub struct MemoryBackend {
    map: RwLock<HashMap<String, Bytes>>,
    quota: Option<usize>,
}

impl MemoryBackend {
    /// Create an unbounded in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that rejects writes once raw key+value bytes exceed
    /// `quota`, mimicking a platform storage cap
    pub fn with_quota(quota: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            quota: Some(quota),
        }
    }

    fn raw_usage(map: &HashMap<String, Bytes>) -> usize {
        map.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Option<Bytes> {
        self.map.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let mut map = self.map.write();
        if let Some(quota) = self.quota {
            let mut projected = Self::raw_usage(&map) + value.len();
            match map.get(key) {
                Some(old) => projected -= old.len(),
                None => projected += key.len(),
            }
            if projected > quota {
                return Err(Error::StorageWrite {
                    key: key.to_string(),
                    reason: format!("quota of {} bytes exceeded", quota),
                });
            }
        }
        map.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.map.write().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }
}

// =============================================================================
// File Backend
// =============================================================================

/// Directory-per-store backend: one file per key, with the key hex-encoded
/// into the file name so lane tags containing `/`, `=` or `!` stay safe.
/// An in-memory mirror serves reads; files exist so a fresh process can
/// rebuild the cache. Write failures surface as [`Error::StorageWrite`].
pub struct FileBackend {
    root: PathBuf,
    map: RwLock<HashMap<String, Bytes>>,
}

impl FileBackend {
    /// Open (or create) a file-backed store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut map = HashMap::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".kv")) else {
                continue;
            };
            match decode_key(stem) {
                Some(key) => {
                    let data = fs::read(entry.path())?;
                    map.insert(key, Bytes::from(data));
                }
                None => warn!(file = ?name, "Skipping cache file with undecodable name"),
            }
        }

        Ok(Self {
            root,
            map: RwLock::new(map),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.kv", encode_key(key)))
    }
}

impl KvBackend for FileBackend {
    fn get(&self, key: &str) -> Option<Bytes> {
        self.map.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Bytes) -> Result<()> {
        fs::write(self.path_for(key), &value).map_err(|e| Error::StorageWrite {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.map.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) {
        // Losing the file but keeping the map entry would resurrect the key
        // on restart, so drop the map entry regardless of the unlink result.
        if let Err(e) = fs::remove_file(self.path_for(key)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(key, error = %e, "Failed to remove cache file");
            }
        }
        self.map.write().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() * 2);
    for byte in key.bytes() {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    if encoded.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(encoded.len() / 2);
    for chunk in encoded.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(chunk).ok()?;
        bytes.push(u8::from_str_radix(pair, 16).ok()?);
    }
    String::from_utf8(bytes).ok()
}

// =============================================================================
// Size-Accounted Store
// =============================================================================

/// Key under which the running byte total is persisted (inside the namespace)
const USAGE_KEY: &str = "usage";

/// Namespace-prefixing, usage-tracking wrapper over a [`KvBackend`].
///
/// Cloneable handle; clones share the backend.
#[derive(Clone)]
pub struct SizeAccountedStore {
    backend: Arc<dyn KvBackend>,
    namespace: String,
}

impl SizeAccountedStore {
    /// Wrap a backend, prefixing every key with `namespace`
    pub fn new(backend: Arc<dyn KvBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn usage_key(&self) -> String {
        self.full_key(USAGE_KEY)
    }

    fn read_counter(&self) -> i64 {
        let usage_key = self.usage_key();
        match self.backend.get(&usage_key) {
            Some(raw) => {
                let text = String::from_utf8_lossy(&raw);
                match text.trim().parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => {
                        warn!(value = %text, "Usage counter is corrupt, resetting to 0");
                        0
                    }
                }
            }
            None => 0,
        }
    }

    fn usage_delta(&self, delta: i64) {
        let next = self.read_counter() + delta;
        // The counter write bypasses accounting; it would otherwise recurse.
        if let Err(e) = self
            .backend
            .set(&self.usage_key(), Bytes::from(next.to_string()))
        {
            warn!(error = %e, "Failed to persist usage counter");
        }
    }

    /// Write a value and adjust the running total.
    ///
    /// The delta charged is `value.len() - previous.len()`, or
    /// `value.len() + full_key.len()` when the key did not exist before
    /// (the key length stands in for per-entry overhead).
    pub fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let full_key = self.full_key(key);
        let previous = self.backend.get(&full_key);

        self.backend.set(&full_key, value.clone())?;

        let delta = value.len() as i64
            + match previous {
                Some(old) => -(old.len() as i64),
                None => full_key.len() as i64,
            };
        self.usage_delta(delta);
        Ok(())
    }

    /// Read a value. Missing keys return `None`; this never fails.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.backend.get(&self.full_key(key))
    }

    /// Currently tracked byte total. Self-referential: includes the usage
    /// entry's own key and value length, so a freshly wiped store reports 0
    /// and any populated store accounts for its own bookkeeping.
    pub fn usage(&self) -> i64 {
        let usage_key = self.usage_key();
        match self.backend.get(&usage_key) {
            Some(raw) => self.read_counter() + (usage_key.len() + raw.len()) as i64,
            None => 0,
        }
    }

    /// Delete every entry whose (namespace-relative) key starts with
    /// `prefix`. A non-empty prefix decrements the running total per entry;
    /// an empty prefix is a full wipe and skips the bookkeeping entirely,
    /// since the counter itself is among the removed keys.
    pub fn clear_prefix(&self, prefix: &str) {
        let full_prefix = self.full_key(prefix);
        let doomed: Vec<String> = self
            .backend
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(&full_prefix))
            .collect();

        for key in doomed {
            if !prefix.is_empty() {
                if let Some(previous) = self.backend.get(&key) {
                    self.usage_delta(-(key.len() as i64) - previous.len() as i64);
                }
            }
            self.backend.remove(&key);
        }
    }

    /// Delete a single entry, decrementing the running total
    pub fn clear_one(&self, key: &str) {
        let full_key = self.full_key(key);
        if let Some(previous) = self.backend.get(&full_key) {
            self.usage_delta(-(full_key.len() as i64) - previous.len() as i64);
        }
        self.backend.remove(&full_key);
    }

    /// Namespace-relative keys currently stored (bookkeeping entries included)
    pub fn keys(&self) -> Vec<String> {
        self.backend
            .keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.namespace).map(str::to_string))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
