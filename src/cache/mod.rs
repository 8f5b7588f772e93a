//! Bounded Client-Side Cache
//!
//! Persistent cache for downloaded CI payloads, held under a hard byte
//! budget. Four pieces cooperate:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       CacheContext                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SizeAccountedStore   │ namespaced KV + running byte total  │
//! │  EvictionQueue        │ oldest-build-first eviction order   │
//! │  DeletionIndex        │ group → persisted kinds, for        │
//! │                       │ group-atomic deletion               │
//! │  PayloadCodec         │ LZ4 payload compression             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Key layout inside the store namespace:
//!
//! - `cache!{buildId}!{laneTag}!{kind}` — compressed payload per resource
//! - `cache!{buildId}!{laneTag}!timestamp` — build completion time, written
//!   once and used for eviction ordering
//! - `version` / `compressMode` — format markers; a mismatch at startup
//!   wipes the store (or just the `cache!` subset for a compression-only
//!   change). Wiping is the sole migration mechanism.
//! - `usage` — the running byte total

mod deletion;
mod eviction;
mod store;
pub mod compression;

pub use compression::{PayloadCodec, COMPRESS_MODE};
pub use deletion::DeletionIndex;
pub use eviction::{EvictionCandidate, EvictionQueue};
pub use store::{FileBackend, KvBackend, MemoryBackend, SizeAccountedStore};

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Sub-prefix for cached payload entries within the store namespace
pub const CACHE_PREFIX: &str = "cache!";

/// Resource-kind suffix of the per-group timestamp entry
pub const TIMESTAMP_KIND: &str = "timestamp";

/// Persisted format version; bump to force a full wipe on upgrade
pub const STORE_VERSION: &str = "1";

/// Default store namespace (the backing store may be shared)
pub const DEFAULT_NAMESPACE: &str = "lanewatch!";

/// Default cache budget: 5 MB minus headroom for bookkeeping entries
pub const DEFAULT_CACHE_BUDGET: i64 = 5_000_000 - 1024;

/// Store-relative key for one resource of one group
pub fn cache_entry_key(group: &str, kind: &str) -> String {
    format!("{CACHE_PREFIX}{group}!{kind}")
}

/// Resource-group key for one build within one lane
pub fn group_key(build_id: &str, lane_tag: &str) -> String {
    format!("{build_id}!{lane_tag}")
}

// =============================================================================
// Cache Context
// =============================================================================

/// Shared cache state, constructed once at startup and passed by reference
/// into the lanes and the fetch orchestrator. Owning everything in one
/// explicit object (instead of module-level singletons) lets tests run
/// several independent caches side by side.
pub struct CacheContext {
    store: SizeAccountedStore,
    codec: PayloadCodec,
    budget: i64,
    queue: Mutex<EvictionQueue>,
    index: Mutex<DeletionIndex>,
}

impl CacheContext {
    /// Open a cache over `backend`, applying the format-version contract and
    /// seeding the eviction queue from surviving entries.
    pub fn open(backend: Arc<dyn KvBackend>, namespace: &str, budget: i64) -> Result<Self> {
        let store = SizeAccountedStore::new(backend, namespace);
        Self::migrate(&store)?;

        let ctx = Self {
            store,
            codec: PayloadCodec::new(),
            budget,
            queue: Mutex::new(EvictionQueue::new()),
            index: Mutex::new(DeletionIndex::new()),
        };
        ctx.seed_from_store();
        Ok(ctx)
    }

    /// Open with the default namespace and budget
    pub fn open_default(backend: Arc<dyn KvBackend>) -> Result<Self> {
        Self::open(backend, DEFAULT_NAMESPACE, DEFAULT_CACHE_BUDGET)
    }

    /// Apply the startup versioning contract: full wipe on a format-version
    /// mismatch, cache-subset wipe on a compression-mode mismatch.
    fn migrate(store: &SizeAccountedStore) -> Result<()> {
        let version = store.get("version");
        if version.as_deref() != Some(STORE_VERSION.as_bytes()) {
            info!("First boot with this store version, clearing everything");
            store.clear_prefix("");
            store.set("version", Bytes::from_static(STORE_VERSION.as_bytes()))?;
            store.set("compressMode", Bytes::from_static(COMPRESS_MODE.as_bytes()))?;
        } else if store.get("compressMode").as_deref() != Some(COMPRESS_MODE.as_bytes()) {
            info!("First boot with this compression mode, clearing cached payloads");
            store.clear_prefix(CACHE_PREFIX);
            store.set("compressMode", Bytes::from_static(COMPRESS_MODE.as_bytes()))?;
        }
        Ok(())
    }

    /// Rebuild the eviction queue and deletion index by scanning persisted
    /// keys. Runs once, before any fetch.
    fn seed_from_store(&self) {
        let mut queue = self.queue.lock();
        let mut index = self.index.lock();

        for key in self.store.keys() {
            let Some(rest) = key.strip_prefix(CACHE_PREFIX) else {
                continue;
            };
            let Some((group, kind)) = rest.rsplit_once('!') else {
                continue;
            };

            if kind == TIMESTAMP_KIND {
                let raw = self.store.get(&key).unwrap_or_default();
                let text = String::from_utf8_lossy(&raw);
                match text.trim().parse::<i64>() {
                    Ok(timestamp) => {
                        queue.enqueue(timestamp, group);
                        index.add(group, TIMESTAMP_KIND);
                    }
                    Err(_) => {
                        warn!(key = %key, value = %text, "Dropping corrupt timestamp entry");
                        self.store.clear_one(&key);
                    }
                }
            } else {
                index.add(group, kind);
            }
        }

        debug!(
            groups = index.len(),
            evictable = queue.len(),
            usage = self.store.usage(),
            "Seeded cache bookkeeping from persisted entries"
        );
    }

    /// The underlying size-accounted store
    pub fn store(&self) -> &SizeAccountedStore {
        &self.store
    }

    /// Hard upper bound on persisted bytes
    pub fn budget(&self) -> i64 {
        self.budget
    }

    /// Currently tracked persisted bytes
    pub fn usage(&self) -> i64 {
        self.store.usage()
    }

    /// Number of groups currently evictable
    pub fn evictable_groups(&self) -> usize {
        self.queue.lock().len()
    }

    /// Fetch and decompress a cached payload. A corrupt entry is dropped and
    /// reported as a miss so the caller re-fetches.
    pub fn lookup(&self, group: &str, kind: &str) -> Option<String> {
        let key = cache_entry_key(group, kind);
        let block = self.store.get(&key)?;
        match self.codec.decompress(&block) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                self.store.clear_one(&key);
                None
            }
        }
    }

    /// Record a completed build's timestamp, making its group evictable.
    /// Idempotent: the first recorded timestamp for a group wins.
    pub fn register_group(&self, timestamp: i64, group: &str) {
        let mut queue = self.queue.lock();
        let mut index = self.index.lock();
        queue.register(&self.store, &mut index, timestamp, group);
    }

    /// Compress and persist a payload, evicting older groups first if the
    /// budget requires it. Returns whether the payload was actually stored:
    /// `false` means eviction could not make room or the backend refused the
    /// write, both of which degrade caching without failing the fetch.
    pub fn persist(&self, group: &str, kind: &str, text: &str, timestamp: i64) -> bool {
        let compressed = match self.codec.compress(text) {
            Ok(block) => block,
            Err(e) => {
                warn!(group, kind, error = %e, "Compression failed, payload not cached");
                return false;
            }
        };

        let mut queue = self.queue.lock();
        let mut index = self.index.lock();

        let target = self.budget - compressed.len() as i64;
        if !queue.whittle_down_to(&self.store, &mut index, target, timestamp) {
            return false;
        }

        let key = cache_entry_key(group, kind);
        match self.store.set(&key, compressed) {
            Ok(()) => {
                index.add(group, kind);
                true
            }
            Err(e) => {
                // Payload was fetched and interpreted fine; only the cache
                // write is skipped.
                warn!(key = %key, error = %e, "Cache write skipped");
                false
            }
        }
    }

    /// Check for a small permanent marker entry (e.g. a known-404 record)
    pub fn has_marker(&self, group: &str, kind: &str) -> bool {
        self.store.get(&cache_entry_key(group, kind)).is_some()
    }

    /// Write a permanent marker entry for a group. Marker loss on a failed
    /// write is tolerable — the next load just retries the fetch.
    pub fn set_marker(&self, group: &str, kind: &str) {
        let key = cache_entry_key(group, kind);
        match self.store.set(&key, Bytes::from_static(b"1")) {
            Ok(()) => self.index.lock().add(group, kind),
            Err(e) => warn!(key = %key, error = %e, "Failed to persist marker"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> CacheContext {
        CacheContext::open(Arc::new(MemoryBackend::new()), "test!", 10_000).unwrap()
    }

    #[test]
    fn test_first_boot_stamps_version() {
        let ctx = context();
        assert_eq!(
            ctx.store().get("version").unwrap(),
            Bytes::from_static(STORE_VERSION.as_bytes())
        );
        assert_eq!(
            ctx.store().get("compressMode").unwrap(),
            Bytes::from_static(COMPRESS_MODE.as_bytes())
        );
    }

    #[test]
    fn test_version_mismatch_wipes_everything() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let store = SizeAccountedStore::new(backend.clone(), "test!");
            store.set("version", Bytes::from_static(b"0")).unwrap();
            store.set("cache!1!lane!metadata", Bytes::from_static(b"old")).unwrap();
            store.set("unrelated", Bytes::from_static(b"old")).unwrap();
        }

        let ctx = CacheContext::open(backend, "test!", 10_000).unwrap();
        assert!(ctx.store().get("cache!1!lane!metadata").is_none());
        assert!(ctx.store().get("unrelated").is_none());
        assert_eq!(
            ctx.store().get("version").unwrap(),
            Bytes::from_static(STORE_VERSION.as_bytes())
        );
    }

    #[test]
    fn test_compress_mode_mismatch_wipes_only_cache_subset() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let store = SizeAccountedStore::new(backend.clone(), "test!");
            store
                .set("version", Bytes::from_static(STORE_VERSION.as_bytes()))
                .unwrap();
            store.set("compressMode", Bytes::from_static(b"other")).unwrap();
            store.set("cache!1!lane!metadata", Bytes::from_static(b"old")).unwrap();
            store.set("unrelated", Bytes::from_static(b"kept")).unwrap();
        }

        let ctx = CacheContext::open(backend, "test!", 10_000).unwrap();
        assert!(ctx.store().get("cache!1!lane!metadata").is_none());
        assert_eq!(ctx.store().get("unrelated").unwrap(), Bytes::from_static(b"kept"));
        assert_eq!(
            ctx.store().get("compressMode").unwrap(),
            Bytes::from_static(COMPRESS_MODE.as_bytes())
        );
    }

    #[test]
    fn test_persist_then_lookup_roundtrip() {
        let ctx = context();
        let group = group_key("100", "lane-a");

        ctx.register_group(1_500_000, &group);
        assert!(ctx.persist(&group, "metadata", r#"{"result":"SUCCESS"}"#, 1_500_000));
        assert_eq!(
            ctx.lookup(&group, "metadata").unwrap(),
            r#"{"result":"SUCCESS"}"#
        );
    }

    #[test]
    fn test_lookup_miss() {
        let ctx = context();
        assert!(ctx.lookup("100!lane-a", "metadata").is_none());
    }

    #[test]
    fn test_corrupt_entry_is_dropped_and_reported_as_miss() {
        let ctx = context();
        let group = group_key("100", "lane-a");
        ctx.store()
            .set(&cache_entry_key(&group, "metadata"), Bytes::from_static(b"not lz4"))
            .unwrap();

        assert!(ctx.lookup(&group, "metadata").is_none());
        assert!(ctx.store().get(&cache_entry_key(&group, "metadata")).is_none());
    }

    #[test]
    fn test_seeding_restores_eviction_order() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let ctx = CacheContext::open(backend.clone(), "test!", 1_600).unwrap();
            for (id, ts) in [("3", 300), ("1", 100), ("2", 200)] {
                let group = group_key(id, "lane");
                ctx.register_group(ts, &group);
                assert!(ctx.persist(&group, "report", &incompressible(400), ts));
            }
        }

        // A fresh context over the same backend rediscovers the groups.
        let ctx = CacheContext::open(backend, "test!", 1_600).unwrap();
        assert_eq!(ctx.evictable_groups(), 3);

        // A payload that does not fit must push out the oldest seeded group.
        let group = group_key("4", "lane");
        ctx.register_group(400, &group);
        assert!(ctx.persist(&group, "report", &incompressible(400), 400));
        assert!(ctx.lookup("1!lane", "report").is_none());
        assert!(ctx.lookup("3!lane", "report").is_some());
    }

    #[test]
    fn test_markers() {
        let ctx = context();
        assert!(!ctx.has_marker("5!lane", "report404"));
        ctx.set_marker("5!lane", "report404");
        assert!(ctx.has_marker("5!lane", "report404"));
    }

    #[test]
    fn test_budget_scenario_evicts_until_new_payload_fits() {
        // Budget 1000; three groups of ~400 bytes at timestamps 1,2,3; a
        // fourth ~300-byte group at timestamp 4 must push out groups 1 and 2.
        let ctx = CacheContext::open(Arc::new(MemoryBackend::new()), "t!", 1000).unwrap();

        // Incompressible payloads so persisted sizes stay predictable.
        let payload_400: String = incompressible(380);
        let payload_300: String = incompressible(280);

        for (id, ts) in [("1", 1_000), ("2", 2_000), ("3", 3_000)] {
            let group = group_key(id, "lane");
            ctx.register_group(ts, &group);
            ctx.persist(&group, "report", &payload_400, ts);
        }

        let group = group_key("4", "lane");
        ctx.register_group(4_000, &group);
        assert!(ctx.persist(&group, "report", &payload_300, 4_000));

        assert!(ctx.lookup("1!lane", "report").is_none(), "oldest group must go first");
        assert!(ctx.lookup("2!lane", "report").is_none(), "second group also evicted");
        assert!(ctx.lookup("3!lane", "report").is_some());
        assert!(ctx.lookup("4!lane", "report").is_some());
        assert!(ctx.usage() <= ctx.budget());
    }

    #[test]
    fn test_quota_refusal_degrades_to_uncached() {
        let backend = Arc::new(MemoryBackend::with_quota(600));
        let ctx = CacheContext::open(backend, "t!", 100_000).unwrap();

        let group = group_key("1", "lane");
        ctx.register_group(1_000, &group);
        // Budget permits the write but the backend quota does not.
        assert!(!ctx.persist(&group, "report", &incompressible(2_000), 1_000));
        assert!(ctx.lookup(&group, "report").is_none());
    }

    /// Pseudo-random printable text that LZ4 cannot meaningfully shrink
    fn incompressible(len: usize) -> String {
        let mut state: u32 = 0x2545_f491;
        let mut out = String::with_capacity(len);
        for _ in 0..len {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            out.push(char::from(b' ' + (state >> 24) as u8 % 94));
        }
        out
    }
}
