//! Eviction Queue
//!
//! Oldest-first priority queue of evictable resource groups, keyed by each
//! group's build-completion timestamp. When a write would push the store past
//! its byte budget, groups are evicted oldest-first until the target is met,
//! with one refusal rule: never evict data as fresh as (or fresher than) the
//! data being written, which would otherwise thrash the cache re-fetching
//! what it just dropped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{cache_entry_key, DeletionIndex, SizeAccountedStore, TIMESTAMP_KIND};

/// One evictable group: the build timestamp and the `{buildId}!{laneTag}`
/// group key. Ordered oldest-timestamp-first in the queue; ties break on the
/// group key only for determinism, not meaning.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EvictionCandidate {
    pub timestamp: i64,
    pub group: String,
}

/// Min-timestamp priority queue over eviction candidates
#[derive(Debug, Default)]
pub struct EvictionQueue {
    heap: BinaryHeap<Reverse<EvictionCandidate>>,
}

impl EvictionQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a candidate into the in-memory queue only. Used when seeding
    /// from a pre-existing store; duplicate prevention is the caller's job.
    pub fn enqueue(&mut self, timestamp: i64, group: &str) {
        self.heap.push(Reverse(EvictionCandidate {
            timestamp,
            group: group.to_string(),
        }));
    }

    /// Make a group evictable: persist its `!timestamp` entry and enqueue it.
    /// Idempotent — if the timestamp entry already exists the group is
    /// already queued and nothing is written.
    pub fn register(
        &mut self,
        store: &SizeAccountedStore,
        index: &mut DeletionIndex,
        timestamp: i64,
        group: &str,
    ) {
        let timestamp_key = cache_entry_key(group, TIMESTAMP_KIND);
        if store.get(&timestamp_key).is_some() {
            return;
        }
        match store.set(&timestamp_key, Bytes::from(timestamp.to_string())) {
            Ok(()) => {
                index.add(group, TIMESTAMP_KIND);
                self.enqueue(timestamp, group);
            }
            Err(e) => warn!(group, error = %e, "Failed to persist group timestamp"),
        }
    }

    /// Oldest candidate, if any
    pub fn peek_oldest(&self) -> Option<&EvictionCandidate> {
        self.heap.peek().map(|Reverse(item)| item)
    }

    /// Remove and return the oldest candidate
    pub fn pop_oldest(&mut self) -> Option<EvictionCandidate> {
        self.heap.pop().map(|Reverse(item)| item)
    }

    /// Number of queued candidates
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Evict oldest groups until the store's tracked usage is at most
    /// `target` bytes. Returns `true` once the target is met.
    ///
    /// Returns `false` without evicting further when:
    /// - the queue drains while usage still exceeds the target (the usage
    ///   record must be off; logged as a warning, caching degrades), or
    /// - the oldest candidate is not strictly older than `incoming`, the
    ///   timestamp of the payload making room. Evicting equal-or-newer data
    ///   for equally-fresh data would immediately need the evictee again.
    pub fn whittle_down_to(
        &mut self,
        store: &SizeAccountedStore,
        index: &mut DeletionIndex,
        target: i64,
        incoming: i64,
    ) -> bool {
        while store.usage() > target {
            let oldest = match self.peek_oldest() {
                Some(candidate) => candidate.timestamp,
                None => {
                    warn!(
                        usage = store.usage(),
                        target,
                        "Store usage exceeds target but the evictable list is empty; \
                         the usage record must be wrong"
                    );
                    return false;
                }
            };

            if incoming <= oldest {
                debug!(
                    target,
                    oldest,
                    incoming,
                    "Oldest cached group is no older than the incoming payload, \
                     cancelling eviction"
                );
                return false;
            }

            if let Some(victim) = self.pop_oldest() {
                index.clear(store, &victim.group);
                debug!(
                    group = %victim.group,
                    usage = store.usage(),
                    target,
                    "Evicted group to make room"
                );
            }
        }
        true
    }
}
