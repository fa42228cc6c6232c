//! Bounded recency filter that suppresses re-processing of seen messages.
//!
//! Entries fall out either by age (`ttl`) or by count (LRU eviction at
//! `capacity`), so memory stays bounded while duplicates arriving over a
//! different propagation path are still caught.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};

use crate::message::MessageId;

pub struct DuplicateDetector {
    seen: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl DuplicateDetector {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(cap),
            ttl,
        }
    }

    /// Record `id` and report whether it was novel.
    ///
    /// The check and the insert happen in one call so that two deliveries of
    /// the same message can never both be reported as novel.
    pub fn check_and_insert(&mut self, id: &MessageId) -> bool {
        self.check_and_insert_at(id, Instant::now())
    }

    pub fn check_and_insert_at(&mut self, id: &MessageId, now: Instant) -> bool {
        if let Some(seen_at) = self.seen.peek(id) {
            if now.saturating_duration_since(*seen_at) < self.ttl {
                return false;
            }
        }
        self.seen.put(id.clone(), now);
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen
            .peek(id)
            .is_some_and(|seen_at| seen_at.elapsed() < self.ttl)
    }

    /// Drop entries older than the ttl.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        // Least recently inserted entries sit at the tail.
        while let Some((_, seen_at)) = self.seen.peek_lru() {
            if now.saturating_duration_since(*seen_at) < self.ttl {
                break;
            }
            self.seen.pop_lru();
            purged += 1;
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
