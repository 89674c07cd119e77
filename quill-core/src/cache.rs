//! Suggestion cache keyed by the full cursor context.
//!
//! Key layout: `prefix ⧺ "<mask/>" ⧺ suffix`. Every byte of prefix and
//! suffix participates; nothing is truncated. Entries expire after an
//! absolute TTL measured from insertion, and the least recently used
//! entry is evicted once capacity is reached.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

pub const DEFAULT_CACHE_CAPACITY: usize = 5000;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

const MASK: &str = "<mask/>";

#[derive(Debug, Clone)]
struct CachedSuggestion {
    text: String,
    inserted_at: Instant,
}

/// Bounded, time-expiring `(prefix, suffix) → suggestion` map.
pub struct SuggestionCache {
    entries: LruCache<String, CachedSuggestion>,
    ttl: Duration,
}

impl SuggestionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn key(prefix: &str, suffix: &str) -> String {
        let mut key = String::with_capacity(prefix.len() + MASK.len() + suffix.len());
        key.push_str(prefix);
        key.push_str(MASK);
        key.push_str(suffix);
        key
    }

    pub fn insert(&mut self, prefix: &str, suffix: &str, text: impl Into<String>) {
        self.insert_at(prefix, suffix, text.into(), Instant::now());
    }

    /// Look up a suggestion, dropping it if it has expired.
    pub fn get(&mut self, prefix: &str, suffix: &str) -> Option<String> {
        self.get_at(prefix, suffix, Instant::now())
    }

    pub(crate) fn insert_at(&mut self, prefix: &str, suffix: &str, text: String, now: Instant) {
        self.entries.put(
            Self::key(prefix, suffix),
            CachedSuggestion {
                text,
                inserted_at: now,
            },
        );
    }

    pub(crate) fn get_at(&mut self, prefix: &str, suffix: &str, now: Instant) -> Option<String> {
        let key = Self::key(prefix, suffix);
        let fresh = {
            let entry = self.entries.get(&key)?;
            (now.saturating_duration_since(entry.inserted_at) < self.ttl)
                .then(|| entry.text.clone())
        };
        if fresh.is_none() {
            log::trace!("Suggestion cache entry expired");
            self.entries.pop(&key);
        }
        fresh
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

impl Default for SuggestionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

impl std::fmt::Debug for SuggestionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuggestionCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity())
            .field("ttl", &self.ttl)
            .finish()
    }
}
