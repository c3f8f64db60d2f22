//! Process-wide cache of validated monadic responses.
//!
//! Keys are SHA-256 digests of the provider, model and ordered message list
//! (text and attached images), plus the envelope schema for monadic keys.
//! Entries expire a fixed TTL after insertion. When an insert finds the cache
//! full, the least recently accessed half is evicted in one batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::monadic::{MonadicEnvelope, MonadicSchema};
use crate::types::ChatMessage;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Serialize)]
struct KeyMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "no_images")]
    images: &'a [String],
}

fn no_images(images: &&[String]) -> bool {
    images.is_empty()
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    provider: &'a str,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a str>,
    messages: Vec<KeyMessage<'a>>,
}

/// Stable, order-sensitive digest of a request.
pub fn cache_key(provider: &str, model: &str, messages: &[ChatMessage]) -> String {
    digest(provider, model, None, messages)
}

/// Like [`cache_key`], but envelopes validated against different schemas
/// never share an entry.
pub fn monadic_cache_key(
    provider: &str,
    model: &str,
    schema: MonadicSchema,
    messages: &[ChatMessage],
) -> String {
    digest(provider, model, Some(schema.as_str()), messages)
}

fn digest(provider: &str, model: &str, schema: Option<&str>, messages: &[ChatMessage]) -> String {
    let material = KeyMaterial {
        provider,
        model,
        schema,
        messages: messages
            .iter()
            .map(|m| KeyMessage {
                role: m.role.as_str(),
                content: &m.content,
                images: &m.images,
            })
            .collect(),
    };
    let serialized = serde_json::to_vec(&material).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    value: MonadicEnvelope,
    inserted_at: Instant,
    last_access: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Monotonic access counter, orders entries by recency
    tick: u64,
}

/// Hit/miss counters and current size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<MonadicEnvelope> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let expired = inner
            .entries
            .get(key)
            .is_some_and(|e| e.inserted_at.elapsed() >= self.ttl);
        if expired {
            inner.entries.remove(key);
        }

        inner.tick += 1;
        let tick = inner.tick;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %short(key), "response cache hit");
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %short(key), "response cache miss");
                None
            }
        }
    }

    pub fn set(&self, key: impl Into<String>, value: MonadicEnvelope) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        inner.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);

        if inner.entries.len() >= self.capacity && !inner.entries.contains_key(&key) {
            let mut by_access: Vec<(u64, String)> = inner
                .entries
                .iter()
                .map(|(k, e)| (e.last_access, k.clone()))
                .collect();
            by_access.sort_unstable();
            let evict = (self.capacity / 2).max(1);
            for (_, k) in by_access.into_iter().take(evict) {
                inner.entries.remove(&k);
            }
            tracing::debug!(evicted = evict, "response cache full, evicted oldest half");
        }

        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                last_access: tick,
            },
        );
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

fn short(key: &str) -> &str {
    &key[..key.len().min(12)]
}
