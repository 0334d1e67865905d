//! Bounded least-recently-used cache of completion responses

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;

/// A completed response as it was first returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub model: String,
    pub credential: String,
    pub text: String,
}

/// Cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CachedResponse>,
    /// Keys from least to most recently used
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

impl CacheInner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

/// Responses keyed by prompt, evicting the least recently used entry once
/// `capacity` is reached
#[derive(Debug)]
pub struct ResponseCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "ResponseCache::new: called");
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up `prompt`, counting a hit or a miss
    pub fn get(&self, prompt: &str) -> Option<CachedResponse> {
        let mut inner = self.lock();
        match inner.entries.get(prompt).cloned() {
            Some(response) => {
                inner.hits += 1;
                inner.touch(prompt);
                Some(response)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, prompt: &str, response: CachedResponse) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        if inner.entries.insert(prompt.to_string(), response).is_none()
            && inner.entries.len() > self.capacity
            && let Some(oldest) = inner.order.pop_front()
        {
            debug!("ResponseCache::insert: evicting least recently used");
            inner.entries.remove(&oldest);
        }
        inner.touch(prompt);
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
        debug!("ResponseCache::clear: cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.entries.len(),
            capacity: self.capacity,
        }
    }
}
