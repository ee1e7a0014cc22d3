//! The TTL cache backing `{% cache %}` blocks.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::lru::CacheStats;

#[derive(Debug)]
struct FragmentEntry {
    output: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct FragmentInner {
    map: HashMap<String, FragmentEntry>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

/// In-memory store of rendered fragment bodies, keyed by the evaluated
/// cache key. Entries expire on lookup; capacity evicts LRU-style.
#[derive(Debug)]
pub struct FragmentCache {
    inner: Mutex<FragmentInner>,
    max_size: usize,
    default_ttl: Option<Duration>,
}

impl FragmentCache {
    pub fn new(max_size: usize, default_ttl: Option<Duration>) -> Self {
        FragmentCache {
            inner: Mutex::new(FragmentInner::default()),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    /// Returns the stored output if present and not expired. Expired
    /// entries are evicted on the way out.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("fragment cache lock");

        let expired = match inner.map.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|at| at <= Instant::now()),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            inner.map.remove(key);
            if let Some(idx) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(idx);
            }
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        if let Some(idx) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(idx);
        }
        inner.order.push_back(key.to_string());
        Some(inner.map[key].output.clone())
    }

    /// Stores a rendered fragment. `ttl` falls back to the environment
    /// default; `None` there means the entry lives as long as the process.
    pub fn store(&self, key: &str, output: String, ttl: Option<Duration>) {
        let mut inner = self.inner.lock().expect("fragment cache lock");
        let expires_at = ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl);

        if inner.map.insert(key.to_string(), FragmentEntry { output, expires_at }).is_none()
            && inner.map.len() > self.max_size
        {
            if let Some(oldest) = inner.order.pop_front() {
                tracing::debug!(key = %oldest, "fragment cache full, evicting");
                inner.map.remove(&oldest);
            }
        }
        if let Some(idx) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(idx);
        }
        inner.order.push_back(key.to_string());
    }

    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock().expect("fragment cache lock");
        inner.map.remove(key);
        if let Some(idx) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(idx);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("fragment cache lock");
        inner.map.clear();
        inner.order.clear();
    }

    pub fn info(&self) -> CacheStats {
        let inner = self.inner.lock().expect("fragment cache lock");
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.map.len(),
            capacity: self.max_size,
        }
    }
}
