//! The three cache tiers: compiled-template LRU, on-disk bytecode cache,
//! and the TTL fragment cache for `{% cache %}` blocks.

pub mod bytecode;
pub mod fragment;
pub mod lru;

pub use bytecode::{hash_source, BytecodeCache, BytecodeEntry};
pub use fragment::FragmentCache;
pub use lru::{CacheStats, LruCache};

/// Per-tier statistics returned by `Environment::cache_info`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheInfo {
    pub templates: CacheStats,
    pub bytecode: Option<CacheStats>,
    pub fragments: Option<CacheStats>,
}
