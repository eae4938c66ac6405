//! # Tenancy Cache
//!
//! Project id → sole tenancy id lookups, held in an explicit LRU that the
//! caller owns and injects.
//!
//! ## Lookup Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  directory.sole_tenancy_id("acme")                                     │
//! │       │                                                                 │
//! │       ├── cache hit ──────────────────────────────► "prod"             │
//! │       │                                                                 │
//! │       └── cache miss ──► scan tenancies of "acme"                      │
//! │                              │                                          │
//! │                              ├── exactly one ──► insert, return it     │
//! │                              └── zero / many ──► None (not cached)     │
//! │                                                                         │
//! │  directory.upsert(tenancy) ──► invalidate(tenancy.project_id)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use indexmap::IndexMap;
use tally_core::Tenancy;
use tokio::sync::Mutex;
use tracing::debug;

/// Default number of projects remembered.
pub const DEFAULT_TENANCY_CACHE_CAPACITY: usize = 1024;

// =============================================================================
// LRU
// =============================================================================

/// Bounded LRU of project id → tenancy id.
///
/// Entries are kept in recency order; the front is evicted first.
#[derive(Debug, Clone)]
pub struct TenancyCache {
    capacity: usize,
    entries: IndexMap<String, String>,
    hits: u64,
    misses: u64,
}

impl TenancyCache {
    /// Creates a cache holding at most `capacity` projects (minimum 1).
    pub fn new(capacity: usize) -> Self {
        TenancyCache {
            capacity: capacity.max(1),
            entries: IndexMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, project_id: &str) -> Option<String> {
        match self.entries.shift_remove(project_id) {
            Some(tenancy_id) => {
                self.hits += 1;
                self.entries.insert(project_id.to_string(), tenancy_id.clone());
                Some(tenancy_id)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, project_id: impl Into<String>, tenancy_id: impl Into<String>) {
        let project_id = project_id.into();
        self.entries.shift_remove(&project_id);
        if self.entries.len() >= self.capacity {
            if let Some((evicted, _)) = self.entries.shift_remove_index(0) {
                debug!(project_id = %evicted, "Evicting tenancy cache entry");
            }
        }
        self.entries.insert(project_id, tenancy_id.into());
    }

    pub fn invalidate(&mut self, project_id: &str) -> bool {
        self.entries.shift_remove(project_id).is_some()
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

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

impl Default for TenancyCache {
    fn default() -> Self {
        TenancyCache::new(DEFAULT_TENANCY_CACHE_CAPACITY)
    }
}

// =============================================================================
// Directory
// =============================================================================

/// Known tenancies plus the cache in front of the sole-tenancy lookup.
#[derive(Debug, Default)]
pub struct TenancyDirectory {
    tenancies: Mutex<Vec<Tenancy>>,
    cache: Mutex<TenancyCache>,
}

impl TenancyDirectory {
    pub fn new(tenancies: Vec<Tenancy>, cache: TenancyCache) -> Self {
        TenancyDirectory {
            tenancies: Mutex::new(tenancies),
            cache: Mutex::new(cache),
        }
    }

    /// The only tenancy of `project_id`, or `None` when it has zero or many.
    pub async fn sole_tenancy_id(&self, project_id: &str) -> Option<String> {
        if let Some(hit) = self.cache.lock().await.get(project_id) {
            return Some(hit);
        }

        let tenancies = self.tenancies.lock().await;
        let mut matching = tenancies.iter().filter(|t| t.project_id == project_id);
        let only = match (matching.next(), matching.next()) {
            (Some(tenancy), None) => tenancy.id.clone(),
            _ => return None,
        };
        drop(tenancies);

        self.cache.lock().await.insert(project_id, only.clone());
        Some(only)
    }

    pub async fn get(&self, tenancy_id: &str) -> Option<Tenancy> {
        self.tenancies
            .lock()
            .await
            .iter()
            .find(|t| t.id == tenancy_id)
            .cloned()
    }

    /// Adds or replaces a tenancy and drops its project's cached lookup.
    pub async fn upsert(&self, tenancy: Tenancy) {
        let project_id = tenancy.project_id.clone();
        {
            let mut tenancies = self.tenancies.lock().await;
            match tenancies.iter_mut().find(|t| t.id == tenancy.id) {
                Some(existing) => {
                    if existing.project_id != project_id {
                        self.cache.lock().await.invalidate(&existing.project_id);
                    }
                    *existing = tenancy;
                }
                None => tenancies.push(tenancy),
            }
        }
        self.cache.lock().await.invalidate(&project_id);
    }

    /// Counters of the underlying cache: `(hits, misses)`.
    pub async fn cache_stats(&self) -> (u64, u64) {
        let cache = self.cache.lock().await;
        (cache.hits(), cache.misses())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::TenancyConfig;

    fn tenancy(id: &str, project_id: &str) -> Tenancy {
        Tenancy {
            id: id.into(),
            project_id: project_id.into(),
            config: TenancyConfig::default(),
        }
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = TenancyCache::new(2);
        cache.insert("a", "ta");
        cache.insert("b", "tb");
        assert_eq!(cache.get("a").as_deref(), Some("ta"));

        // "b" is now least recently used
        cache.insert("c", "tc");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("c").as_deref(), Some("tc"));
        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let mut cache = TenancyCache::default();
        cache.insert("a", "ta");
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        cache.insert("b", "tb");
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_directory_caches_sole_tenancy() {
        let directory = TenancyDirectory::new(
            vec![tenancy("prod", "acme"), tenancy("a", "multi"), tenancy("b", "multi")],
            TenancyCache::new(8),
        );

        assert_eq!(directory.sole_tenancy_id("acme").await.as_deref(), Some("prod"));
        assert_eq!(directory.sole_tenancy_id("acme").await.as_deref(), Some("prod"));
        assert_eq!(directory.cache_stats().await, (1, 1));

        assert!(directory.sole_tenancy_id("multi").await.is_none());
        assert!(directory.sole_tenancy_id("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_upsert_invalidates_project() {
        let directory = TenancyDirectory::new(vec![tenancy("prod", "acme")], TenancyCache::new(8));
        assert!(directory.sole_tenancy_id("acme").await.is_some());

        directory.upsert(tenancy("staging", "acme")).await;
        assert!(directory.sole_tenancy_id("acme").await.is_none());
        assert_eq!(directory.get("staging").await.map(|t| t.project_id), Some("acme".into()));
    }
}
