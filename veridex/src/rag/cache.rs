//! Semantic query cache.
//!
//! Keyed by the lowercased query hash plus the caller's hierarchy scope.
//! Entries expire on a TTL; hits bump `hit_count` and `last_accessed_at`.
//! Writes are last-writer-wins by key.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::canonical::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub query_hash: String,
    pub tenant_id: String,
    pub suite_id: Option<String>,
    pub module_id: Option<String>,
}

impl CacheKey {
    pub fn new(
        query: &str,
        tenant_id: &str,
        suite_id: Option<&str>,
        module_id: Option<&str>,
    ) -> Self {
        CacheKey {
            query_hash: sha256_hex(query.to_lowercase()),
            tenant_id: tenant_id.to_string(),
            suite_id: suite_id.map(str::to_string),
            module_id: module_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedAnswer {
    pub response_text: String,
    pub chunk_ids: Vec<String>,
    pub document_ids: Vec<String>,
    #[serde(skip)]
    pub query_embedding: Vec<f32>,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct QueryCache {
    entries: DashMap<CacheKey, CachedAnswer>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(ttl_secs: i64) -> Self {
        QueryCache {
            entries: DashMap::new(),
            ttl: Duration::seconds(ttl_secs.max(1)),
        }
    }

    /// Hit path: drop the entry if expired, otherwise bump counters and
    /// return a snapshot.
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CachedAnswer> {
        {
            let mut entry = self.entries.get_mut(key)?;
            if entry.expires_at > now {
                entry.hit_count += 1;
                entry.last_accessed_at = now;
                return Some(entry.clone());
            }
        }
        self.entries.remove(key);
        None
    }

    pub fn put(
        &self,
        key: CacheKey,
        response_text: String,
        chunk_ids: Vec<String>,
        document_ids: Vec<String>,
        query_embedding: Vec<f32>,
        now: DateTime<Utc>,
    ) {
        self.entries.insert(
            key,
            CachedAnswer {
                response_text,
                chunk_ids,
                document_ids,
                query_embedding,
                hit_count: 0,
                created_at: now,
                last_accessed_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::new("How do I fix ACC_001?", "tenant-a", Some("fedsuite"), None)
    }

    #[test]
    fn test_key_is_case_insensitive_on_query() {
        let a = CacheKey::new("How Do I Fix ACC_001?", "t", None, None);
        let b = CacheKey::new("how do i fix acc_001?", "t", None, None);
        assert_eq!(a, b);
        let c = CacheKey::new("how do i fix acc_001?", "other-tenant", None, None);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hit_bumps_count_until_expiry() {
        let cache = QueryCache::new(60);
        let now = Utc::now();
        cache.put(
            key(),
            "answer".into(),
            vec!["c1".into()],
            vec!["d1".into()],
            vec![0.0; 4],
            now,
        );

        let first = cache.get(&key(), now + Duration::seconds(1)).unwrap();
        assert_eq!(first.hit_count, 1);
        let second = cache.get(&key(), now + Duration::seconds(2)).unwrap();
        assert_eq!(second.hit_count, 2);
        assert_eq!(second.response_text, "answer");

        assert!(cache.get(&key(), now + Duration::seconds(61)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = QueryCache::new(60);
        let now = Utc::now();
        cache.put(key(), "first".into(), vec![], vec![], vec![], now);
        cache.put(key(), "second".into(), vec![], vec![], vec![], now);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key(), now).unwrap().response_text, "second");
    }

    #[test]
    fn test_purge_expired() {
        let cache = QueryCache::new(10);
        let now = Utc::now();
        cache.put(key(), "a".into(), vec![], vec![], vec![], now);
        cache.put(
            CacheKey::new("other", "t", None, None),
            "b".into(),
            vec![],
            vec![],
            vec![],
            now + Duration::seconds(30),
        );
        assert_eq!(cache.purge_expired(now + Duration::seconds(20)), 1);
        assert_eq!(cache.len(), 1);
    }
}
