//! Bounded LRU cache of validation outcomes keyed by `(schema_id, payload_hash)`.

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;

use crate::domain_types::{SchemaId, ValidationCacheSize};

use super::ValidationError;

type PayloadHash = [u8; 32];
type CacheKey = (SchemaId, PayloadHash);
type CacheValue = Result<(), ValidationError>;

/// Short-circuits repeated identical payloads against the same schema.
///
/// Entries are invalidated on reload of the owning schema by evicting every
/// key for that `schema_id`.
pub struct ValidationCache {
    inner: Mutex<LruCache<CacheKey, CacheValue>>,
}

impl ValidationCache {
    /// Builds a cache bounded to `size` entries.
    #[must_use]
    pub fn new(size: ValidationCacheSize) -> Self {
        let capacity =
            NonZeroUsize::new(size.as_usize()).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Hashes a payload for use as (half of) a cache key.
    #[must_use]
    pub fn hash_payload(payload: &[u8]) -> PayloadHash {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        hasher.finalize().into()
    }

    /// Looks up a cached outcome for `schema_id` and `payload_hash`.
    pub fn get(&self, schema_id: &SchemaId, payload_hash: PayloadHash) -> Option<CacheValue> {
        let key = (schema_id.clone(), payload_hash);
        self.inner.lock().get(&key).cloned()
    }

    /// Records an outcome for `schema_id` and `payload_hash`.
    pub fn put(&self, schema_id: SchemaId, payload_hash: PayloadHash, outcome: CacheValue) {
        self.inner.lock().put((schema_id, payload_hash), outcome);
    }

    /// Evicts every cached entry for `schema_id` (called on schema reload).
    pub fn invalidate_schema(&self, schema_id: &SchemaId) {
        let mut guard = self.inner.lock();
        let stale: Vec<CacheKey> = guard
            .iter()
            .filter(|((id, _), _)| id == schema_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            guard.pop(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_and_invalidates_by_schema() {
        let cache = ValidationCache::new(ValidationCacheSize::try_new(10).unwrap());
        let schema_id = SchemaId::try_new("s1".to_string()).unwrap();
        let hash = ValidationCache::hash_payload(b"payload");

        assert!(cache.get(&schema_id, hash).is_none());
        cache.put(schema_id.clone(), hash, Ok(()));
        assert_eq!(cache.get(&schema_id, hash), Some(Ok(())));

        cache.invalidate_schema(&schema_id);
        assert!(cache.get(&schema_id, hash).is_none());
    }
}
