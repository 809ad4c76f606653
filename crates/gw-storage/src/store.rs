//! The hybrid store: one interface in front of a local cache tier, a
//! shared cache tier, and an optional persistent write-through tier,
//! routed deterministically by `classify_key`.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use gw_protocol::GatewayError;

use crate::entry::{classify_key, now_ms, StorageCategory, StorageEntry};
use crate::persistent::PersistentBackend;

fn blocking_err(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Internal(e.to_string())
}

pub struct HybridStore {
    local: DashMap<String, StorageEntry>,
    shared: DashMap<String, StorageEntry>,
    persistent: Arc<dyn PersistentBackend>,
}

impl HybridStore {
    pub fn new(persistent: Arc<dyn PersistentBackend>) -> Self {
        Self {
            local: DashMap::new(),
            shared: DashMap::new(),
            persistent,
        }
    }

    fn tier(&self, category: StorageCategory) -> &DashMap<String, StorageEntry> {
        if category.is_shared() {
            &self.shared
        } else {
            &self.local
        }
    }

    pub(crate) fn local_tier(&self) -> &DashMap<String, StorageEntry> {
        &self.local
    }

    pub(crate) fn shared_tier(&self) -> &DashMap<String, StorageEntry> {
        &self.shared
    }

    async fn persist(&self, key: &str, entry: &StorageEntry) -> Result<(), GatewayError> {
        let persistent = self.persistent.clone();
        let key = key.to_string();
        let value = entry.value.clone();
        let expires_at_ms = entry.expires_at_ms;
        tokio::task::spawn_blocking(move || persistent.put(&key, &value, expires_at_ms))
            .await
            .map_err(blocking_err)?
            .map_err(blocking_err)
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> Result<(), GatewayError> {
        let category = classify_key(key);
        let entry = StorageEntry::new(value, ttl_ms);
        self.tier(category).insert(key.to_string(), entry.clone());
        if category.is_persistent() {
            self.persist(key, &entry).await?;
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, GatewayError> {
        let category = classify_key(key);

        // Lazy expiry: an expired read reports "not found" and clears the
        // entry, but never holds the map beyond the single removal call.
        if let Some(entry) = self.tier(category).get(key) {
            if entry.is_expired() {
                drop(entry);
                self.tier(category).remove(key);
            } else {
                return Ok(Some(entry.value.clone()));
            }
        }

        if !category.is_persistent() {
            return Ok(None);
        }

        let persistent = self.persistent.clone();
        let owned_key = key.to_string();
        let row = tokio::task::spawn_blocking(move || persistent.get(&owned_key))
            .await
            .map_err(blocking_err)?
            .map_err(blocking_err)?;

        match row {
            Some((_, expires_at_ms)) if expires_at_ms.is_some_and(|at| now_ms() >= at) => {
                Ok(None)
            }
            Some((value, expires_at_ms)) => {
                self.tier(category).insert(
                    key.to_string(),
                    StorageEntry {
                        value: value.clone(),
                        expires_at_ms,
                    },
                );
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, GatewayError> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        let category = classify_key(key);
        self.tier(category).remove(key);
        if category.is_persistent() {
            let persistent = self.persistent.clone();
            let owned = key.to_string();
            tokio::task::spawn_blocking(move || persistent.delete(&owned))
                .await
                .map_err(blocking_err)?
                .map_err(blocking_err)?;
        }
        Ok(())
    }

    /// Atomically add `delta` to an 8-byte little-endian counter, creating
    /// it at zero if absent.
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, GatewayError> {
        let category = classify_key(key);
        let tier = self.tier(category);
        let next = {
            let mut guard = tier
                .entry(key.to_string())
                .or_insert_with(|| StorageEntry::new(0i64.to_le_bytes().to_vec(), 0));
            let current_bytes: [u8; 8] = guard.value.as_slice().try_into().map_err(|_| {
                GatewayError::ValidationError("incr on a non-counter value".into())
            })?;
            let next = i64::from_le_bytes(current_bytes) + delta;
            guard.value = next.to_le_bytes().to_vec();
            next
        };
        if category.is_persistent() {
            let entry = tier.get(key).map(|e| e.value().clone()).unwrap();
            self.persist(key, &entry).await?;
        }
        Ok(next)
    }

    /// Set only if absent. A `Runtime`-category key routes through the
    /// shared tier instead, since node-ID-style allocation needs the
    /// atomicity guarantee a per-node local cache can't give across a
    /// multi-node deployment.
    pub async fn setnx(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> Result<bool, GatewayError> {
        let category = classify_key(key);
        let tier = if category == StorageCategory::Runtime {
            &self.shared
        } else {
            self.tier(category)
        };

        let inserted = match tier.entry(key.to_string()) {
            Entry::Occupied(occ) if occ.get().is_expired() => {
                drop(occ);
                tier.insert(key.to_string(), StorageEntry::new(value.clone(), ttl_ms));
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(vac) => {
                vac.insert(StorageEntry::new(value.clone(), ttl_ms));
                true
            }
        };

        if inserted && category.is_persistent() {
            self.persist(key, &StorageEntry::new(value, ttl_ms)).await?;
        }
        Ok(inserted)
    }

    /// Compare-and-swap on the raw value bytes. `expected = None` requires
    /// the key to be absent (or expired).
    pub async fn cas(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl_ms: u64,
    ) -> Result<bool, GatewayError> {
        let category = classify_key(key);
        let tier = self.tier(category);

        let swapped = match tier.entry(key.to_string()) {
            Entry::Occupied(mut occ) => {
                let matches = !occ.get().is_expired()
                    && expected.is_some_and(|want| want == occ.get().value.as_slice());
                if matches {
                    occ.insert(StorageEntry::new(new_value.clone(), ttl_ms));
                }
                matches
            }
            Entry::Vacant(vac) => {
                if expected.is_none() {
                    vac.insert(StorageEntry::new(new_value.clone(), ttl_ms));
                    true
                } else {
                    false
                }
            }
        };

        if swapped && category.is_persistent() {
            self.persist(key, &StorageEntry::new(new_value, ttl_ms)).await?;
        }
        Ok(swapped)
    }

    pub async fn query_by_prefix(&self, prefix: &str) -> Result<Vec<String>, GatewayError> {
        let category = classify_key(prefix);
        let mut keys: Vec<String> = self
            .tier(category)
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();

        if category.is_persistent() {
            let persistent = self.persistent.clone();
            let owned_prefix = prefix.to_string();
            let persisted = tokio::task::spawn_blocking(move || persistent.query_by_prefix(&owned_prefix))
                .await
                .map_err(blocking_err)?
                .map_err(blocking_err)?;
            for k in persisted {
                if !keys.contains(&k) {
                    keys.push(k);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistent::SqliteBackend;

    fn store() -> HybridStore {
        HybridStore::new(Arc::new(SqliteBackend::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn runtime_key_never_touches_persistent_tier() {
        let store = store();
        store.set("node:id", b"n1".to_vec(), 0).await.unwrap();
        assert_eq!(store.get("node:id").await.unwrap(), Some(b"n1".to_vec()));
        // Not visible in the persistent backend's own view.
        assert!(!store
            .persistent
            .query_by_prefix("node:")
            .unwrap()
            .contains(&"node:id".to_string()));
    }

    #[tokio::test]
    async fn persistent_key_survives_local_cache_eviction() {
        let store = store();
        store
            .set("cfg:persist:x", b"v1".to_vec(), 0)
            .await
            .unwrap();
        store.local.remove("cfg:persist:x");
        assert_eq!(store.get("cfg:persist:x").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_missing() {
        let store = store();
        store.set("k:shared:x", b"v".to_vec(), 5).await.unwrap();
        {
            let mut entry = store.shared.get_mut("k:shared:x").unwrap();
            entry.expires_at_ms = Some(now_ms() - 1);
        }
        assert_eq!(store.get("k:shared:x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn setnx_runtime_key_routes_through_shared_tier() {
        let store = store();
        assert!(store.setnx("node:id", b"n1".to_vec(), 0).await.unwrap());
        assert!(!store.setnx("node:id", b"n2".to_vec(), 0).await.unwrap());
        assert!(store.local.is_empty());
        assert!(store.shared.contains_key("node:id"));
    }

    #[tokio::test]
    async fn cas_only_swaps_on_matching_value() {
        let store = store();
        store.set("k", b"a".to_vec(), 0).await.unwrap();
        assert!(!store.cas("k", Some(b"wrong"), b"b".to_vec(), 0).await.unwrap());
        assert!(store.cas("k", Some(b"a"), b"b".to_vec(), 0).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn incr_creates_then_accumulates() {
        let store = store();
        assert_eq!(store.incr("counter", 5).await.unwrap(), 5);
        assert_eq!(store.incr("counter", 3).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn query_by_prefix_merges_cache_and_persistent_tiers() {
        let store = store();
        store.set("m:persist:1", b"a".to_vec(), 0).await.unwrap();
        store.set("m:persist:2", b"b".to_vec(), 0).await.unwrap();
        store.local.remove("m:persist:1");
        let keys = store.query_by_prefix("m:persist:").await.unwrap();
        assert_eq!(keys, vec!["m:persist:1", "m:persist:2"]);
    }
}
