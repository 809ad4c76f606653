//! Typed JSON adapters over `HybridStore`: JSON-encode on set, JSON-decode
//! on get, with decode failures surfaced as a typed error rather than
//! silently dropped.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use gw_protocol::GatewayError;

use crate::store::HybridStore;

pub struct TypedCas<'a, T> {
    store: &'a HybridStore,
    _marker: PhantomData<T>,
}

impl<'a, T> TypedCas<'a, T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: &'a HybridStore) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, GatewayError> {
        match self.store.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| GatewayError::ValidationError(format!("decode {key}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &T, ttl_ms: u64) -> Result<(), GatewayError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| GatewayError::Internal(format!("encode {key}: {e}")))?;
        self.store.set(key, bytes, ttl_ms).await
    }

    pub async fn cas(
        &self,
        key: &str,
        expected: Option<&T>,
        new_value: &T,
        ttl_ms: u64,
    ) -> Result<bool, GatewayError> {
        let expected_bytes = expected
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| GatewayError::Internal(format!("encode {key}: {e}")))?;
        let new_bytes = serde_json::to_vec(new_value)
            .map_err(|e| GatewayError::Internal(format!("encode {key}: {e}")))?;
        self.store
            .cas(key, expected_bytes.as_deref(), new_bytes, ttl_ms)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistent::SqliteBackend;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct MappingConfig {
        id: String,
        port: u16,
    }

    #[tokio::test]
    async fn round_trips_through_json() {
        let store = HybridStore::new(Arc::new(SqliteBackend::open_in_memory().unwrap()));
        let typed: TypedCas<MappingConfig> = TypedCas::new(&store);
        let cfg = MappingConfig {
            id: "m1".into(),
            port: 8080,
        };
        typed.set("mapping:persist:m1", &cfg, 0).await.unwrap();
        let back = typed.get("mapping:persist:m1").await.unwrap().unwrap();
        assert_eq!(back, cfg);
    }

    #[tokio::test]
    async fn missing_key_decodes_as_none() {
        let store = HybridStore::new(Arc::new(SqliteBackend::open_in_memory().unwrap()));
        let typed: TypedCas<MappingConfig> = TypedCas::new(&store);
        assert!(typed.get("missing").await.unwrap().is_none());
    }
}
