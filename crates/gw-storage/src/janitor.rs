//! Periodic sweep of expired entries, independent of the lazy
//! expire-on-read path — catches keys nobody ever reads again.

use std::sync::Arc;
use std::time::Duration;

use crate::store::HybridStore;

pub struct Janitor {
    store: Arc<HybridStore>,
    interval: Duration,
}

impl Janitor {
    pub fn new(store: Arc<HybridStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Runs until the returned handle is aborted or its future is dropped.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.store.sweep_expired();
            }
        })
    }
}

impl HybridStore {
    /// Remove every expired entry from both cache tiers. Persistent-tier
    /// rows are left for lazy expiry on next read since a full table scan
    /// here would be disproportionate to what the janitor is for.
    pub fn sweep_expired(&self) {
        self.local_tier().retain(|_, entry| !entry.is_expired());
        self.shared_tier().retain(|_, entry| !entry.is_expired());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistent::SqliteBackend;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let store = Arc::new(HybridStore::new(Arc::new(
            SqliteBackend::open_in_memory().unwrap(),
        )));
        store.set("a:shared:x", b"1".to_vec(), 0).await.unwrap();
        store.set("b:shared:y", b"2".to_vec(), 5).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        store.sweep_expired();

        assert!(store.get("a:shared:x").await.unwrap().is_some());
        assert!(store.get("b:shared:y").await.unwrap().is_none());
    }
}
