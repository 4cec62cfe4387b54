//! In-process cache for tests and embedders that do not want files.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::cache::{CacheEntry, CacheError, DiscoveryCache};
use crate::fingerprint::Fingerprint;
use crate::model::{DiscoveryResult, SubjectClass};

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a prepared entry as-is, e.g. one that is already expired.
    pub async fn insert_entry(&self, entry: CacheEntry) {
        self.entries
            .write()
            .await
            .insert(entry.fingerprint.clone(), entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl DiscoveryCache for MemoryCache {
    fn get<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, CacheError>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(entries
                .get(fingerprint)
                .filter(|entry| !entry.is_expired(Utc::now()))
                .cloned())
        })
    }

    fn put<'a>(
        &'a self,
        result: &'a DiscoveryResult,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.insert_entry(CacheEntry::new(result.clone(), ttl, Utc::now()))
                .await;
            Ok(())
        })
    }

    fn invalidate<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
    ) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move { Ok(self.entries.write().await.remove(fingerprint).is_some()) })
    }

    fn clear_class(&self, class: SubjectClass) -> BoxFuture<'_, Result<usize, CacheError>> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|fingerprint, _| fingerprint.class() != Some(class));
            Ok(before - entries.len())
        })
    }

    fn clear_all(&self) -> BoxFuture<'_, Result<usize, CacheError>> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            let removed = entries.len();
            entries.clear();
            Ok(removed)
        })
    }
}
