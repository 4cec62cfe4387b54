//! Discovery cache: fingerprint → discovery result, with expiry.
//!
//! Implementations are injected into the coordinator as trait objects.
//! Entries are replaced whole; racing writes for one key are
//! last-write-wins.

pub mod file;
pub mod memory;

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::model::{DiscoveryResult, SubjectClass};

pub use file::FileCache;
pub use memory::MemoryCache;

/// Lifetime of a cache entry unless configured otherwise.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt cache entry {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("failed to encode cache entry for {0}: {1}")]
    Encode(String, String),
}

/// One stored discovery result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result: DiscoveryResult,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Entry for `result` that expires `ttl` after `now`.
    pub fn new(result: DiscoveryResult, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        Self {
            fingerprint: result.subject_fingerprint.clone(),
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            result,
        }
    }

    /// An entry is expired at and after its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Persistent store of discovery results.
pub trait DiscoveryCache: Send + Sync {
    /// Live entry for `fingerprint`. Expired entries read as `None`.
    fn get<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, CacheError>>;

    /// Store `result` under its fingerprint, replacing any existing entry.
    fn put<'a>(
        &'a self,
        result: &'a DiscoveryResult,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Remove one entry. Returns whether it existed.
    fn invalidate<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
    ) -> BoxFuture<'a, Result<bool, CacheError>>;

    /// Remove every entry of one subject class. Returns the number removed.
    fn clear_class(&self, class: SubjectClass) -> BoxFuture<'_, Result<usize, CacheError>>;

    /// Remove every entry. Returns the number removed.
    fn clear_all(&self) -> BoxFuture<'_, Result<usize, CacheError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StrategyKind;

    fn result() -> DiscoveryResult {
        DiscoveryResult {
            tools: vec![],
            strategy_used: StrategyKind::Static,
            discovered_at: Utc::now(),
            subject_fingerprint: Fingerprint::for_test("template"),
            failures: vec![],
            cached_from: None,
        }
    }

    #[test]
    fn test_entry_expires_at_boundary() {
        let now = Utc::now();
        let entry = CacheEntry::new(result(), Duration::from_secs(60), now);
        assert!(!entry.is_expired(now));
        assert!(!entry.is_expired(now + TimeDelta::seconds(59)));
        assert!(entry.is_expired(now + TimeDelta::seconds(60)));
        assert!(entry.is_expired(now + TimeDelta::seconds(61)));
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let now = Utc::now();
        let entry = CacheEntry::new(result(), Duration::MAX, now);
        assert!(!entry.is_expired(now));
        assert_eq!(entry.fingerprint, Fingerprint::for_test("template"));
    }
}
