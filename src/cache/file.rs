//! Durable cache: one `<fingerprint>.json` document per entry.
//!
//! Writes go to a temp file in the same directory and are renamed into
//! place, so readers see either the old entry or the new one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;

use crate::cache::{CacheEntry, CacheError, DiscoveryCache};
use crate::fingerprint::Fingerprint;
use crate::model::{DiscoveryResult, SubjectClass};

const ENTRY_EXTENSION: &str = "json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Cache rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache in the per-user cache directory.
    pub fn user_default() -> Self {
        Self::new(crate::config::default_cache_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!("{}.{}", fingerprint.as_str(), ENTRY_EXTENSION))
    }

    async fn read_entry(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(fingerprint);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        let entry: CacheEntry = serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if entry.is_expired(Utc::now()) {
            tracing::debug!(subject = %fingerprint, "cache entry expired");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn write_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let io_err = |path: &Path, source| CacheError::Io {
            path: path.display().to_string(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err(&self.dir, e))?;

        let body = serde_json::to_vec_pretty(entry)
            .map_err(|e| CacheError::Encode(entry.fingerprint.to_string(), e.to_string()))?;
        let path = self.entry_path(&entry.fingerprint);
        let temp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            entry.fingerprint.as_str(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&temp, &body)
            .await
            .map_err(|e| io_err(&temp, e))?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_err(&path, e));
        }
        Ok(())
    }

    async fn remove_path(&self, path: &Path) -> Result<bool, CacheError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Remove every entry whose file name starts with `prefix`.
    async fn remove_matching(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.dir.display().to_string(),
                    source,
                });
            }
        };
        let mut removed = 0;
        loop {
            let next = dir.next_entry().await.map_err(|source| CacheError::Io {
                path: self.dir.display().to_string(),
                source,
            })?;
            let Some(item) = next else { break };
            let path = item.path();
            let is_entry = path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION);
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(prefix));
            if is_entry && matches && self.remove_path(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl DiscoveryCache for FileCache {
    fn get<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, CacheError>> {
        Box::pin(self.read_entry(fingerprint))
    }

    fn put<'a>(
        &'a self,
        result: &'a DiscoveryResult,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let entry = CacheEntry::new(result.clone(), ttl, Utc::now());
            self.write_entry(&entry).await
        })
    }

    fn invalidate<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
    ) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move { self.remove_path(&self.entry_path(fingerprint)).await })
    }

    fn clear_class(&self, class: SubjectClass) -> BoxFuture<'_, Result<usize, CacheError>> {
        Box::pin(async move { self.remove_matching(&format!("{}-", class.as_str())).await })
    }

    fn clear_all(&self) -> BoxFuture<'_, Result<usize, CacheError>> {
        Box::pin(self.remove_matching(""))
    }
}
