use std::{path::Path, sync::Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{merge_continuous, AssetCache, CacheError, MergeOutcome};
use crate::types::{CachedResource, ContentInfo};

/// Persistent cache store backed by sled, with entries JSON-encoded per key.
///
/// Writes for all keys are serialized by a single lock so read-modify-write
/// merges stay atomic with respect to the per-key prefix invariant.
pub struct SledCache {
    db: sled::Db,
    write_lock: Mutex<()>,
}

impl SledCache {
    pub fn open(path: &Path) -> Result<SledCache, CacheError> {
        let db = sled::open(path)?;
        Ok(SledCache {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn read(&self, key: &str) -> Result<Option<CachedResource>, CacheError> {
        let raw = match self.db.get(key)? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        match serde_json::from_slice(&raw) {
            Ok(resource) => Ok(Some(resource)),
            Err(e) => {
                // A corrupt entry is treated as absent and will be rewritten.
                warn!(key, error = %e, "dropping undecodable cache entry");
                Ok(None)
            }
        }
    }

    fn write(&self, key: &str, resource: &CachedResource) -> Result<(), CacheError> {
        let raw = serde_json::to_vec(resource)?;
        self.db.insert(key, raw)?;
        Ok(())
    }
}

#[async_trait]
impl AssetCache for SledCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResource>, CacheError> {
        self.read(key)
    }

    async fn set_metadata(&self, key: &str, info: &ContentInfo) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut resource = self
            .read(key)?
            .unwrap_or_else(|| CachedResource::new(key));
        resource.info = Some(info.clone());
        self.write(key, &resource)
    }

    async fn merge_append(
        &self,
        key: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<MergeOutcome, CacheError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut resource = match self.read(key)? {
            Some(resource) => resource,
            None => {
                debug!(key, offset, "merge rejected: no cache entry");
                return Ok(MergeOutcome::Rejected);
            }
        };

        match merge_continuous(&resource.media_data, data, offset) {
            Some(merged) => {
                let new_len = merged.len() as u64;
                resource.media_data = merged;
                self.write(key, &resource)?;
                Ok(MergeOutcome::Accepted { new_len })
            }
            None => {
                debug!(
                    key,
                    offset,
                    cached_len = resource.media_data.len(),
                    incoming_len = data.len(),
                    "merge rejected: not a contiguous extension"
                );
                Ok(MergeOutcome::Rejected)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info() -> ContentInfo {
        ContentInfo {
            content_length: 6,
            content_type: "audio/flac".to_string(),
            byte_range_access_supported: true,
        }
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let cache = SledCache::open(dir.path()).unwrap();
            cache.set_metadata("song.flac", &info()).await.unwrap();
            let outcome = cache.merge_append("song.flac", 0, &[1, 2, 3]).await.unwrap();
            assert_eq!(outcome, MergeOutcome::Accepted { new_len: 3 });
        }

        let cache = SledCache::open(dir.path()).unwrap();
        let res = cache.get("song.flac").await.unwrap().unwrap();
        assert_eq!(res.media_data, vec![1, 2, 3]);
        assert_eq!(res.info.unwrap(), info());
    }

    #[tokio::test]
    async fn merge_rules_match_memory_store() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SledCache::open(dir.path()).unwrap();

        assert_eq!(
            cache.merge_append("k", 0, &[1]).await.unwrap(),
            MergeOutcome::Rejected
        );

        cache.set_metadata("k", &info()).await.unwrap();
        cache.merge_append("k", 0, &[1, 2, 3]).await.unwrap();
        assert_eq!(
            cache.merge_append("k", 5, &[9]).await.unwrap(),
            MergeOutcome::Rejected
        );
        assert_eq!(
            cache.merge_append("k", 2, &[3, 4]).await.unwrap(),
            MergeOutcome::Accepted { new_len: 4 }
        );
    }
}
