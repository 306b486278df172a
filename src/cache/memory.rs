use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::{merge_continuous, AssetCache, CacheError, MergeOutcome};
use crate::types::{CachedResource, ContentInfo};

/// In-process cache store. One instance may be shared by any number of
/// assets; entries are keyed by cache key.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CachedResource>>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }
}

#[async_trait]
impl AssetCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResource>, CacheError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).cloned())
    }

    async fn set_metadata(&self, key: &str, info: &ContentInfo) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(key.to_string())
            .or_insert_with(|| CachedResource::new(key))
            .info = Some(info.clone());
        Ok(())
    }

    async fn merge_append(
        &self,
        key: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<MergeOutcome, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        let resource = match entries.get_mut(key) {
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
