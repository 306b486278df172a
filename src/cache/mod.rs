pub mod disk;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use crate::types::{CachedResource, ContentInfo};
pub use disk::SledCache;
pub use memory::MemoryCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO Error")]
    Io(#[from] std::io::Error),
    #[error("Sled Error")]
    Sled(#[from] sled::Error),
    #[error("Serde JSON Error")]
    Serde(#[from] serde_json::Error),
}

/// Result of a merge-append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The data extended the cached prefix; `new_len` is the prefix length
    /// after the merge.
    Accepted { new_len: u64 },
    /// The data would have created a gap or added nothing, and was dropped.
    Rejected,
}

/// Key/value store for cached resources.
///
/// Writers never overwrite media bytes at arbitrary offsets; the only
/// mutations are `set_metadata` (upsert, media preserved) and `merge_append`
/// (accepted only when it extends the contiguous prefix). The cached prefix
/// length for a key is therefore monotonically non-decreasing.
#[async_trait]
pub trait AssetCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<CachedResource>, CacheError>;

    /// Insert or update the content information for `key`. Existing media
    /// bytes are kept.
    async fn set_metadata(&self, key: &str, info: &ContentInfo) -> Result<(), CacheError>;

    /// Append `data` at absolute offset `offset`, if it extends the cached
    /// prefix contiguously. Appending to a key with no entry is rejected;
    /// media bytes are only retained for resources whose metadata has been
    /// stored.
    async fn merge_append(
        &self,
        key: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<MergeOutcome, CacheError>;
}

/// Merge `incoming` (starting at absolute offset `offset`) into `existing`
/// (the cached prefix), returning the extended prefix.
///
/// Returns `None` unless `offset <= existing.len()` (contiguous or
/// overlapping) and `offset + incoming.len() > existing.len()` (actually
/// extends the prefix). Overlapping bytes are taken from `existing`.
pub fn merge_continuous(existing: &[u8], incoming: &[u8], offset: u64) -> Option<Vec<u8>> {
    let cached_len = existing.len() as u64;
    if offset > cached_len || offset + incoming.len() as u64 <= cached_len {
        return None;
    }

    let skip = (cached_len - offset) as usize;
    let mut merged = Vec::with_capacity(existing.len() + incoming.len() - skip);
    merged.extend_from_slice(existing);
    merged.extend_from_slice(&incoming[skip..]);
    Some(merged)
}
