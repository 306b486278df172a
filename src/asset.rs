use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use reqwest::Url;

use crate::{
    cache::AssetCache,
    config::HttpConfig,
    loader::{DataStream, LoadError, ResourceLoader},
    loader_inner::LoaderContext,
    types::{ContentInfo, RequestId, RequestRange},
};

/// Entry point for one cached resource.
///
/// Derives the cache key from the origin URL, owns the resource's loader for
/// its lifetime, and allocates request identities. Dropping the asset (and
/// any loader clones) cancels all in-flight fetches.
pub struct CachingAsset {
    original_url: Url,
    cache_key: String,
    loader: ResourceLoader,
    next_request_id: AtomicU64,
}

impl CachingAsset {
    pub fn new(
        url: Url,
        cache: Arc<dyn AssetCache>,
        http_config: &HttpConfig,
    ) -> Result<CachingAsset, LoadError> {
        let http = http_config.build_client()?;
        let cache_key = Self::cache_key_for(&url);

        let loader = ResourceLoader::new(LoaderContext {
            url: url.clone(),
            cache_key: cache_key.clone(),
            cache,
            http,
        });

        Ok(CachingAsset {
            original_url: url,
            cache_key,
            loader,
            next_request_id: AtomicU64::new(0),
        })
    }

    /// Cache key for a resource URL: its last path segment, or the whole URL
    /// string when the path has none.
    ///
    /// Distinct resources sharing a final path segment will silently share
    /// cached bytes; callers must guarantee uniqueness per resource.
    pub fn cache_key_for(url: &Url) -> String {
        url.path_segments()
            .and_then(|segments| segments.last())
            .filter(|segment| !segment.is_empty())
            .map(|segment| segment.to_string())
            .unwrap_or_else(|| url.to_string())
    }

    pub fn original_url(&self) -> &Url {
        &self.original_url
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Shareable handle to this asset's loader.
    pub fn loader(&self) -> ResourceLoader {
        self.loader.clone()
    }

    /// Allocate an identity for a loading request. Resubmitting with the
    /// same id cancels and replaces the previous request.
    pub fn new_request_id(&self) -> RequestId {
        RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn submit_metadata_request(&self, id: RequestId) -> Result<ContentInfo, LoadError> {
        self.loader.request_metadata(id).await
    }

    pub async fn submit_data_request(
        &self,
        id: RequestId,
        range: RequestRange,
    ) -> Result<DataStream, LoadError> {
        self.loader.request_data(id, range).await
    }

    pub async fn cancel_request(&self, id: RequestId) -> Result<(), LoadError> {
        self.loader.cancel(id).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cache_key_is_last_path_segment() {
        let url = Url::parse("https://cdn.example.com/media/albums/track01.mp3?sig=abc").unwrap();
        assert_eq!(CachingAsset::cache_key_for(&url), "track01.mp3");
    }

    #[test]
    fn cache_key_falls_back_to_full_url() {
        let url = Url::parse("https://cdn.example.com/").unwrap();
        assert_eq!(CachingAsset::cache_key_for(&url), "https://cdn.example.com/");
    }
}
