//! Byte-range caching layer between a media-playback consumer and an HTTP
//! origin.
//!
//! A [`CachingAsset`] answers loading requests for one resource: content
//! information (length, MIME type, range support) or byte ranges. Requests
//! are served from an [`AssetCache`] when the cached contiguous prefix
//! covers them; otherwise the remainder is range-fetched from the origin,
//! streamed to the requester as it downloads, and merged back into the
//! cache on completion.

pub mod asset;
pub mod cache;
pub mod config;
mod fetcher;
pub mod loader;
mod loader_inner;
pub mod types;

pub use asset::CachingAsset;
pub use cache::{AssetCache, CacheError, MemoryCache, MergeOutcome, SledCache};
pub use config::{Config, HttpConfig};
pub use fetcher::FetchError;
pub use loader::{DataStream, LoadError, ResourceLoader};
pub use types::{CachedResource, ContentInfo, RangeEnd, RequestId, RequestRange};
