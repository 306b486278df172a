use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one loading request, allocated by [`crate::asset::CachingAsset`].
///
/// The loader tracks at most one live fetch per id; submitting a new request
/// with the same id cancels and replaces the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Generation counter for a single fetch attempt. Events from a fetch that
/// has been cancelled and replaced carry a stale FetchId and are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchId(pub u64);

/// Upper bound of a requested byte interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeEnd {
    /// Exclusive end offset, i.e. the interval is `[start, end)`.
    Exact(u64),
    /// Read until the origin closes the response.
    ToEnd,
}

/// A half-open byte interval `[start, end)`, or `[start, ..]` for `ToEnd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRange {
    pub start: u64,
    pub end: RangeEnd,
}

impl RequestRange {
    pub fn new(start: u64, end: u64) -> RequestRange {
        RequestRange {
            start,
            end: RangeEnd::Exact(end),
        }
    }

    pub fn to_end(start: u64) -> RequestRange {
        RequestRange {
            start,
            end: RangeEnd::ToEnd,
        }
    }

    /// True when the interval contains no bytes. Empty ranges have no valid
    /// `Range` header form and must never reach the network.
    pub fn is_empty(&self) -> bool {
        match self.end {
            RangeEnd::Exact(end) => end <= self.start,
            RangeEnd::ToEnd => false,
        }
    }

    /// Value for the HTTP `Range` header. HTTP ranges are inclusive, so the
    /// exclusive end offset maps to `end - 1`.
    pub fn header_value(&self) -> String {
        match self.end {
            RangeEnd::Exact(end) => format!("bytes={}-{}", self.start, end.saturating_sub(1)),
            RangeEnd::ToEnd => format!("bytes={}-", self.start),
        }
    }

    /// Absolute exclusive end offset, if it can be determined.
    /// A `ToEnd` range resolves against known content metadata.
    pub fn resolved_end(&self, info: Option<&ContentInfo>) -> Option<u64> {
        match self.end {
            RangeEnd::Exact(end) => Some(end),
            RangeEnd::ToEnd => info.map(|i| i.content_length),
        }
    }
}

impl fmt::Display for RequestRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            RangeEnd::Exact(end) => write!(f, "[{}, {})", self.start, end),
            RangeEnd::ToEnd => write!(f, "[{}, ..)", self.start),
        }
    }
}

/// Resource-level metadata, independent of any particular byte range.
/// Produced once from the first successful probe fetch, or read from cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub content_length: u64,
    pub content_type: String,
    pub byte_range_access_supported: bool,
}

/// A cached resource: its metadata plus a contiguous prefix of its bytes.
///
/// `media_data` always holds the first N bytes of the resource. The store
/// never keeps disjoint fragments; data that would create a gap is dropped
/// at merge time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResource {
    pub key: String,
    pub info: Option<ContentInfo>,
    pub media_data: Vec<u8>,
}

impl CachedResource {
    pub fn new(key: &str) -> CachedResource {
        CachedResource {
            key: key.to_string(),
            info: None,
            media_data: Vec::new(),
        }
    }

    pub fn media_len(&self) -> u64 {
        self.media_data.len() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(RequestRange::new(0, 1).header_value(), "bytes=0-0");
        assert_eq!(RequestRange::new(100, 900).header_value(), "bytes=100-899");
        assert_eq!(RequestRange::to_end(500).header_value(), "bytes=500-");
    }

    #[test]
    fn empty_ranges_are_flagged() {
        assert!(RequestRange::new(0, 0).is_empty());
        assert!(RequestRange::new(5, 5).is_empty());
        assert!(RequestRange::new(5, 3).is_empty());
        assert!(!RequestRange::new(0, 1).is_empty());
        assert!(!RequestRange::to_end(5).is_empty());
    }

    #[test]
    fn to_end_resolves_against_metadata() {
        let info = ContentInfo {
            content_length: 1000,
            content_type: "audio/mpeg".to_string(),
            byte_range_access_supported: true,
        };
        assert_eq!(
            RequestRange::to_end(10).resolved_end(Some(&info)),
            Some(1000)
        );
        assert_eq!(RequestRange::to_end(10).resolved_end(None), None);
        assert_eq!(RequestRange::new(10, 20).resolved_end(None), Some(20));
    }
}
