use std::sync::{Arc, Mutex};

use futures::StreamExt;
use reqwest::{
    header::{self, HeaderMap},
    Client, StatusCode, Url,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::trace;

use crate::types::{ContentInfo, FetchId, RequestId, RequestRange};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Transport error")]
    Transport(#[from] reqwest::Error),
    #[error("Unexpected response from origin")]
    UnexpectedResponse,
    #[error("Fetcher already started")]
    AlreadyStarted,
}

/// What a fetch is resolving: resource metadata via a 1-byte probe, or a
/// streamed byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchKind {
    ContentInfo,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchState {
    Idle,
    Started,
    Cancelled,
    Completed,
    Failed,
}

/// Event emitted by a fetch's transfer task, tagged with the originating
/// request and fetch generation so the loader can discard stale deliveries.
#[derive(Debug)]
pub(crate) struct FetchNotice {
    pub request_id: RequestId,
    pub fetch_id: FetchId,
    pub event: FetchEvent,
}

#[derive(Debug)]
pub(crate) enum FetchEvent {
    /// One streamed body chunk (data fetches only).
    Chunk(bytes::Bytes),
    /// Terminal result of a metadata fetch.
    Metadata(Result<ContentInfo, FetchError>),
    /// Terminal result of a data fetch, with everything downloaded before
    /// the error (if any).
    Complete {
        error: Option<FetchError>,
        downloaded: Vec<u8>,
    },
}

/// Performs exactly one HTTP range request against the origin.
///
/// `Idle → Started → (Cancelled | Completed | Failed)`, with no transitions
/// out of the terminal states. Cancelling aborts the transfer task; the
/// loader's fetch-id check makes any already-queued event a no-op.
pub(crate) struct RangeFetcher {
    http: Client,
    url: Url,
    kind: FetchKind,
    request_id: RequestId,
    fetch_id: FetchId,
    events: mpsc::Sender<FetchNotice>,
    state: Arc<Mutex<FetchState>>,
    task: Option<JoinHandle<()>>,
}

impl RangeFetcher {
    pub fn new(
        http: Client,
        url: Url,
        kind: FetchKind,
        request_id: RequestId,
        fetch_id: FetchId,
        events: mpsc::Sender<FetchNotice>,
    ) -> RangeFetcher {
        RangeFetcher {
            http,
            url,
            kind,
            request_id,
            fetch_id,
            events,
            state: Arc::new(Mutex::new(FetchState::Idle)),
            task: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> FetchState {
        *self.state.lock().unwrap()
    }

    /// Issue the range GET. May only be called once per instance; a fetcher
    /// cancelled while idle never touches the network and `start` becomes a
    /// no-op.
    pub fn start(&mut self, range: RequestRange) -> Result<(), FetchError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                FetchState::Idle => *state = FetchState::Started,
                FetchState::Cancelled => return Ok(()),
                _ => return Err(FetchError::AlreadyStarted),
            }
        }

        trace!(request_id = %self.request_id, %range, url = %self.url, "starting range fetch");
        self.task = Some(tokio::spawn(fetch_thread(
            self.http.clone(),
            self.url.clone(),
            range,
            self.kind,
            self.request_id,
            self.fetch_id,
            self.events.clone(),
            self.state.clone(),
        )));
        Ok(())
    }

    /// Abort the transfer. Idempotent; a fetch that already reached a
    /// terminal state is left as-is.
    pub fn cancel(&mut self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                FetchState::Idle | FetchState::Started => *state = FetchState::Cancelled,
                _ => return,
            }
        }

        trace!(request_id = %self.request_id, "cancelling range fetch");
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_thread(
    http: Client,
    url: Url,
    range: RequestRange,
    kind: FetchKind,
    request_id: RequestId,
    fetch_id: FetchId,
    events: mpsc::Sender<FetchNotice>,
    state: Arc<Mutex<FetchState>>,
) {
    let event = match kind {
        FetchKind::ContentInfo => {
            FetchEvent::Metadata(fetch_content_info(&http, &url, range).await)
        }
        FetchKind::Data => {
            let (error, downloaded) =
                fetch_data(&http, &url, range, request_id, fetch_id, &events).await;
            FetchEvent::Complete { error, downloaded }
        }
    };

    let failed = matches!(
        &event,
        FetchEvent::Metadata(Err(_)) | FetchEvent::Complete { error: Some(_), .. }
    );

    {
        let mut state = state.lock().unwrap();
        if *state == FetchState::Started {
            *state = if failed {
                FetchState::Failed
            } else {
                FetchState::Completed
            };
        }
    }

    let _ = events
        .send(FetchNotice {
            request_id,
            fetch_id,
            event,
        })
        .await;
}

async fn fetch_content_info(
    http: &Client,
    url: &Url,
    range: RequestRange,
) -> Result<ContentInfo, FetchError> {
    let res = http
        .get(url.clone())
        .header(header::RANGE, range.header_value())
        .send()
        .await?;

    parse_content_info(res.status(), res.headers())
}

async fn fetch_data(
    http: &Client,
    url: &Url,
    range: RequestRange,
    request_id: RequestId,
    fetch_id: FetchId,
    events: &mpsc::Sender<FetchNotice>,
) -> (Option<FetchError>, Vec<u8>) {
    let mut downloaded = Vec::new();

    let res = match http
        .get(url.clone())
        .header(header::RANGE, range.header_value())
        .send()
        .await
    {
        Ok(res) => res,
        Err(e) => return (Some(e.into()), downloaded),
    };

    if !res.status().is_success() {
        return (Some(FetchError::UnexpectedResponse), downloaded);
    }

    let mut body = res.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                downloaded.extend_from_slice(&bytes);
                let notice = FetchNotice {
                    request_id,
                    fetch_id,
                    event: FetchEvent::Chunk(bytes),
                };
                if events.send(notice).await.is_err() {
                    // Loader has shut down; nobody is left to deliver to.
                    return (None, downloaded);
                }
            }
            Err(e) => return (Some(e.into()), downloaded),
        }
    }

    (None, downloaded)
}

/// Derive content information from a probe response's headers.
///
/// The total length comes from the `Content-Range` total field; an origin
/// that ignored the range request (plain 200) reports it via
/// `Content-Length` instead. Byte-range access is supported only when the
/// response says `Accept-Ranges: bytes`.
pub(crate) fn parse_content_info(
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<ContentInfo, FetchError> {
    if !status.is_success() {
        return Err(FetchError::UnexpectedResponse);
    }

    let content_length = match header_str(headers, header::CONTENT_RANGE) {
        Some(content_range) => content_range
            .rsplit('/')
            .next()
            .and_then(|total| total.parse::<u64>().ok())
            .ok_or(FetchError::UnexpectedResponse)?,
        None => header_str(headers, header::CONTENT_LENGTH)
            .and_then(|len| len.parse::<u64>().ok())
            .ok_or(FetchError::UnexpectedResponse)?,
    };

    let content_type = header_str(headers, header::CONTENT_TYPE)
        .unwrap_or_default()
        .to_string();

    let byte_range_access_supported =
        header_str(headers, header::ACCEPT_RANGES) == Some("bytes");

    Ok(ContentInfo {
        content_length,
        content_type,
        byte_range_access_supported,
    })
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod test {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn probe_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_static("bytes 0-0/1000000"),
        );
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/mpeg"));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers
    }

    #[test]
    fn parses_probe_response() {
        let info = parse_content_info(StatusCode::PARTIAL_CONTENT, &probe_headers()).unwrap();
        assert_eq!(info.content_length, 1_000_000);
        assert_eq!(info.content_type, "audio/mpeg");
        assert!(info.byte_range_access_supported);
    }

    #[test]
    fn missing_accept_ranges_means_no_range_access() {
        let mut headers = probe_headers();
        headers.remove(header::ACCEPT_RANGES);
        let info = parse_content_info(StatusCode::PARTIAL_CONTENT, &headers).unwrap();
        assert!(!info.byte_range_access_supported);
    }

    #[test]
    fn falls_back_to_content_length_without_content_range() {
        // An origin without range support answers 200 with the full body.
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("4242"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        let info = parse_content_info(StatusCode::OK, &headers).unwrap();
        assert_eq!(info.content_length, 4242);
        assert!(!info.byte_range_access_supported);
    }

    #[test]
    fn unparseable_length_is_unexpected_response() {
        let mut headers = probe_headers();
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_static("bytes 0-0/*"),
        );
        assert!(matches!(
            parse_content_info(StatusCode::PARTIAL_CONTENT, &headers),
            Err(FetchError::UnexpectedResponse)
        ));

        assert!(matches!(
            parse_content_info(StatusCode::OK, &HeaderMap::new()),
            Err(FetchError::UnexpectedResponse)
        ));
    }

    #[test]
    fn error_status_is_unexpected_response() {
        assert!(matches!(
            parse_content_info(StatusCode::NOT_FOUND, &probe_headers()),
            Err(FetchError::UnexpectedResponse)
        ));
    }

    #[tokio::test]
    async fn start_is_once_only() {
        let (events, _events_rx) = mpsc::channel(1);
        let mut fetcher = RangeFetcher::new(
            Client::new(),
            Url::parse("http://127.0.0.1:9/never").unwrap(),
            FetchKind::Data,
            RequestId(1),
            FetchId(1),
            events,
        );

        assert_eq!(fetcher.state(), FetchState::Idle);
        fetcher.start(RequestRange::new(0, 10)).unwrap();
        assert_eq!(fetcher.state(), FetchState::Started);
        assert!(matches!(
            fetcher.start(RequestRange::new(0, 10)),
            Err(FetchError::AlreadyStarted)
        ));
        fetcher.cancel();
        assert_eq!(fetcher.state(), FetchState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_while_idle_is_terminal() {
        let (events, _events_rx) = mpsc::channel(1);
        let mut fetcher = RangeFetcher::new(
            Client::new(),
            Url::parse("http://127.0.0.1:9/never").unwrap(),
            FetchKind::ContentInfo,
            RequestId(2),
            FetchId(2),
            events,
        );

        fetcher.cancel();
        assert_eq!(fetcher.state(), FetchState::Cancelled);

        // No network round-trip; starting after an idle cancel is a no-op.
        fetcher.start(RequestRange::new(0, 1)).unwrap();
        assert_eq!(fetcher.state(), FetchState::Cancelled);
        fetcher.cancel();
        assert_eq!(fetcher.state(), FetchState::Cancelled);
    }
}
