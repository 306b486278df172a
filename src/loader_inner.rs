use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use reqwest::{Client, Url};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::{
    cache::{AssetCache, MergeOutcome},
    fetcher::{FetchEvent, FetchKind, FetchNotice, RangeFetcher},
    loader::{LoadError, LoadMessage},
    types::{CachedResource, ContentInfo, FetchId, RequestId, RequestRange},
};

const EVENT_CHANNEL_SIZE: usize = 32;

/// Everything the loader task needs to satisfy requests for one resource.
pub(crate) struct LoaderContext {
    pub url: Url,
    pub cache_key: String,
    pub cache: Arc<dyn AssetCache>,
    pub http: Client,
}

/// How a data request splits between cache and network.
#[derive(Debug, PartialEq, Eq)]
enum DataPlan {
    /// Entirely satisfiable from the cached prefix.
    Cached(Vec<u8>),
    /// Prefix overlap: respond with `cached` now, fetch the remainder.
    CachedThenFetch {
        cached: Vec<u8>,
        fetch: RequestRange,
    },
    /// No usable cached bytes; fetch the full requested range.
    Fetch(RequestRange),
}

/// Classify a data request against the cached prefix.
///
/// A `ToEnd` range only counts as a full hit when the content length is
/// known. When `start` lies beyond the cached prefix there is no usable
/// overlap and the whole requested range is fetched; otherwise the cached
/// part is served immediately and the fetch resumes from the prefix end.
fn plan_data_request(resource: Option<&CachedResource>, range: RequestRange) -> DataPlan {
    // An empty interval has no valid Range header form; answer it with an
    // empty stream instead of fetching.
    if range.is_empty() {
        return DataPlan::Cached(Vec::new());
    }

    let resource = match resource {
        Some(resource) => resource,
        None => return DataPlan::Fetch(range),
    };

    let cached_len = resource.media_len();
    let resolved_end = range.resolved_end(resource.info.as_ref());

    if let Some(end) = resolved_end {
        if cached_len >= end {
            let start = range.start.min(end);
            return DataPlan::Cached(resource.media_data[start as usize..end as usize].to_vec());
        }
    }

    if cached_len > 0 && range.start < cached_len {
        let sub_end = match resolved_end {
            Some(end) => end.min(cached_len),
            None => cached_len,
        };
        return DataPlan::CachedThenFetch {
            cached: resource.media_data[range.start as usize..sub_end as usize].to_vec(),
            fetch: RequestRange {
                start: cached_len,
                end: range.end,
            },
        };
    }

    DataPlan::Fetch(range)
}

enum Reply {
    Metadata(oneshot::Sender<Result<ContentInfo, LoadError>>),
    Data(mpsc::Sender<Result<Bytes, LoadError>>),
}

struct PendingFetch {
    fetch_id: FetchId,
    fetch_start: u64,
    fetcher: RangeFetcher,
    reply: Reply,
}

struct LoaderState {
    ctx: LoaderContext,
    event_tx: mpsc::Sender<FetchNotice>,
    pending: HashMap<RequestId, PendingFetch>,
    next_fetch_id: u64,
}

/// Per-resource coordinator task. Owns the request-tracking map and all
/// cache decisions; requests and fetch events are funneled through this one
/// task, so no two of them can race over shared state.
pub(crate) async fn loader_thread(ctx: LoaderContext, mut req_chan: mpsc::Receiver<LoadMessage>) {
    let (event_tx, mut event_chan) = mpsc::channel(EVENT_CHANNEL_SIZE);

    let mut state = LoaderState {
        ctx,
        event_tx,
        pending: HashMap::new(),
        next_fetch_id: 0,
    };

    loop {
        tokio::select! {
            biased;

            notice = event_chan.recv() => {
                // The loader holds an event sender, so this arm never sees None.
                if let Some(notice) = notice {
                    state.handle_event(notice).await;
                }
            }
            message = req_chan.recv() => {
                match message {
                    Some(message) => state.handle_message(message).await,
                    None => break,
                }
            }
        }
    }

    trace!(key = %state.ctx.cache_key, "closing loader thread");
    for (_, mut pending) in state.pending.drain() {
        pending.fetcher.cancel();
    }
}

impl LoaderState {
    async fn handle_message(&mut self, message: LoadMessage) {
        match message {
            LoadMessage::Metadata { id, responder } => {
                self.handle_metadata_request(id, responder).await;
            }
            LoadMessage::Data { id, range, chunks } => {
                self.handle_data_request(id, range, chunks).await;
            }
            LoadMessage::Cancel { id } => {
                self.cancel_pending(id);
            }
        }
    }

    async fn handle_metadata_request(
        &mut self,
        id: RequestId,
        responder: oneshot::Sender<Result<ContentInfo, LoadError>>,
    ) {
        match self.ctx.cache.get(&self.ctx.cache_key).await {
            Ok(Some(resource)) => {
                if let Some(info) = resource.info {
                    trace!(%id, "content info served from cache");
                    let _ = responder.send(Ok(info));
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                let _ = responder.send(Err(e.into()));
                return;
            }
        }

        // No cached metadata; probe the first byte for its headers.
        let probe = RequestRange::new(0, 1);
        self.start_fetch(id, probe, FetchKind::ContentInfo, Reply::Metadata(responder));
    }

    async fn handle_data_request(
        &mut self,
        id: RequestId,
        range: RequestRange,
        chunks: mpsc::Sender<Result<Bytes, LoadError>>,
    ) {
        let resource = match self.ctx.cache.get(&self.ctx.cache_key).await {
            Ok(resource) => resource,
            Err(e) => {
                let _ = chunks.send(Err(e.into())).await;
                return;
            }
        };

        match plan_data_request(resource.as_ref(), range) {
            DataPlan::Cached(data) => {
                trace!(%id, %range, len = data.len(), "full cache hit");
                if !data.is_empty() {
                    let _ = chunks.send(Ok(Bytes::from(data))).await;
                }
                // Dropping the sender completes the stream.
            }
            DataPlan::CachedThenFetch { cached, fetch } => {
                trace!(%id, %range, cached_len = cached.len(), %fetch, "partial cache hit");
                if !cached.is_empty() {
                    let _ = chunks.send(Ok(Bytes::from(cached))).await;
                }
                self.start_fetch(id, fetch, FetchKind::Data, Reply::Data(chunks));
            }
            DataPlan::Fetch(fetch) => {
                trace!(%id, %fetch, "cache miss");
                self.start_fetch(id, fetch, FetchKind::Data, Reply::Data(chunks));
            }
        }
    }

    /// Create, track and start a fetcher for `id`, cancelling and replacing
    /// any fetch already in flight for the same identity.
    fn start_fetch(&mut self, id: RequestId, range: RequestRange, kind: FetchKind, reply: Reply) {
        self.cancel_pending(id);

        self.next_fetch_id += 1;
        let fetch_id = FetchId(self.next_fetch_id);

        let mut fetcher = RangeFetcher::new(
            self.ctx.http.clone(),
            self.ctx.url.clone(),
            kind,
            id,
            fetch_id,
            self.event_tx.clone(),
        );

        if let Err(e) = fetcher.start(range) {
            // Freshly constructed fetchers only fail on misuse; surface it
            // rather than leaving the request hanging.
            match reply {
                Reply::Metadata(responder) => {
                    let _ = responder.send(Err(e.into()));
                }
                Reply::Data(chunks) => {
                    let _ = chunks.try_send(Err(e.into()));
                }
            }
            return;
        }

        self.pending.insert(
            id,
            PendingFetch {
                fetch_id,
                fetch_start: range.start,
                fetcher,
                reply,
            },
        );
    }

    fn cancel_pending(&mut self, id: RequestId) {
        if let Some(mut pending) = self.pending.remove(&id) {
            debug!(%id, "cancelling in-flight fetch");
            pending.fetcher.cancel();
        }
    }

    /// True when the notice belongs to the fetch currently tracked for its
    /// request. Stale notices (from a cancelled or replaced fetch) must be
    /// dropped without touching any state.
    fn is_current(&self, notice: &FetchNotice) -> bool {
        self.pending
            .get(&notice.request_id)
            .map(|p| p.fetch_id == notice.fetch_id)
            .unwrap_or(false)
    }

    async fn handle_event(&mut self, notice: FetchNotice) {
        if !self.is_current(&notice) {
            trace!(id = %notice.request_id, "discarding stale fetch event");
            return;
        }
        let id = notice.request_id;

        match notice.event {
            FetchEvent::Chunk(bytes) => {
                let dropped = match &self.pending.get(&id).unwrap().reply {
                    Reply::Data(chunks) => chunks.send(Ok(bytes)).await.is_err(),
                    // Metadata fetches never stream chunks.
                    Reply::Metadata(_) => false,
                };
                if dropped {
                    // Consumer went away; stop paying for the download.
                    self.cancel_pending(id);
                }
            }
            FetchEvent::Metadata(result) => {
                let pending = self.pending.remove(&id).unwrap();
                let responder = match pending.reply {
                    Reply::Metadata(responder) => responder,
                    Reply::Data(_) => return,
                };

                match result {
                    Ok(info) => {
                        if let Err(e) = self
                            .ctx
                            .cache
                            .set_metadata(&self.ctx.cache_key, &info)
                            .await
                        {
                            warn!(key = %self.ctx.cache_key, error = %e, "failed to persist content info");
                        }
                        let _ = responder.send(Ok(info));
                    }
                    Err(e) => {
                        let _ = responder.send(Err(e.into()));
                    }
                }
            }
            FetchEvent::Complete { error, downloaded } => {
                let pending = self.pending.remove(&id).unwrap();

                if !downloaded.is_empty() {
                    match self
                        .ctx
                        .cache
                        .merge_append(&self.ctx.cache_key, pending.fetch_start, &downloaded)
                        .await
                    {
                        Ok(MergeOutcome::Accepted { new_len }) => {
                            debug!(key = %self.ctx.cache_key, new_len, "cached prefix extended");
                        }
                        Ok(MergeOutcome::Rejected) => {}
                        Err(e) => {
                            warn!(key = %self.ctx.cache_key, error = %e, "cache merge failed");
                        }
                    }
                }

                if let Reply::Data(chunks) = pending.reply {
                    if let Some(e) = error {
                        let _ = chunks.send(Err(e.into())).await;
                    }
                    // Dropping the sender ends the stream.
                }
            }
        }
    }
}
