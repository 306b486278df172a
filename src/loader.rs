use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    cache::CacheError,
    fetcher::FetchError,
    loader_inner::{loader_thread, LoaderContext},
    types::{ContentInfo, RequestId, RequestRange},
};

/// Capacity of the per-request chunk channel. Applies backpressure to the
/// transfer task when the consumer reads slowly.
const CHUNK_CHANNEL_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Fetch error")]
    Fetch(#[from] FetchError),
    #[error("Cache error")]
    Cache(#[from] CacheError),
    #[error("Resource loader has shut down")]
    ChannelClosed,
}

impl From<reqwest::Error> for LoadError {
    fn from(e: reqwest::Error) -> LoadError {
        LoadError::Fetch(FetchError::Transport(e))
    }
}

#[derive(Debug)]
pub(crate) enum LoadMessage {
    Metadata {
        id: RequestId,
        responder: oneshot::Sender<Result<ContentInfo, LoadError>>,
    },
    Data {
        id: RequestId,
        range: RequestRange,
        chunks: mpsc::Sender<Result<Bytes, LoadError>>,
    },
    Cancel {
        id: RequestId,
    },
}

/// Streamed response to a data request.
///
/// Chunks arrive in request order; an `Err` item is terminal and bytes
/// already yielded are best-effort. The stream ending without an `Err` is
/// successful completion. Cancelling the request simply ends the stream.
pub struct DataStream {
    id: RequestId,
    inner: ReceiverStream<Result<Bytes, LoadError>>,
}

impl DataStream {
    pub fn request_id(&self) -> RequestId {
        self.id
    }
}

impl Stream for DataStream {
    type Item = Result<Bytes, LoadError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Handle to the per-resource load coordinator.
///
/// All decision state lives in a single spawned task; the handle only sends
/// messages, so clones can be used from any task without additional locking.
#[derive(Clone, Debug)]
pub struct ResourceLoader {
    send_chan: mpsc::Sender<LoadMessage>,
}

impl ResourceLoader {
    pub(crate) fn new(ctx: LoaderContext) -> ResourceLoader {
        let (send_chan, req_chan) = mpsc::channel(1);
        tokio::spawn(loader_thread(ctx, req_chan));
        ResourceLoader { send_chan }
    }

    /// Resolve the resource's content information, from cache when known,
    /// otherwise via a 1-byte probe fetch.
    pub async fn request_metadata(&self, id: RequestId) -> Result<ContentInfo, LoadError> {
        let (responder, receiver) = oneshot::channel();

        self.send_chan
            .send(LoadMessage::Metadata { id, responder })
            .await
            .map_err(|_| LoadError::ChannelClosed)?;

        receiver.await.map_err(|_| LoadError::ChannelClosed)?
    }

    /// Request a byte range. Cached bytes are delivered immediately; any
    /// remainder streams in as it downloads.
    pub async fn request_data(
        &self,
        id: RequestId,
        range: RequestRange,
    ) -> Result<DataStream, LoadError> {
        let (chunks, receiver) = mpsc::channel(CHUNK_CHANNEL_SIZE);

        self.send_chan
            .send(LoadMessage::Data { id, range, chunks })
            .await
            .map_err(|_| LoadError::ChannelClosed)?;

        Ok(DataStream {
            id,
            inner: ReceiverStream::new(receiver),
        })
    }

    /// Cancel the in-flight fetch for `id`, if any. A no-op for unknown or
    /// already-completed requests.
    pub async fn cancel(&self, id: RequestId) -> Result<(), LoadError> {
        self.send_chan
            .send(LoadMessage::Cancel { id })
            .await
            .map_err(|_| LoadError::ChannelClosed)
    }
}
