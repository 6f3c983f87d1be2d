use std::{pin::Pin, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use url::Url;

#[cfg(feature = "reqwest")]
mod reqwest;

#[cfg(feature = "reqwest")]
pub use self::reqwest::*;

pub type AnyStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;
pub type AnyBytesStream = AnyStream<Result<Bytes, AdapterError>>;
pub type AnyAdapter = Arc<dyn DownloadAdapter>;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("unexpected status code: {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An opened content stream
pub struct TransferResponse {
    /// the byte position the stream starts at.
    /// It is 0 when the source ignored the requested offset.
    pub offset: u64,
    /// the size of the full content, if known
    pub total: Option<u64>,
    pub stream: AnyBytesStream,
}

impl TransferResponse {
    /// a response carrying no bytes, used when the partial file is already complete
    pub fn empty(offset: u64, total: Option<u64>) -> Self {
        Self {
            offset,
            total,
            stream: Box::pin(futures::stream::empty()),
        }
    }
}

impl std::fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferResponse")
            .field("offset", &self.offset)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

/// The source of the bytes of a task
#[async_trait]
pub trait DownloadAdapter: Send + Sync {
    /// Open a content stream starting at `offset`.
    /// Note: the range is followed as [offset, end)
    async fn open(&self, url: &Url, offset: u64) -> Result<TransferResponse, AdapterError>;
}
