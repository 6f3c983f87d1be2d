use std::sync::Arc;

use super::{AdapterError, DownloadAdapter, TransferResponse};
use async_trait::async_trait;
use futures::TryStreamExt;
use headers::{ContentRange, HeaderMapExt};
use reqwest::{header::RANGE, StatusCode};
use url::Url;

type BeforeRequestFn =
    Box<dyn Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync>;

#[derive(Clone)]
#[non_exhaustive]
pub struct ReqwestAdapter {
    client: reqwest::Client,
    before_request: Arc<Option<BeforeRequestFn>>,
}

pub trait IntoReqwestAdapter {
    fn into_reqwest_adapter(self) -> ReqwestAdapter;
}

impl IntoReqwestAdapter for reqwest::Client {
    fn into_reqwest_adapter(self) -> ReqwestAdapter {
        ReqwestAdapter {
            client: self,
            before_request: Arc::new(None),
        }
    }
}

impl Default for ReqwestAdapter {
    fn default() -> Self {
        reqwest::Client::new().into_reqwest_adapter()
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status_code) = e.status() {
            return AdapterError::Status(status_code.as_u16());
        }
        AdapterError::Network(e.to_string())
    }
}

impl ReqwestAdapter {
    /// Set a hook applied to every request, e.g. to add cookies or a referer
    pub fn before_request(
        &mut self,
        f: impl Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync + 'static,
    ) {
        self.before_request = Arc::new(Some(Box::new(f)));
    }

    #[inline]
    fn apply_before_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(f) = self.before_request.as_ref() {
            f(builder)
        } else {
            builder
        }
    }
}

#[async_trait]
impl DownloadAdapter for ReqwestAdapter {
    async fn open(&self, url: &Url, offset: u64) -> Result<TransferResponse, AdapterError> {
        let mut builder = self.client.get(url.clone());
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", offset));
        }
        let response = self.apply_before_request(builder).send().await?;
        let content_range = response.headers().typed_get::<ContentRange>();

        match response.status() {
            // the partial file already holds the whole content
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                let total = content_range.and_then(|r| r.bytes_len());
                if total == Some(offset) {
                    log::debug!("range {}- of {} is already complete", offset, url);
                    Ok(TransferResponse::empty(offset, total))
                } else {
                    Err(AdapterError::Status(StatusCode::RANGE_NOT_SATISFIABLE.as_u16()))
                }
            }
            StatusCode::PARTIAL_CONTENT => {
                let start = content_range
                    .as_ref()
                    .and_then(|r| r.bytes_range())
                    .map(|(start, _)| start)
                    .unwrap_or(offset);
                let total = content_range.and_then(|r| r.bytes_len());
                Ok(TransferResponse {
                    offset: start,
                    total,
                    stream: Box::pin(response.bytes_stream().map_err(AdapterError::from)),
                })
            }
            _ => {
                let response = response.error_for_status()?;
                if offset > 0 {
                    log::debug!("{} ignored the range request, restart from 0", url);
                }
                Ok(TransferResponse {
                    offset: 0,
                    total: response.content_length(),
                    stream: Box::pin(response.bytes_stream().map_err(AdapterError::from)),
                })
            }
        }
    }
}
