use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::error::ResourceError;

pub const CACHE_BUST_PARAM: &str = "timestamp";

/// Loads one frame of an image resource.
#[async_trait]
pub trait FrameProbe: Send + Sync {
    /// Returns the number of bytes seen.
    async fn load(&self, url: &Url) -> Result<usize, ResourceError>;
}

/// Probe over HTTP. The camera routes stream MJPEG without end, so a load
/// counts as successful once the status is 2xx and the first chunk is non-empty.
#[derive(Debug, Clone)]
pub struct HttpFrameProbe {
    client: Client,
}

impl HttpFrameProbe {
    pub fn new(timeout: Duration) -> Result<Self, ResourceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FrameProbe for HttpFrameProbe {
    async fn load(&self, url: &Url) -> Result<usize, ResourceError> {
        let mut resp = self.client.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(ResourceError::Status(resp.status().as_u16()));
        }
        match resp.chunk().await? {
            Some(chunk) if !chunk.is_empty() => Ok(chunk.len()),
            _ => Err(ResourceError::Empty),
        }
    }
}

/// Copy of `url` with a fresh `timestamp=<ms>` parameter so no cache can
/// answer the request. Other query parameters are kept.
pub fn cache_busted(url: &Url, stamp_ms: u64) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != CACHE_BUST_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut out = url.clone();
    out.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(CACHE_BUST_PARAM, &stamp_ms.to_string());
    out
}
