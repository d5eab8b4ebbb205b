use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use url::Url;

use super::EventRecord;
use crate::error::LookupError;

pub const DEFAULT_IMAGE_NAME: &str = "download.png";

#[derive(Debug, Clone, PartialEq)]
pub struct EventImage {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Backend holding the full event records.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<EventRecord, LookupError>;

    async fn list(&self) -> Result<Vec<EventRecord>, LookupError>;

    async fn download_image(&self, id: &str) -> Result<EventImage, LookupError>;
}

/// `EventStore` over the backend's `/drowsinessevent` REST routes.
#[derive(Debug, Clone)]
pub struct HttpEventStore {
    client: Client,
    base: Url,
}

impl HttpEventStore {
    pub fn new(base: Url) -> Self {
        Self::with_client(Client::new(), base)
    }

    pub fn with_client(client: Client, base: Url) -> Self {
        Self { client, base }
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[async_trait]
impl EventStore for HttpEventStore {
    async fn fetch(&self, id: &str) -> Result<EventRecord, LookupError> {
        let resp = self.client.get(self.endpoint(&[id])).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => return Err(LookupError::NotFound(id.to_string())),
            s if !s.is_success() => return Err(LookupError::Status(s.as_u16())),
            _ => {}
        }
        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn list(&self) -> Result<Vec<EventRecord>, LookupError> {
        // The list route is mounted with a trailing slash.
        let resp = self.client.get(self.endpoint(&[""])).send().await?;
        if !resp.status().is_success() {
            return Err(LookupError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn download_image(&self, id: &str) -> Result<EventImage, LookupError> {
        let resp = self
            .client
            .get(self.endpoint(&["download", id]))
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => return Err(LookupError::NotFound(id.to_string())),
            s if !s.is_success() => return Err(LookupError::Status(s.as_u16())),
            _ => {}
        }
        let file_name = header_str(resp.headers(), CONTENT_DISPOSITION)
            .as_deref()
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| DEFAULT_IMAGE_NAME.to_string());
        let content_type = header_str(resp.headers(), CONTENT_TYPE);
        let bytes = resp.bytes().await?.to_vec();
        Ok(EventImage {
            file_name,
            content_type,
            bytes,
        })
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `attachment; filename="a.png"` → `a.png`.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim().trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}
