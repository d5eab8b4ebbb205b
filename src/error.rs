//! Error taxonomy for the sync layer.
//!
//! None of these escalate past the component that produced them: transport and
//! resource errors become observable state, frame and lookup errors are logged
//! and the offending message is dropped.

use thiserror::Error;

/// A streaming connection could not be established or was lost.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("connection dropped: {0}")]
    Dropped(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("remote closed the connection")]
    RemoteClosed,

    #[error("stream ended")]
    StreamEnded,
}

/// An inbound frame could not be decoded into domain data.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary frame is not utf-8")]
    NotUtf8,

    #[error("empty event identifier")]
    EmptyToken,

    #[error("metric out of range: {0}")]
    OutOfRange(&'static str),
}

/// Resolving an event identifier into a record failed.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("event {0} not found")]
    NotFound(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid event payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// An image resource could not be loaded.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("unexpected status {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("empty response body")]
    Empty,
}

/// Invalid runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: invalid url: {source}")]
    Url {
        key: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("{key}: unsupported scheme {scheme:?}")]
    Scheme { key: &'static str, scheme: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_readable() {
        assert_eq!(
            LookupError::NotFound("evt-1".into()).to_string(),
            "event evt-1 not found"
        );
        assert_eq!(ResourceError::Status(503).to_string(), "unexpected status 503");
        assert_eq!(
            ConfigError::Zero("FEED_PROBE_MS").to_string(),
            "FEED_PROBE_MS must be greater than zero"
        );
    }

    #[test]
    fn test_frame_error_from_json() {
        let err: FrameError = serde_json::from_str::<String>("{").unwrap_err().into();
        assert!(matches!(err, FrameError::Json(_)));
    }
}
