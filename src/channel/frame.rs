use chrono::{DateTime, Utc};
use tokio_tungstenite::tungstenite::Message;

use crate::error::FrameError;
use crate::logging::preview;

/// Domain data carried by one inbound frame of a topic.
pub trait Frame: Sized + Send + 'static {
    /// `received_at` is the local arrival time; remote clocks are not trusted.
    fn decode(text: &str, received_at: DateTime<Utc>) -> Result<Self, FrameError>;
}

#[derive(Debug)]
pub enum Inbound<F> {
    Frame(F),
    Invalid { error: FrameError, preview: String },
    /// Remote sent a close frame.
    Closed,
    /// Ping, pong or raw frames; the transport answers pings itself.
    Control,
}

const PREVIEW_CHARS: usize = 120;

pub fn classify<F: Frame>(msg: Message, received_at: DateTime<Utc>) -> Inbound<F> {
    match msg {
        Message::Text(text) => decode_text(&text, received_at),
        Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
            Ok(text) => decode_text(text, received_at),
            Err(_) => Inbound::Invalid {
                error: FrameError::NotUtf8,
                preview: format!("<{} bytes>", bytes.len()),
            },
        },
        Message::Close(_) => Inbound::Closed,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Inbound::Control,
    }
}

fn decode_text<F: Frame>(text: &str, received_at: DateTime<Utc>) -> Inbound<F> {
    match F::decode(text, received_at) {
        Ok(frame) => Inbound::Frame(frame),
        Err(error) => Inbound::Invalid {
            error,
            preview: preview(text, PREVIEW_CHARS),
        },
    }
}
