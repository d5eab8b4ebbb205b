//! Event store and frame probe against a minimal local HTTP/1.1 server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

use drowsewatch::error::{LookupError, ResourceError};
use drowsewatch::events::gallery::{DateRange, EventGallery};
use drowsewatch::events::{EnrichmentPipeline, EventKind, EventStore, EventToken, HttpEventStore, LogCapacity, Resolution};
use drowsewatch::feed::probe::{FrameProbe, HttpFrameProbe};

#[derive(Clone)]
enum Reply {
    Full {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: Vec<u8>,
    },
    /// 200 with one body chunk and no end, like an MJPEG stream.
    Endless(Vec<u8>),
}

fn json_reply(status: u16, body: &str) -> Reply {
    Reply::Full {
        status,
        headers: vec![("Content-Type", "application/json")],
        body: body.as_bytes().to_vec(),
    }
}

/// Routes by exact request path; unknown paths get 404.
async fn serve(routes: HashMap<&'static str, Reply>) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);
    tokio::spawn(async move {
        loop {
            let Ok((mut tcp, _)) = listener.accept().await else {
                return;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut raw = Vec::new();
                let mut buf = [0u8; 1024];
                while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                    match tcp.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => raw.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&raw);
                let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let path = target.split('?').next().unwrap_or("/").to_string();
                match routes.get(path.as_str()).cloned().unwrap_or_else(|| json_reply(404, r#"{"detail":"Not Found"}"#)) {
                    Reply::Full { status, headers, body } => {
                        let mut out = format!("HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n", status, body.len());
                        for (k, v) in headers {
                            out.push_str(&format!("{}: {}\r\n", k, v));
                        }
                        out.push_str("\r\n");
                        let _ = tcp.write_all(out.as_bytes()).await;
                        let _ = tcp.write_all(&body).await;
                    }
                    Reply::Endless(chunk) => {
                        let head = "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nConnection: close\r\n\r\n";
                        let _ = tcp.write_all(head.as_bytes()).await;
                        let _ = tcp.write_all(&chunk).await;
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                }
            });
        }
    });
    Url::parse(&format!("http://{}", addr)).unwrap()
}

const EVENT_1: &str = r#"{
    "id": "evt-1",
    "event_type": "DROWSINESS",
    "vehicle_identification": "rig-07",
    "ear": 0.14,
    "mar": 0.42,
    "image": "images/evt-1.png",
    "timestamp": "2025-03-01T08:15:00.123"
}"#;

const EVENT_LIST: &str = r#"[
    {"id": "evt-2", "event_type": "YAWNING", "vehicle_identification": "rig-07",
     "ear": 0.28, "mar": 0.81, "image": "images/evt-2.png", "timestamp": "2025-03-02T09:00:00"},
    {"id": "evt-1", "event_type": "DROWSINESS", "vehicle_identification": "rig-07",
     "ear": 0.14, "mar": 0.42, "image": "images/evt-1.png", "timestamp": "2025-03-01T08:15:00.123"}
]"#;

async fn event_backend() -> Url {
    let mut routes = HashMap::new();
    routes.insert("/drowsinessevent/evt-1", json_reply(200, EVENT_1));
    routes.insert("/drowsinessevent/evt-broken", json_reply(200, r#"{"id": 3}"#));
    routes.insert("/drowsinessevent/evt-500", json_reply(500, "{}"));
    routes.insert("/drowsinessevent/", json_reply(200, EVENT_LIST));
    routes.insert(
        "/drowsinessevent/download/evt-1",
        Reply::Full {
            status: 200,
            headers: vec![
                ("Content-Type", "image/png"),
                ("Content-Disposition", r#"attachment; filename="evt-1_DROWSINESS.png""#),
            ],
            body: vec![0x89, b'P', b'N', b'G'],
        },
    );
    let base = serve(routes).await;
    base.join("/drowsinessevent").unwrap()
}

#[tokio::test]
async fn test_fetch_event_record() {
    let store = HttpEventStore::new(event_backend().await);
    let record = store.fetch("evt-1").await.unwrap();
    assert_eq!(record.id, "evt-1");
    assert_eq!(record.event_type, EventKind::Drowsy);
    assert_eq!(record.vehicle_identification, "rig-07");
    assert_eq!(
        record.occurred_at().unwrap().to_string(),
        "2025-03-01 08:15:00.123"
    );
}

#[tokio::test]
async fn test_fetch_failures_are_typed() {
    let store = HttpEventStore::new(event_backend().await);
    assert!(matches!(store.fetch("nope").await, Err(LookupError::NotFound(id)) if id == "nope"));
    assert!(matches!(store.fetch("evt-500").await, Err(LookupError::Status(500))));
    assert!(matches!(store.fetch("evt-broken").await, Err(LookupError::Decode(_))));
}

#[tokio::test]
async fn test_pipeline_over_http_logs_failures_without_placeholders() {
    let store = Arc::new(HttpEventStore::new(event_backend().await));
    let pipeline = EnrichmentPipeline::new(store, LogCapacity::MostRecent(10));

    assert_eq!(pipeline.resolve(EventToken("evt-500".into())).await, Resolution::LookupFailed);
    assert_eq!(pipeline.resolve(EventToken("evt-1".into())).await, Resolution::Inserted);
    assert_eq!(pipeline.resolve(EventToken("evt-1".into())).await, Resolution::Duplicate);
    assert_eq!(pipeline.len(), 1);
    assert!(!pipeline.contains("evt-500"));
}

#[tokio::test]
async fn test_gallery_list_filter_and_download() {
    let store = HttpEventStore::new(event_backend().await);
    let mut gallery = EventGallery::load(&store).await.unwrap();
    assert_eq!(gallery.total(), 2);

    let day = chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
    assert_eq!(gallery.apply_filter(DateRange::between(day, day)), 1);
    assert_eq!(gallery.visible()[0].id, "evt-1");

    let image = gallery.download_image(&store, "evt-1").await.unwrap();
    assert_eq!(image.file_name, "evt-1_DROWSINESS.png");
    assert_eq!(image.content_type.as_deref(), Some("image/png"));
    assert_eq!(image.bytes, vec![0x89, b'P', b'N', b'G']);

    assert!(matches!(
        gallery.download_image(&store, "evt-404").await,
        Err(LookupError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_probe_accepts_endless_stream() {
    let mut routes = HashMap::new();
    routes.insert(
        "/realtime/video/raw",
        Reply::Endless(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xff\xd8".to_vec()),
    );
    routes.insert("/realtime/video/processed", json_reply(503, "{}"));
    routes.insert(
        "/realtime/video/empty",
        Reply::Full {
            status: 200,
            headers: vec![],
            body: vec![],
        },
    );
    let base = serve(routes).await;
    let probe = HttpFrameProbe::new(Duration::from_secs(2)).unwrap();

    let raw = base.join("/realtime/video/raw?timestamp=1").unwrap();
    assert!(probe.load(&raw).await.unwrap() > 0);

    let processed = base.join("/realtime/video/processed").unwrap();
    assert!(matches!(probe.load(&processed).await, Err(ResourceError::Status(503))));

    let empty = base.join("/realtime/video/empty").unwrap();
    assert!(matches!(probe.load(&empty).await, Err(ResourceError::Empty)));
}

#[tokio::test]
async fn test_probe_unreachable_host() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let probe = HttpFrameProbe::new(Duration::from_secs(2)).unwrap();
    let url = Url::parse(&format!("http://{}/realtime/video/raw", addr)).unwrap();
    assert!(matches!(probe.load(&url).await, Err(ResourceError::Network(_))));
}
