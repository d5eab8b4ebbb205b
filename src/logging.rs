//! Structured JSON-lines logging for the telemetry sync layer.
//!
//! Every record is one JSON object on stdout:
//! `{ts, run_id, seq, lvl, component, event, msg, data}`.
//! `LOG_LEVEL` sets the minimum level, `LOG_DOMAINS` limits the components
//! (comma-separated or `all`), and `LOG_DIR` additionally appends records to
//! `<LOG_DIR>/<run_id>/events.jsonl`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            _ => None,
        }
    }

    pub fn from_env() -> Self {
        std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|v| Level::parse(&v))
            .unwrap_or(Level::Info)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

// =============================================================================
// Log Domains (one per component)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Channel, // Connection lifecycle, frame decoding
    Metrics, // Time-series buffer
    Events,  // Token enrichment, dedup, event log
    Feed,    // Image feed liveness
    Gallery, // Event list, filtering, downloads
    System,  // Startup, shutdown, snapshots
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Channel => "channel",
            Domain::Metrics => "metrics",
            Domain::Events => "events",
            Domain::Feed => "feed",
            Domain::Gallery => "gallery",
            Domain::System => "system",
        }
    }

    fn enabled_in(&self, filter: Option<&str>) -> bool {
        match filter {
            None | Some("all") => true,
            Some(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    min_level: Level,
    /// `LOG_DOMAINS` as read at startup.
    domains: Option<String>,
    sink: Option<Mutex<BufWriter<File>>>,
}

impl RunContext {
    fn accepts(&self, level: Level, domain: Domain) -> bool {
        level >= self.min_level && domain.enabled_in(self.domains.as_deref())
    }
}

fn open_sink(base: &str, run_id: &str) -> Option<Mutex<BufWriter<File>>> {
    let mut run_dir = PathBuf::from(base);
    run_dir.push(run_id);
    if let Err(err) = create_dir_all(&run_dir) {
        eprintln!("[log] failed to create run dir: {}", err);
        return None;
    }
    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(run_dir.join("events.jsonl"))
    {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to open events log: {}", err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let sink = std::env::var("LOG_DIR")
            .ok()
            .and_then(|base| open_sink(&base, &run_id));
        RunContext {
            run_id,
            min_level: Level::from_env(),
            domains: std::env::var("LOG_DOMAINS").ok(),
            sink,
        }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["topic", "event_id", "feed", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    if !ctx.accepts(level, domain) {
        return;
    }
    let line = render_record(&ctx.run_id, level, domain, event, fields);
    if let Some(sink) = &ctx.sink {
        if let Ok(mut w) = sink.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
    println!("{}", line);
}

fn render_record(
    run_id: &str,
    level: Level,
    domain: Domain,
    event: &str,
    fields: Map<String, Value>,
) -> String {
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(run_id));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(domain.as_str()));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));
    Value::Object(entry).to_string()
}

// =============================================================================
// Component helpers
// =============================================================================

pub fn log_channel_transition(topic: &str, from: &str, to: &str, error: Option<&str>) {
    let level = if error.is_some() { Level::Warn } else { Level::Info };
    log(
        level,
        Domain::Channel,
        "state",
        obj(&[
            ("topic", v_str(topic)),
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("error", error.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_frame_dropped(topic: &str, reason: &str, preview: &str) {
    log(
        Level::Warn,
        Domain::Channel,
        "frame_dropped",
        obj(&[
            ("topic", v_str(topic)),
            ("msg", v_str(reason)),
            ("preview", v_str(preview)),
        ]),
    );
}

pub fn log_lookup_failed(event_id: &str, reason: &str) {
    log(
        Level::Warn,
        Domain::Events,
        "lookup_failed",
        obj(&[("event_id", v_str(event_id)), ("msg", v_str(reason))]),
    );
}

pub fn log_feed_transition(feed: &str, from: &str, to: &str, reason: Option<&str>) {
    let level = if to == "unreachable" { Level::Warn } else { Level::Info };
    log(
        level,
        Domain::Feed,
        "liveness",
        obj(&[
            ("feed", v_str(feed)),
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("msg", reason.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

// =============================================================================
// Value helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Truncate a payload for log previews without splitting a character.
pub fn preview(raw: &str, max_chars: usize) -> String {
    if raw.chars().count() <= max_chars {
        return raw.to_string();
    }
    let mut out: String = raw.chars().take(max_chars).collect();
    out.push('…');
    out
}

// =============================================================================
// Tests
// =============================================================================
