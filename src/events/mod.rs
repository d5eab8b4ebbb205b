//! Event notifications: bare identifiers arrive over the notification channel,
//! are resolved into full records through an [`EventStore`], deduplicated by id
//! and kept newest-first.

pub mod gallery;
pub mod store;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::channel::frame::Frame;
use crate::error::FrameError;
use crate::lock;
use crate::logging::{log, log_lookup_failed, obj, v_str, Domain, Level};
pub use store::{EventImage, EventStore, HttpEventStore};

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Drowsy,
    Yawning,
    Other(String),
}

impl From<String> for EventKind {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "drowsy" | "drowsiness" => EventKind::Drowsy,
            "yawning" | "yawn" => EventKind::Yawning,
            _ => EventKind::Other(raw),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Drowsy => "DROWSINESS".to_string(),
            EventKind::Yawning => "YAWNING".to_string(),
            EventKind::Other(raw) => raw,
        }
    }
}

impl EventKind {
    pub fn label(&self) -> &str {
        match self {
            EventKind::Drowsy => "drowsy",
            EventKind::Yawning => "yawning",
            EventKind::Other(raw) => raw,
        }
    }
}

/// A resolved detection event. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub event_type: EventKind,
    pub vehicle_identification: String,
    pub ear: f64,
    pub mar: f64,
    pub image: String,
    /// As sent by the backend.
    pub timestamp: String,
}

impl EventRecord {
    /// Remote timestamp, naive ISO-8601 or RFC 3339 (converted to UTC).
    pub fn occurred_at(&self) -> Option<NaiveDateTime> {
        parse_remote_timestamp(&self.timestamp)
    }
}

pub fn parse_remote_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Bare identifier received over the notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventToken(pub String);

impl EventToken {
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl Frame for EventToken {
    fn decode(text: &str, _received_at: DateTime<Utc>) -> Result<Self, FrameError> {
        let id: String = serde_json::from_str(text)?;
        let id = id.trim();
        if id.is_empty() {
            return Err(FrameError::EmptyToken);
        }
        Ok(EventToken(id.to_string()))
    }
}

// =============================================================================
// Log
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCapacity {
    Unbounded,
    /// Keep the K most recent; zero is treated as one.
    MostRecent(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted { evicted: Option<EventRecord> },
    Duplicate,
}

/// Newest-first event log with at most one record per id.
#[derive(Debug, Clone)]
pub struct EventLog {
    records: VecDeque<EventRecord>,
    index: HashSet<String>,
    capacity: LogCapacity,
}

impl EventLog {
    pub fn new(capacity: LogCapacity) -> Self {
        let capacity = match capacity {
            LogCapacity::MostRecent(0) => LogCapacity::MostRecent(1),
            other => other,
        };
        Self {
            records: VecDeque::new(),
            index: HashSet::new(),
            capacity,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Insert at the head unless a record with the same id is present.
    pub fn insert_if_absent(&mut self, record: EventRecord) -> InsertOutcome {
        if self.index.contains(&record.id) {
            return InsertOutcome::Duplicate;
        }
        self.index.insert(record.id.clone());
        self.records.push_front(record);

        let evicted = match self.capacity {
            LogCapacity::MostRecent(k) if self.records.len() > k => self.records.pop_back(),
            _ => None,
        };
        if let Some(old) = &evicted {
            self.index.remove(&old.id);
        }
        InsertOutcome::Inserted { evicted }
    }

    pub fn get(&self, id: &str) -> Option<&EventRecord> {
        if !self.contains(id) {
            return None;
        }
        self.records.iter().find(|r| r.id == id)
    }

    /// Newest first.
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> LogCapacity {
        self.capacity
    }
}

// =============================================================================
// Enrichment pipeline
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Inserted,
    /// Already in the log when the token arrived.
    Duplicate,
    /// A lookup for the same id is still running; it is repeated once if it
    /// fails.
    InFlight,
    /// Lookup succeeded but the id was inserted meanwhile.
    AlreadyPresent,
    LookupFailed,
    /// Pipeline was disposed; the token or result was dropped.
    Discarded,
}

#[derive(Debug)]
struct PipelineState {
    log: EventLog,
    /// Running lookups, with the number of tokens coalesced into each since
    /// it started.
    in_flight: HashMap<String, u32>,
    disposed: bool,
}

pub struct EnrichmentPipeline<S: ?Sized> {
    store: Arc<S>,
    state: Arc<Mutex<PipelineState>>,
}

impl<S: ?Sized> Clone for EnrichmentPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: EventStore + ?Sized + 'static> EnrichmentPipeline<S> {
    pub fn new(store: Arc<S>, capacity: LogCapacity) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(PipelineState {
                log: EventLog::new(capacity),
                in_flight: HashMap::new(),
                disposed: false,
            })),
        }
    }

    /// Resolve `token` on a separate task so the caller is never blocked.
    pub fn handle_token(&self, token: EventToken) -> JoinHandle<Resolution> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.resolve(token).await })
    }

    pub async fn resolve(&self, token: EventToken) -> Resolution {
        let id = token.0;
        {
            let mut state = lock(&self.state);
            if state.disposed {
                return Resolution::Discarded;
            }
            if state.log.contains(&id) {
                log(
                    Level::Debug,
                    Domain::Events,
                    "duplicate_token",
                    obj(&[("event_id", v_str(&id))]),
                );
                return Resolution::Duplicate;
            }
            if let Some(waiting) = state.in_flight.get_mut(&id) {
                *waiting += 1;
                return Resolution::InFlight;
            }
            state.in_flight.insert(id.clone(), 0);
        }

        loop {
            let fetched = self.store.fetch(&id).await;

            let mut state = lock(&self.state);
            if state.disposed {
                state.in_flight.remove(&id);
                return Resolution::Discarded;
            }
            let reason = match fetched {
                Ok(record) if record.id == id => {
                    state.in_flight.remove(&id);
                    return insert_resolved(&mut state, record);
                }
                Ok(record) => format!("lookup returned record {}", record.id),
                Err(err) => err.to_string(),
            };
            log_lookup_failed(&id, &reason);

            // Tokens that arrived during the failed lookup get one more.
            let waiting = state.in_flight.get(&id).copied().unwrap_or(0);
            if waiting == 0 {
                state.in_flight.remove(&id);
                return Resolution::LookupFailed;
            }
            state.in_flight.insert(id.clone(), 0);
            log(
                Level::Info,
                Domain::Events,
                "lookup_repeated",
                obj(&[("event_id", v_str(&id)), ("coalesced", json!(waiting))]),
            );
        }
    }

    /// Preload known history. Each record goes to the head in iteration order,
    /// so pass oldest first. Returns how many records were new.
    pub fn seed(&self, records: impl IntoIterator<Item = EventRecord>) -> usize {
        let mut state = lock(&self.state);
        if state.disposed {
            return 0;
        }
        records
            .into_iter()
            .filter(|r| matches!(state.log.insert_if_absent(r.clone()), InsertOutcome::Inserted { .. }))
            .count()
    }

    /// Newest first.
    pub fn snapshot(&self) -> Vec<EventRecord> {
        lock(&self.state).log.snapshot()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).log.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).log.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.state).log.contains(id)
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    /// Stop accepting tokens; lookups still running are left to finish and
    /// their results are dropped.
    pub fn dispose(&self) {
        let mut state = lock(&self.state);
        if !state.disposed {
            state.disposed = true;
            log(
                Level::Info,
                Domain::Events,
                "disposed",
                obj(&[("pending_lookups", json!(state.in_flight.len()))]),
            );
        }
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.state).disposed
    }
}

/// Insert under the pipeline lock; the id may have arrived by another path
/// while its lookup was pending.
fn insert_resolved(state: &mut PipelineState, record: EventRecord) -> Resolution {
    let id = record.id.clone();
    let kind = record.event_type.label().to_string();
    match state.log.insert_if_absent(record) {
        InsertOutcome::Inserted { evicted } => {
            log(
                Level::Info,
                Domain::Events,
                "inserted",
                obj(&[
                    ("event_id", v_str(&id)),
                    ("kind", v_str(&kind)),
                    ("log_len", json!(state.log.len())),
                    (
                        "evicted",
                        evicted.map(|r| v_str(&r.id)).unwrap_or(serde_json::Value::Null),
                    ),
                ]),
            );
            Resolution::Inserted
        }
        InsertOutcome::Duplicate => Resolution::AlreadyPresent,
    }
}
