//! Composition root: one metric buffer, one event log and two camera feeds,
//! each fed by its own source and torn down together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use crate::buffer::{MetricBuffer, MetricSample, MetricWindow};
use crate::channel::{ChannelHandle, ChannelManager, ChannelState, ChannelStatus, StateChange};
use crate::config::{Config, ReconnectMode};
use crate::error::ConfigError;
use crate::events::{EnrichmentPipeline, EventRecord, EventStore, EventToken};
use crate::feed::probe::FrameProbe;
use crate::feed::{FeedConfig, FeedHandle, FeedMonitor, FeedState};
use crate::lock;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

pub const METRICS_TOPIC: &str = "metrics";
pub const NOTIFICATIONS_TOPIC: &str = "notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Raw,
    Processed,
}

#[derive(Debug, Clone)]
pub struct DashboardSnapshot {
    pub metrics: Vec<MetricSample>,
    pub events: Vec<EventRecord>,
    pub metrics_channel: ChannelStatus,
    pub notifications_channel: ChannelStatus,
    pub raw_feed: FeedState,
    pub processed_feed: FeedState,
    /// Connections lost or refused since start, across both channels.
    pub channel_losses: u64,
}

impl DashboardSnapshot {
    /// Flat fields for a periodic status line.
    pub fn summary(&self) -> Map<String, Value> {
        let window = MetricWindow::new(&self.metrics);
        let mut fields = obj(&[
            ("samples", json!(self.metrics.len())),
            ("events", json!(self.events.len())),
            ("metrics_channel", v_str(self.metrics_channel.state.as_str())),
            ("notifications_channel", v_str(self.notifications_channel.state.as_str())),
            ("raw_feed", v_str(self.raw_feed.liveness.as_str())),
            ("processed_feed", v_str(self.processed_feed.liveness.as_str())),
            ("channel_losses", json!(self.channel_losses)),
        ]);
        if let Some(ear) = window.mean_ear() {
            fields.insert("mean_ear".into(), v_num(ear));
        }
        if let Some(ratio) = window.drowsy_ratio() {
            fields.insert("drowsy_ratio".into(), v_num(ratio));
        }
        if let Some(latest) = self.events.first() {
            fields.insert("latest_event".into(), v_str(&latest.id));
        }
        fields
    }
}

pub struct Dashboard<S: ?Sized> {
    channels: ChannelManager,
    metrics: Arc<Mutex<MetricBuffer>>,
    pipeline: EnrichmentPipeline<S>,
    metrics_channel: ChannelHandle,
    notifications_channel: ChannelHandle,
    raw_feed: FeedHandle,
    processed_feed: FeedHandle,
    channel_losses: Arc<AtomicU64>,
}

/// Count and report every connection the backend dropped or refused. Whether
/// the channel comes back is up to the reconnect policy chosen at startup.
fn watch_channel(losses: Arc<AtomicU64>, reconnects: bool) -> impl FnMut(StateChange) + Send + 'static {
    move |change: StateChange| {
        if change.to != ChannelState::Disconnected {
            return;
        }
        let Some(error) = change.error else {
            return;
        };
        let total = losses.fetch_add(1, Ordering::SeqCst) + 1;
        log(
            Level::Warn,
            Domain::System,
            "channel_lost",
            obj(&[
                ("topic", v_str(&change.topic)),
                ("msg", v_str(&error)),
                ("losses", json!(total)),
                ("reconnects", json!(reconnects)),
            ]),
        );
    }
}

impl<S: EventStore + ?Sized + 'static> Dashboard<S> {
    /// Open both channels and start both feed monitors. Must be called inside
    /// a tokio runtime.
    pub fn start<P>(config: &Config, store: Arc<S>, probe: Arc<P>) -> Result<Self, ConfigError>
    where
        P: FrameProbe + ?Sized + 'static,
    {
        Self::start_seeded(config, store, probe, Vec::new())
    }

    /// Like [`Dashboard::start`], with `history` (oldest first) placed in the
    /// event log before any notification can arrive.
    pub fn start_seeded<P>(
        config: &Config,
        store: Arc<S>,
        probe: Arc<P>,
        history: Vec<EventRecord>,
    ) -> Result<Self, ConfigError>
    where
        P: FrameProbe + ?Sized + 'static,
    {
        config.validate()?;
        let metrics_url = config.metrics_endpoint()?;
        let notifications_url = config.notifications_endpoint()?;
        let raw_url = config.raw_feed_url()?;
        let processed_url = config.processed_feed_url()?;

        let pipeline = EnrichmentPipeline::new(store, config.log_capacity());
        let seeded = pipeline.seed(history);

        let metrics = Arc::new(Mutex::new(MetricBuffer::new(config.metric_capacity)));
        let mut channels = ChannelManager::with_policy(config.reconnect_policy());
        let channel_losses = Arc::new(AtomicU64::new(0));
        let reconnects = config.reconnect == ReconnectMode::Backoff;

        let buffer = metrics.clone();
        let metrics_channel = channels.open(
            METRICS_TOPIC,
            metrics_url,
            move |sample: MetricSample| lock(&buffer).push(sample),
            watch_channel(channel_losses.clone(), reconnects),
        );

        let sink = pipeline.clone();
        let notifications_channel = channels.open(
            NOTIFICATIONS_TOPIC,
            notifications_url,
            move |token: EventToken| {
                sink.handle_token(token);
            },
            watch_channel(channel_losses.clone(), reconnects),
        );

        let feed = |name: &str, primary| FeedConfig {
            name: name.to_string(),
            primary,
            fallback: config.feed_fallback.clone(),
            refresh_interval: config.feed_refresh(),
            probe_interval: config.feed_probe(),
        };
        let raw_feed = FeedMonitor::new(feed("raw", raw_url), probe.clone()).spawn();
        let processed_feed = FeedMonitor::new(feed("processed", processed_url), probe).spawn();

        log(
            Level::Info,
            Domain::System,
            "dashboard_started",
            obj(&[
                ("api_base", v_str(&config.api_base)),
                ("ws_base", v_str(&config.ws_base)),
                ("metric_capacity", json!(config.metric_capacity)),
                ("seeded_events", json!(seeded)),
            ]),
        );

        Ok(Self {
            channels,
            metrics,
            pipeline,
            metrics_channel,
            notifications_channel,
            raw_feed,
            processed_feed,
            channel_losses,
        })
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            metrics: lock(&self.metrics).snapshot(),
            events: self.pipeline.snapshot(),
            metrics_channel: self.metrics_channel.status(),
            notifications_channel: self.notifications_channel.status(),
            raw_feed: self.raw_feed.snapshot(),
            processed_feed: self.processed_feed.snapshot(),
            channel_losses: self.channel_losses.load(Ordering::SeqCst),
        }
    }

    pub fn pipeline(&self) -> &EnrichmentPipeline<S> {
        &self.pipeline
    }

    pub fn feed(&self, kind: FeedKind) -> &FeedHandle {
        match kind {
            FeedKind::Raw => &self.raw_feed,
            FeedKind::Processed => &self.processed_feed,
        }
    }

    /// The view could not render the current frame of `kind`.
    pub fn report_feed_failure(&self, kind: FeedKind, reason: &str) {
        self.feed(kind).report_load_failure(reason);
    }

    /// Close both channels, stop both feeds and ignore lookups still in flight.
    pub async fn dispose(&mut self) {
        self.channels.close_all().await;
        self.pipeline.dispose();
        self.raw_feed.dispose();
        self.processed_feed.dispose();
        log(Level::Info, Domain::System, "dashboard_disposed", obj(&[]));
    }
}
