//! Liveness of a polled camera frame source.
//!
//! While live, the primary resource is reloaded every refresh interval with a
//! cache-busting parameter. Any failed load (a refresh or one reported by the
//! view) switches the display to the fallback at once; from then on the primary
//! is probed out-of-band every probe interval until a load succeeds.

pub mod probe;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use url::Url;

use crate::lock;
use crate::logging::{log, log_feed_transition, obj, ts_epoch_ms, v_str, Domain, Level};
use probe::{cache_busted, FrameProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live,
    Unreachable,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Live => "live",
            Liveness::Unreachable => "unreachable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplaySource {
    Primary(Url),
    Fallback(String),
}

impl DisplaySource {
    pub fn is_fallback(&self) -> bool {
        matches!(self, DisplaySource::Fallback(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedState {
    pub liveness: Liveness,
    pub display: DisplaySource,
    pub last_success: Option<DateTime<Utc>>,
    pub probe_in_flight: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl FeedState {
    fn new(primary: Url) -> Self {
        Self {
            liveness: Liveness::Live,
            display: DisplaySource::Primary(primary),
            last_success: None,
            probe_in_flight: false,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    fn record_success(&mut self, shown: Url, at: DateTime<Utc>) -> Option<(Liveness, Liveness)> {
        let from = self.liveness;
        self.liveness = Liveness::Live;
        self.display = DisplaySource::Primary(shown);
        self.last_success = Some(at);
        self.consecutive_failures = 0;
        self.last_error = None;
        (from != Liveness::Live).then_some((from, Liveness::Live))
    }

    fn record_failure(&mut self, fallback: &str, reason: String) -> Option<(Liveness, Liveness)> {
        let from = self.liveness;
        self.liveness = Liveness::Unreachable;
        self.display = DisplaySource::Fallback(fallback.to_string());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(reason);
        (from != Liveness::Unreachable).then_some((from, Liveness::Unreachable))
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub primary: Url,
    pub fallback: String,
    pub refresh_interval: Duration,
    pub probe_interval: Duration,
}

type ChangeHook = Arc<dyn Fn(&str, Liveness) + Send + Sync>;

struct Inner {
    state: FeedState,
    disposed: bool,
    /// Bumped on every failure. A load that started in an older generation
    /// cannot bring the primary back.
    generation: u64,
}

struct Shared {
    config: FeedConfig,
    inner: Mutex<Inner>,
    on_change: Option<ChangeHook>,
}

impl Shared {
    /// `started` is the generation a load began in; `None` for failures the
    /// view reports.
    fn apply(&self, started: Option<u64>, result: Result<Url, String>) {
        let (transition, reason) = {
            let mut inner = lock(&self.inner);
            if inner.disposed {
                return;
            }
            if started.is_some() {
                inner.state.probe_in_flight = false;
            }
            let transition = match result {
                Ok(shown) if started == Some(inner.generation) => {
                    inner.state.record_success(shown, Utc::now())
                }
                Ok(_) => {
                    drop(inner);
                    log(
                        Level::Debug,
                        Domain::Feed,
                        "stale_load_ignored",
                        obj(&[("feed", v_str(&self.config.name))]),
                    );
                    return;
                }
                Err(reason) => {
                    inner.generation += 1;
                    inner.state.record_failure(&self.config.fallback, reason)
                }
            };
            (transition, inner.state.last_error.clone())
        };
        if let Some((from, to)) = transition {
            log_feed_transition(&self.config.name, from.as_str(), to.as_str(), reason.as_deref());
            if let Some(hook) = &self.on_change {
                hook(&self.config.name, to);
            }
        }
    }
}

pub struct FeedMonitor<P: ?Sized> {
    shared: Arc<Shared>,
    probe: Arc<P>,
}

impl<P: FrameProbe + ?Sized + 'static> FeedMonitor<P> {
    pub fn new(config: FeedConfig, probe: Arc<P>) -> Self {
        let initial = cache_busted(&config.primary, ts_epoch_ms());
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner {
                    state: FeedState::new(initial),
                    disposed: false,
                    generation: 0,
                }),
                on_change: None,
            }),
            probe,
        }
    }

    /// Called with the feed name on every liveness transition.
    pub fn on_change(mut self, hook: impl Fn(&str, Liveness) + Send + Sync + 'static) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.on_change = Some(Arc::new(hook));
        }
        self
    }

    pub fn state(&self) -> FeedState {
        lock(&self.shared.inner).state.clone()
    }

    /// One load cycle: a refresh while live, an out-of-band probe while
    /// unreachable. Returns the delay until the next cycle.
    pub async fn tick(&self) -> Duration {
        let (url, generation) = {
            let mut inner = lock(&self.shared.inner);
            if inner.state.liveness == Liveness::Unreachable {
                inner.state.probe_in_flight = true;
            }
            (
                cache_busted(&self.shared.config.primary, ts_epoch_ms()),
                inner.generation,
            )
        };

        let result = match self.probe.load(&url).await {
            Ok(_) => Ok(url),
            Err(err) => Err(err.to_string()),
        };
        self.shared.apply(Some(generation), result);

        match lock(&self.shared.inner).state.liveness {
            Liveness::Live => self.shared.config.refresh_interval,
            Liveness::Unreachable => self.shared.config.probe_interval,
        }
    }

    /// Run the load cycle on its own task until the handle is disposed.
    pub fn spawn(self) -> FeedHandle {
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            loop {
                let delay = self.tick().await;
                sleep(delay).await;
            }
        });
        FeedHandle { shared, task }
    }
}

/// Owner of a running monitor; dropping it stops the monitor.
pub struct FeedHandle {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl FeedHandle {
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn snapshot(&self) -> FeedState {
        lock(&self.shared.inner).state.clone()
    }

    pub fn liveness(&self) -> Liveness {
        lock(&self.shared.inner).state.liveness
    }

    pub fn display(&self) -> DisplaySource {
        lock(&self.shared.inner).state.display.clone()
    }

    /// The view failed to load the image it was showing.
    pub fn report_load_failure(&self, reason: &str) {
        self.shared.apply(None, Err(reason.to_string()));
    }

    /// Cancel the pending timer or probe. Results still in flight are ignored.
    pub fn dispose(&self) {
        lock(&self.shared.inner).disposed = true;
        self.task.abort();
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.shared.inner).disposed
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
