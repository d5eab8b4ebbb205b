use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::time::{interval, Duration, MissedTickBehavior};

use drowsewatch::config::Config;
use drowsewatch::dashboard::Dashboard;
use drowsewatch::events::gallery::EventGallery;
use drowsewatch::events::HttpEventStore;
use drowsewatch::feed::probe::HttpFrameProbe;
use drowsewatch::logging::{log, obj, v_str, Domain, Level};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate().context("invalid configuration")?;

    let store = Arc::new(HttpEventStore::new(cfg.events_url()?));
    let probe = Arc::new(HttpFrameProbe::new(cfg.feed_probe_timeout()).context("building frame probe")?);

    // Past events fill the log before live notifications start; an
    // unreachable backend only means starting empty.
    let history = match EventGallery::load(store.as_ref()).await {
        Ok(gallery) => gallery.history(),
        Err(_) => Vec::new(),
    };

    let mut dashboard = Dashboard::start_seeded(&cfg, store, probe, history)?;

    let mut ticker = interval(Duration::from_secs(cfg.snapshot_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                log(Level::Info, Domain::System, "snapshot", dashboard.snapshot().summary());
            }
            res = tokio::signal::ctrl_c() => {
                if let Err(err) = res {
                    log(
                        Level::Error,
                        Domain::System,
                        "signal_failed",
                        obj(&[("msg", v_str(&err.to_string()))]),
                    );
                }
                break;
            }
        }
    }

    dashboard.dispose().await;
    let final_snapshot = dashboard.snapshot();
    log(
        Level::Info,
        Domain::System,
        "shutdown",
        obj(&[
            ("samples", json!(final_snapshot.metrics.len())),
            ("events", json!(final_snapshot.events.len())),
        ]),
    );
    Ok(())
}
