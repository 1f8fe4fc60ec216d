//! Engine binary for the reroll activity and verification engine.
//!
//! Wires the engine to its stores, NATS, and the scheduler loop, then runs
//! until interrupted.
//!
//! # Startup Sequence
//!
//! 1. Load and validate configuration from `reroll-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Connect the configured store backend
//! 4. Build the engine with a channel notification sink
//! 5. Connect to NATS; start the ordered ingestion lanes, heartbeat/command
//!    listeners, the reply publisher, and the notification forwarder
//! 6. Run the scheduler until Ctrl-C
//! 7. Drain notifications and close connections

mod error;
mod nats_ingest;
mod notifier;
mod stores;
mod tick_callback;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reroll_core::Engine;
use reroll_core::clock::{SchedulerClock, SystemClock};
use reroll_core::config::{LoggingConfig, RerollConfig};
use reroll_core::notify::ChannelSink;
use reroll_core::runner::{self, SchedulerControl};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineBinError;
use crate::tick_callback::TickReporter;

/// How long shutdown waits for queued notifications to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Configuration comes first so it can drive the log filter.
    let config = load_config()?;

    // 2. Logging.
    init_tracing(&config.logging);
    info!(
        backend = ?config.infrastructure.backend,
        silence_threshold_secs = config.monitor.silence_threshold_secs,
        auto_kick_enabled = config.monitor.auto_kick_enabled,
        tick_interval_secs = config.monitor.tick_interval_secs,
        aggregation_interval_secs = config.statistics.aggregation_interval_secs,
        "reroll-engine starting"
    );

    // 3. Stores.
    let handles = stores::connect(&config.infrastructure).await?;

    // 4. Engine.
    let nats_url = config.infrastructure.nats_url.clone();
    let (sink, notifications) = ChannelSink::new();
    let clock = Arc::new(SystemClock);
    let mut scheduler = SchedulerClock::new(&config.monitor, &config.statistics)?;
    let engine = Arc::new(
        Engine::new(
            config,
            handles.entities,
            handles.timeline,
            Arc::new(sink),
            clock.clone(),
        )
        .map_err(EngineBinError::from)?,
    );

    // 5. NATS. The engine still sweeps without it, so a failed connection
    //    degrades to scheduler-only operation.
    let nats = match async_nats::connect(nats_url.as_str()).await {
        Ok(client) => {
            info!(%nats_url, "Connected to NATS");
            Some(client)
        }
        Err(e) => {
            warn!(%nats_url, error = %e, "NATS unavailable, ingestion disabled");
            None
        }
    };
    let (reply_tx, reply_rx) = tokio::sync::mpsc::unbounded_channel();
    let lanes = Arc::new(nats_ingest::Lanes::start(
        &engine,
        nats_ingest::LANE_COUNT,
        reply_tx,
    ));
    let (listeners, replier) = match &nats {
        Some(client) => (
            nats_ingest::spawn_listeners(client, &lanes).await?,
            Some(tokio::spawn(nats_ingest::publish_replies(
                client.clone(),
                reply_rx,
            ))),
        ),
        None => (Vec::new(), None),
    };
    let forwarder = tokio::spawn(notifier::forward(
        notifications,
        nats.clone(),
        handles.notification_log,
    ));

    // 6. Scheduler.
    let control = Arc::new(SchedulerControl::new());
    {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupt received, stopping"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, stopping"),
            }
            control.request_stop();
        });
    }

    let mut callback = TickReporter::new(nats.clone());
    let result = runner::run_scheduler(
        &engine,
        clock.as_ref(),
        &mut scheduler,
        &control,
        &mut callback,
    )
    .await
    .map_err(EngineBinError::from)?;
    runner::log_scheduler_end(&result);

    // 7. Shutdown. Listeners feed the lanes, lanes hold engine clones, and
    //    the engine holds the last notification sender.
    for listener in listeners {
        listener.abort();
        let _ = listener.await;
    }
    match Arc::try_unwrap(lanes) {
        Ok(lanes) => lanes.shutdown().await,
        Err(_) => warn!("Lanes still shared at shutdown, queued messages dropped"),
    }
    if let Some(replier) = replier {
        match replier.await {
            Ok(published) => info!(published, "Replies drained"),
            Err(e) => warn!(error = %e, "Reply publisher failed"),
        }
    }
    drop(engine);
    match tokio::time::timeout(DRAIN_TIMEOUT, forwarder).await {
        Ok(Ok(forwarded)) => info!(forwarded, "Notifications drained"),
        Ok(Err(e)) => warn!(error = %e, "Notification forwarder failed"),
        Err(_) => warn!("Timed out draining notifications"),
    }
    if let Some(client) = nats
        && let Err(e) = client.flush().await
    {
        warn!(error = %e, "Failed to flush NATS");
    }
    if let Some(postgres) = handles.postgres {
        postgres.close().await;
    }

    info!(
        reason = ?result.reason,
        total_ticks = result.total_ticks,
        "reroll-engine shutdown complete"
    );
    Ok(())
}

/// Load configuration from `REROLL_CONFIG` or `reroll-config.yaml`.
///
/// A missing file means defaults plus environment overrides.
fn load_config() -> Result<RerollConfig, EngineBinError> {
    let path = std::env::var("REROLL_CONFIG")
        .map_or_else(|_| PathBuf::from("reroll-config.yaml"), PathBuf::from);
    if path.exists() {
        Ok(RerollConfig::from_file(&path)?)
    } else {
        let mut config = RerollConfig::default();
        config.infrastructure.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `logging.level`.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}
