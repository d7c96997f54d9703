//! Tickstream engine binary.
//!
//! Wires the tick source, fixed-rate driver, snapshot builder, session
//! hub, scheduler, and stream endpoint together and runs until the tick
//! bound is reached or Ctrl-C is pressed.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load configuration from `tickstream-config.yaml`
//! 3. Create the tick source over the synthetic mutator
//! 4. Create the snapshot cache, build once, and start its timer
//! 5. Create the hub and register it on the source
//! 6. Spawn the scheduler and the stream server
//! 7. Run the driver until stopped
//! 8. Shut everything down in reverse order

mod error;

use std::path::Path;
use std::sync::Arc;

use tickstream_cache::SnapshotCache;
use tickstream_core::config::StreamConfig;
use tickstream_core::control::DriverControl;
use tickstream_core::driver::run_driver;
use tickstream_core::source::TickSource;
use tickstream_core::synthetic::SyntheticMutator;
use tickstream_server::server::ServerConfig;
use tickstream_server::{
    AppState, CheapestResume, StreamHub, StreamMetrics, spawn_scheduler, spawn_server,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Path of the configuration file, relative to the working directory.
const CONFIG_PATH: &str = "tickstream-config.yaml";

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if configuration loading, the first snapshot build,
/// or server startup fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("tickstream-engine starting");

    // 2. Load configuration.
    let config = load_config()?;
    info!(
        stream_id = config.server.stream_id,
        rate_per_sec = config.source.rate_per_sec,
        snapshot_interval_ms = config.cache.interval_ms,
        pass_interval_ms = config.scheduler.pass_interval_ms,
        "Configuration loaded"
    );

    // 3. Tick source and driver controls.
    let source = Arc::new(TickSource::new(
        config.server.stream_id.clone(),
        Box::new(SyntheticMutator::new(
            config.source.seed,
            config.source.node_capacity,
        )),
    ));
    let control = Arc::new(DriverControl::from_config(&config.source));

    // 4. Snapshot cache.
    let cache = Arc::new(SnapshotCache::new(
        Arc::clone(&source),
        config.cache.clone(),
    ));
    let outcome = cache.build_now().await.map_err(EngineError::from)?;
    info!(outcome = ?outcome, "Initial snapshot build");
    cache.start(config.cache.interval());

    // 5. Hub.
    let hub = Arc::new(StreamHub::new(
        Arc::clone(&source),
        Arc::clone(&cache),
        &config,
        Box::new(CheapestResume),
        Arc::new(StreamMetrics::default()),
    ));
    hub.attach_to_source();

    // 6. Scheduler and server.
    let scheduler = spawn_scheduler(Arc::clone(&hub));
    let state = Arc::new(AppState::new(Arc::clone(&hub)));
    let server = spawn_server(&ServerConfig::from(&config.server), state)
        .await
        .map_err(EngineError::from)?;
    info!(addr = %server.addr(), "Stream endpoint ready at /stream");

    // Ctrl-C stops the driver; everything else follows it down.
    let stopper = {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received, stopping"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, stopping"),
            }
            control.request_stop();
        })
    };

    // 7. Run the driver.
    let report = run_driver(&source, &control).await;
    stopper.abort();

    // 8. Shutdown.
    let closed = hub.close_all("server shutting down");
    info!(sessions = closed, "Sessions closed");
    scheduler.shutdown().await;
    cache.stop().await;
    server.shutdown().await;
    hub.detach_from_source();

    info!(
        final_tick = report.final_tick,
        total_ticks = report.total_ticks,
        "tickstream-engine stopped"
    );
    Ok(())
}

/// Load configuration from `tickstream-config.yaml`, or defaults when the
/// file does not exist.
fn load_config() -> Result<StreamConfig, EngineError> {
    let config_path = Path::new(CONFIG_PATH);
    if !config_path.exists() {
        info!("Config file not found, using defaults");
    }
    Ok(StreamConfig::load_or_default(config_path)?)
}
