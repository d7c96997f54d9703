//! `tickstream-watch`: follow a stream and log its progress.
//!
//! Connects to the stream endpoint, keeps a local copy of the state up
//! to date, and reconnects with a resume hint whenever the connection
//! drops. Stops on Ctrl-C.

use tickstream_client::{Reconciler, WatchConfig, connection};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application entry point for the watcher.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = WatchConfig::from_env()?;
    info!(
        url = config.url,
        stream_id = config.stream_id,
        want_window = config.want_window,
        "tickstream-watch starting"
    );

    let mut reconciler = Reconciler::new(config.stream_id.clone(), config.want_window);
    tokio::select! {
        () = connection::run(&config, &mut reconciler) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Ctrl-C received, stopping");
        }
    }

    info!(
        local_tick = reconciler.local_tick(),
        stats = ?reconciler.stats(),
        "tickstream-watch stopped"
    );
    Ok(())
}
