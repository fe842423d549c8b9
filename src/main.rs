// This file is an example of how to use the `layercam` library.
// It runs one capture session against the configured dataset and prints the
// final status the dashboard would poll.
//
// Usage: layercam [config.toml]

use anyhow::{Context, Result};
use layercam::{CaptureConfig, SessionEvent, SessionGateway};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = CaptureConfig::load(config_path.as_deref()).context("loading configuration")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("layercam - Example Runner");

    let gateway = SessionGateway::new(config).context("opening capture gateway")?;
    let mut events = gateway.subscribe();
    let started = gateway.start().context("starting capture session")?;
    tracing::info!(
        layer = started.layer_current,
        total = started.layer_total,
        slots = gateway.config().total_slots,
        cycle = ?gateway.config().cycle(),
        "session requested"
    );

    let mut watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Stopped { layer, outcome, error }) => {
                    tracing::info!(layer = %layer, ?outcome, ?error, "session stopped");
                    break;
                }
                Ok(event) => tracing::debug!(?event, "session event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut watcher => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, cancelling session");
            gateway.cancel();
            watcher.abort();
        }
    }
    // The worker bundles after stopping; wait for that too.
    gateway.wait_for_worker().await.context("capture worker failed")?;

    let status = gateway.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
