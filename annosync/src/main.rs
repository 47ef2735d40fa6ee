// annosync - offline-first annotation store
// Command line entry: run one sync round for a data directory

use annosync::app;
use anyhow::{bail, Context};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "annosync=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(data_dir) = std::env::args_os().nth(1).map(PathBuf::from) else {
        bail!("usage: annosync <data-dir>");
    };

    tracing::info!("Starting annosync");

    let state = app::setup(&data_dir)
        .await
        .with_context(|| format!("failed to open {}", data_dir.display()))?;

    let coordinator = state
        .default_coordinator()
        .context("sync is not configured, set server_url in settings.json")?;

    let report = coordinator.sync_persisted().await?;

    println!("{}", report.summary);
    for error in &report.summary.errors {
        println!("  skipped {}", error);
    }
    println!(
        "last local sync: {}",
        report.token.last_local_sync_date().to_rfc3339()
    );

    if let Some(error) = report.error() {
        if error.is_authentication() {
            bail!("{}. Sign in again and update session_cookie", error);
        }
        bail!("sync failed: {}", error);
    }

    Ok(())
}
