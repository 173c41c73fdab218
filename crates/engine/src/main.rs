// workbench-reaper: periodic history retention sweep.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::info;
use workbench_engine::clock::SystemClock;
use workbench_engine::config::EngineConfig;
use workbench_engine::reaper::Reaper;
use workbench_engine::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => EngineConfig::load_from(&path)
            .with_context(|| format!("failed to load config from `{}`", path.display()))?,
        None => EngineConfig::load().context("failed to load ~/.workbench/config.toml")?,
    };

    let store = Store::open(&config.database_path)
        .with_context(|| format!("failed to open database `{}`", config.database_path.display()))?;
    let reaper = Reaper::new(Arc::new(store), Arc::new(SystemClock), config.retention.clone());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let sweeper = tokio::spawn(reaper.run(shutdown_rx));

    info!(
        database = %config.database_path.display(),
        max_age_days = config.retention.max_age_days,
        interval_secs = config.retention.interval_secs,
        "starting workbench reaper"
    );
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    let _ = shutdown_tx.send(());
    sweeper.await.context("reaper task panicked")?;
    Ok(())
}
