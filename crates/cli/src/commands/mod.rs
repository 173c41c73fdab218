// CLI subcommand dispatch.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use workbench_engine::clock::SystemClock;
use workbench_engine::config::EngineConfig;
use workbench_engine::notify::{ChannelCollaborators, Outbound};
use workbench_engine::{CommandRegistry, Orchestrator, Store};

use crate::output::OutputFormat;

pub mod apply;
pub mod history;
pub mod log;
pub mod new;
pub mod sweep;

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Config file (defaults to `~/.workbench/config.toml`).
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Database file, overriding the config.
    #[arg(long, global = true, value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Force JSON output.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a workflow
    New(new::NewArgs),
    /// Apply a command to a workflow
    #[command(name = "do")]
    Do(apply::DoArgs),
    /// Undo the entry at the cursor
    Undo(history::UndoArgs),
    /// Redo the entry after the cursor
    Redo(history::RedoArgs),
    /// Print a workflow's history chain
    Log(log::LogArgs),
    /// Run one retention sweep
    Sweep(sweep::SweepArgs),
}

pub fn run(global: &GlobalArgs, cmd: Command, format: OutputFormat) -> anyhow::Result<()> {
    let mut session = Session::open(global)?;
    match cmd {
        Command::New(args) => new::run(&session, args, format),
        Command::Do(args) => apply::run(&mut session, args, format),
        Command::Undo(args) => history::run_undo(&mut session, args, format),
        Command::Redo(args) => history::run_redo(&mut session, args, format),
        Command::Log(args) => log::run(&session, args, format),
        Command::Sweep(args) => sweep::run(&session, args, format),
    }
}

pub fn load_config(global: &GlobalArgs) -> anyhow::Result<EngineConfig> {
    let mut config = match &global.config {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("failed to load config from `{}`", path.display()))?,
        None => EngineConfig::load().context("failed to load ~/.workbench/config.toml")?,
    };
    if let Some(db) = &global.db {
        config.database_path = db.clone();
    }
    Ok(config)
}

/// An engine opened for one CLI invocation.
pub struct Session {
    runtime: tokio::runtime::Runtime,
    config: EngineConfig,
    orchestrator: Orchestrator,
    outbound: UnboundedReceiver<Outbound>,
}

impl Session {
    pub fn open(global: &GlobalArgs) -> anyhow::Result<Self> {
        Self::from_config(load_config(global)?)
    }

    pub fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;
        let store = Store::open(&config.database_path)
            .with_context(|| format!("failed to open database `{}`", config.database_path.display()))?;

        let (collaborators, outbound) = ChannelCollaborators::new();
        let orchestrator = Orchestrator::new(
            Arc::new(store),
            Arc::new(CommandRegistry::builtin()?),
            Arc::new(config.catalog()),
            Arc::new(collaborators),
            Arc::new(SystemClock),
        )
        .context("failed to start engine")?;
        tracing::debug!(database = %config.database_path.display(), "opened workflow store");

        Ok(Self { runtime, config, orchestrator, outbound })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn store(&self) -> &Arc<Store> {
        self.orchestrator.store()
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Messages the engine handed to collaborators since the last call.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        let mut messages = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            messages.push(message);
        }
        messages
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use tempfile::TempDir;
    use workbench_engine::config::EngineConfig;

    use super::Session;

    pub fn session() -> (TempDir, Session) {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig { database_path: dir.path().join("workbench.db"), ..EngineConfig::default() };
        let session = Session::from_config(config).unwrap();
        (dir, session)
    }
}
