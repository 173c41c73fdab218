// `workbench sweep` — run one retention batch now.

use std::sync::Arc;

use clap::Args;
use workbench_engine::clock::SystemClock;
use workbench_engine::reaper::{Reaper, SweepReport};

use super::Session;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct SweepArgs {
    /// Override the configured retention window.
    #[arg(long)]
    pub max_age_days: Option<u32>,

    /// Override the configured batch size.
    #[arg(long)]
    pub limit: Option<usize>,
}

pub fn run(session: &Session, args: SweepArgs, format: OutputFormat) -> anyhow::Result<()> {
    let report = execute(session, &args)?;
    output::print_output(format, &report, format_human)?;
    Ok(())
}

pub fn execute(session: &Session, args: &SweepArgs) -> anyhow::Result<SweepReport> {
    let mut retention = session.config().retention.clone();
    if let Some(days) = args.max_age_days {
        retention.max_age_days = days;
    }
    if let Some(limit) = args.limit {
        retention.max_workflows_per_cycle = limit;
    }

    let reaper = Reaper::new(session.store().clone(), Arc::new(SystemClock), retention);
    Ok(session.block_on(reaper.sweep_once())?)
}

fn format_human(report: &SweepReport) -> String {
    format!(
        "Swept {} workflow(s): {} entries, {} tabs, {} steps deleted",
        report.workflows_visited, report.deltas_deleted, report.tabs_deleted, report.steps_deleted
    )
}
