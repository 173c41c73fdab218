// `workbench do` — apply one command to a workflow.
//
// Arguments are the adjacently tagged JSON form, e.g.
// `{"command":"SetWorkflowTitle","args":{"new_value":"Q3"}}`.

use anyhow::Context;
use clap::Args;
use workbench_common::command::CommandArgs;
use workbench_common::types::WorkflowId;
use workbench_engine::HistoryAction;

use super::history::{self, HistoryOutcome};
use super::Session;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct DoArgs {
    pub workflow_id: WorkflowId,

    /// Command as JSON: `{"command": <name>, "args": {...}}`.
    pub command: String,

    /// Client mutation id echoed in the notification.
    #[arg(long)]
    pub mutation_id: Option<String>,
}

pub fn run(session: &mut Session, args: DoArgs, format: OutputFormat) -> anyhow::Result<()> {
    let outcome = execute(session, args)?;
    output::print_output(format, &outcome, history::format_human)?;
    Ok(())
}

pub fn parse_command(raw: &str) -> anyhow::Result<CommandArgs> {
    serde_json::from_str(raw).context("invalid command JSON")
}

pub fn execute(session: &mut Session, args: DoArgs) -> anyhow::Result<HistoryOutcome> {
    let command = parse_command(&args.command)?;
    let delta =
        session.block_on(session.orchestrator().do_command(args.workflow_id, command, args.mutation_id))?;
    HistoryOutcome::collect(session, HistoryAction::Do, args.workflow_id, delta)
}
