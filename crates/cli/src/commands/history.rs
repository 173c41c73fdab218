// `workbench undo` / `workbench redo` — move the history cursor.

use clap::Args;
use serde::Serialize;
use workbench_common::types::{Delta, DeltaId, WorkflowId};
use workbench_engine::notify::Outbound;
use workbench_engine::HistoryAction;

use super::Session;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct UndoArgs {
    pub workflow_id: WorkflowId,
}

#[derive(Debug, Args)]
pub struct RedoArgs {
    pub workflow_id: WorkflowId,
}

/// What one do/undo/redo changed, and what it asked collaborators for.
#[derive(Debug, Serialize)]
pub struct HistoryOutcome {
    pub action: &'static str,
    pub workflow_id: WorkflowId,
    pub delta: Option<Delta>,
    pub head_delta_id: Option<DeltaId>,
    pub notifications: usize,
    pub render_delta_id: Option<DeltaId>,
}

impl HistoryOutcome {
    pub(crate) fn collect(
        session: &mut Session,
        action: HistoryAction,
        workflow_id: WorkflowId,
        delta: Option<Delta>,
    ) -> anyhow::Result<Self> {
        let head_delta_id = session.store().load_workflow(workflow_id)?.head_delta_id;
        let mut notifications = 0;
        let mut render_delta_id = None;
        for message in session.drain_outbound() {
            match message {
                Outbound::Notify { .. } => notifications += 1,
                Outbound::Render { delta_id, .. } => render_delta_id = Some(delta_id),
            }
        }
        Ok(Self { action: action.as_str(), workflow_id, delta, head_delta_id, notifications, render_delta_id })
    }
}

pub(crate) fn format_human(outcome: &HistoryOutcome) -> String {
    let Some(delta) = &outcome.delta else {
        return match outcome.action {
            "do" => "No change.".to_string(),
            action => format!("Nothing to {action}."),
        };
    };

    let head = outcome.head_delta_id.map_or_else(|| "none".to_string(), |id| id.to_string());
    let mut text = format!("{}: entry {} ({}); head is now {head}", outcome.action, delta.id, delta.command_name);
    if let Some(render) = outcome.render_delta_id {
        text.push_str(&format!("\nrender requested for entry {render}"));
    }
    text
}

pub fn run_undo(session: &mut Session, args: UndoArgs, format: OutputFormat) -> anyhow::Result<()> {
    let outcome = undo(session, args.workflow_id)?;
    output::print_output(format, &outcome, format_human)?;
    Ok(())
}

pub fn run_redo(session: &mut Session, args: RedoArgs, format: OutputFormat) -> anyhow::Result<()> {
    let outcome = redo(session, args.workflow_id)?;
    output::print_output(format, &outcome, format_human)?;
    Ok(())
}

pub fn undo(session: &mut Session, workflow_id: WorkflowId) -> anyhow::Result<HistoryOutcome> {
    let delta = session.block_on(session.orchestrator().undo(workflow_id))?;
    HistoryOutcome::collect(session, HistoryAction::Undo, workflow_id, delta)
}

pub fn redo(session: &mut Session, workflow_id: WorkflowId) -> anyhow::Result<HistoryOutcome> {
    let delta = session.block_on(session.orchestrator().redo(workflow_id))?;
    HistoryOutcome::collect(session, HistoryAction::Redo, workflow_id, delta)
}
