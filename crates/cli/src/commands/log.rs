// `workbench log` — print a workflow's history chain, oldest first.

use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use workbench_common::types::{CursorState, DeltaId, WorkflowId};

use super::Session;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct LogArgs {
    pub workflow_id: WorkflowId,
}

#[derive(Debug, Serialize)]
pub struct LogResult {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub head_delta_id: Option<DeltaId>,
    pub cursor: CursorState,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Serialize)]
pub struct LogEntry {
    pub id: DeltaId,
    pub command: String,
    pub applied: bool,
    pub last_applied_at: DateTime<Utc>,
    pub affected_steps: usize,
}

pub fn run(session: &Session, args: LogArgs, format: OutputFormat) -> anyhow::Result<()> {
    let result = execute(session, &args)?;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

pub fn execute(session: &Session, args: &LogArgs) -> anyhow::Result<LogResult> {
    let store = session.store();
    let workflow = store.load_workflow(args.workflow_id)?;
    let cursor = store.cursor_state(args.workflow_id)?;
    let entries = store
        .list_deltas(args.workflow_id)?
        .into_iter()
        .map(|delta| LogEntry {
            applied: workflow.head_delta_id.is_some_and(|head| delta.id <= head),
            affected_steps: delta.step_delta_ids.len(),
            id: delta.id,
            command: delta.command_name,
            last_applied_at: delta.last_applied_at,
        })
        .collect();

    Ok(LogResult {
        workflow_id: workflow.id,
        name: workflow.name,
        head_delta_id: workflow.head_delta_id,
        cursor,
        entries,
    })
}

fn format_human(result: &LogResult) -> String {
    let mut lines = vec![format!("Workflow {} \"{}\"", result.workflow_id, result.name)];
    if result.entries.is_empty() {
        lines.push("  (no history)".to_string());
    }
    for entry in &result.entries {
        let marker = if Some(entry.id) == result.head_delta_id {
            '*'
        } else if entry.applied {
            ' '
        } else {
            '-'
        };
        lines.push(format!(
            "{marker} {:>6}  {:<20} {}",
            entry.id,
            entry.command,
            entry.last_applied_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{apply, history, new, test_support};

    #[test]
    fn log_marks_head_and_undone_entries() {
        let (_dir, mut session) = test_support::session();
        let workflow = new::execute(&session, &new::NewArgs { name: "w".into() }).unwrap();
        for title in ["a", "b"] {
            apply::execute(
                &mut session,
                apply::DoArgs {
                    workflow_id: workflow.id,
                    command: format!(r#"{{"command":"SetWorkflowTitle","args":{{"new_value":"{title}"}}}}"#),
                    mutation_id: None,
                },
            )
            .unwrap();
        }
        history::undo(&mut session, workflow.id).unwrap();

        let result = execute(&session, &LogArgs { workflow_id: workflow.id }).unwrap();
        assert_eq!(result.cursor, CursorState::MidChain);
        let applied: Vec<bool> = result.entries.iter().map(|entry| entry.applied).collect();
        assert_eq!(applied, vec![true, true, false]);
        assert_eq!(result.entries[0].command, "InitWorkflow");

        let text = format_human(&result);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].starts_with('*'));
        assert!(lines[3].starts_with('-'));
    }
}
