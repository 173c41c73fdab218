// `workbench new` — create a workflow with its first tab.

use anyhow::Context;
use chrono::Utc;
use clap::Args;
use workbench_common::types::Workflow;

use super::Session;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct NewArgs {
    /// Workflow title.
    pub name: String,
}

pub fn run(session: &Session, args: NewArgs, format: OutputFormat) -> anyhow::Result<()> {
    let workflow = execute(session, &args)?;
    output::print_output(format, &workflow, format_human)?;
    Ok(())
}

pub fn execute(session: &Session, args: &NewArgs) -> anyhow::Result<Workflow> {
    session.store().create_workflow(&args.name, Utc::now()).context("failed to create workflow")
}

fn format_human(workflow: &Workflow) -> String {
    format!("Created workflow {} \"{}\"", workflow.id, workflow.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support;

    #[test]
    fn new_workflow_starts_with_one_tab_and_a_head() {
        let (_dir, session) = test_support::session();
        let workflow = execute(&session, &NewArgs { name: "Sales".into() }).unwrap();

        assert_eq!(workflow.name, "Sales");
        assert!(workflow.head_delta_id.is_some());
        assert_eq!(session.store().live_tabs(workflow.id).unwrap().len(), 1);
        assert_eq!(format_human(&workflow), format!("Created workflow {} \"Sales\"", workflow.id));
    }
}
