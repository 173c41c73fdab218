// Persisted command identifiers and their typed arguments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every command identifier that may appear in a persisted history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandName {
    InitWorkflow,
    SetWorkflowTitle,
    AddTab,
    DeleteTab,
    SetTabName,
    ReorderTabs,
    AddStep,
    DeleteStep,
    ReorderSteps,
    SetStepParams,
    SetStepNote,
    SetStepDataVersion,
}

impl CommandName {
    pub const ALL: [CommandName; 12] = [
        Self::InitWorkflow,
        Self::SetWorkflowTitle,
        Self::AddTab,
        Self::DeleteTab,
        Self::SetTabName,
        Self::ReorderTabs,
        Self::AddStep,
        Self::DeleteStep,
        Self::ReorderSteps,
        Self::SetStepParams,
        Self::SetStepNote,
        Self::SetStepDataVersion,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InitWorkflow => "InitWorkflow",
            Self::SetWorkflowTitle => "SetWorkflowTitle",
            Self::AddTab => "AddTab",
            Self::DeleteTab => "DeleteTab",
            Self::SetTabName => "SetTabName",
            Self::ReorderTabs => "ReorderTabs",
            Self::AddStep => "AddStep",
            Self::DeleteStep => "DeleteStep",
            Self::ReorderSteps => "ReorderSteps",
            Self::SetStepParams => "SetStepParams",
            Self::SetStepNote => "SetStepNote",
            Self::SetStepDataVersion => "SetStepDataVersion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.as_str() == s)
    }
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments for `do`, one variant per creatable command.
///
/// Serialized as `{"command": "<name>", "args": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", content = "args")]
pub enum CommandArgs {
    SetWorkflowTitle {
        new_value: String,
    },
    AddTab {
        slug: String,
        name: String,
    },
    DeleteTab {
        slug: String,
    },
    SetTabName {
        slug: String,
        new_name: String,
    },
    ReorderTabs {
        new_order: Vec<String>,
    },
    AddStep {
        tab_slug: String,
        slug: String,
        module_id_name: String,
        position: i64,
        #[serde(default = "empty_params")]
        params: Value,
    },
    DeleteStep {
        step_slug: String,
    },
    ReorderSteps {
        tab_slug: String,
        new_order: Vec<String>,
    },
    SetStepParams {
        step_slug: String,
        params: Value,
    },
    SetStepNote {
        step_slug: String,
        new_value: String,
    },
    SetStepDataVersion {
        step_slug: String,
        new_version: DateTime<Utc>,
    },
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

impl CommandArgs {
    pub fn command_name(&self) -> CommandName {
        match self {
            Self::SetWorkflowTitle { .. } => CommandName::SetWorkflowTitle,
            Self::AddTab { .. } => CommandName::AddTab,
            Self::DeleteTab { .. } => CommandName::DeleteTab,
            Self::SetTabName { .. } => CommandName::SetTabName,
            Self::ReorderTabs { .. } => CommandName::ReorderTabs,
            Self::AddStep { .. } => CommandName::AddStep,
            Self::DeleteStep { .. } => CommandName::DeleteStep,
            Self::ReorderSteps { .. } => CommandName::ReorderSteps,
            Self::SetStepParams { .. } => CommandName::SetStepParams,
            Self::SetStepNote { .. } => CommandName::SetStepNote,
            Self::SetStepDataVersion { .. } => CommandName::SetStepDataVersion,
        }
    }
}
