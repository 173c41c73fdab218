// Core domain types shared across all workbench crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type WorkflowId = i64;
pub type TabId = i64;
pub type StepId = i64;
pub type DeltaId = i64;

/// A versioned document: ordered tabs holding ordered steps, plus a cursor
/// into its history chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    /// Last applied history entry. `None` means the cursor sits before the
    /// first surviving entry.
    pub head_delta_id: Option<DeltaId>,
    pub selected_tab_position: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tab {
    pub id: TabId,
    pub workflow_id: WorkflowId,
    pub slug: String,
    pub name: String,
    pub position: i64,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: StepId,
    pub tab_id: TabId,
    pub slug: String,
    pub module_id_name: String,
    pub position: i64,
    pub params: Value,
    pub notes: String,
    pub stored_data_version: Option<DateTime<Utc>>,
    /// The history entry whose application last changed this step's output.
    pub last_relevant_delta_id: Option<DeltaId>,
    pub is_deleted: bool,
}

/// One step whose output a history entry invalidates, with the version it
/// had before the entry was applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepDeltaRef {
    pub step_id: StepId,
    pub prev_relevant_delta_id: Option<DeltaId>,
}

/// One applied-or-undone command in a workflow's history chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delta {
    pub id: DeltaId,
    pub workflow_id: WorkflowId,
    pub command_name: String,
    pub prev_delta_id: Option<DeltaId>,
    pub values_for_forward: Value,
    pub values_for_backward: Value,
    pub tab_id: Option<TabId>,
    pub step_id: Option<StepId>,
    pub step_delta_ids: Vec<StepDeltaRef>,
    pub last_applied_at: DateTime<Utc>,
}

impl Delta {
    pub fn affected_step_ids(&self) -> impl Iterator<Item = StepId> + '_ {
        self.step_delta_ids.iter().map(|entry| entry.step_id)
    }
}

/// Where a workflow's cursor sits relative to the tail of its chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CursorState {
    /// No undone entries exist.
    AtHead,
    /// Undone ("future") entries exist and will be dropped by the next `do`.
    MidChain,
}
