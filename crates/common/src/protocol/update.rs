// Clientside update payload sent to collaborators after a history change.
//
// The core treats this as opaque; it is built by each command and delivered
// by the notification transport.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DeltaId, StepId, Workflow};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkflowUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_delta_id: Option<DeltaId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_slugs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_tab_position: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TabUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_ids: Option<Vec<StepId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_id_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_data_version: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_relevant_delta_id: Option<DeltaId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowUpdate>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tabs: BTreeMap<String, TabUpdate>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub clear_tab_slugs: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub steps: BTreeMap<StepId, StepUpdate>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub clear_step_ids: BTreeSet<StepId>,
}

impl ClientUpdate {
    /// Base update every history change carries: the new cursor and timestamp.
    pub fn for_workflow(workflow: &Workflow) -> Self {
        Self {
            workflow: Some(WorkflowUpdate {
                head_delta_id: workflow.head_delta_id,
                updated_at: Some(workflow.updated_at),
                ..WorkflowUpdate::default()
            }),
            ..Self::default()
        }
    }

    pub fn with_mutation_id(mut self, mutation_id: impl Into<String>) -> Self {
        self.mutation_id = Some(mutation_id.into());
        self
    }

    pub fn update_workflow(mut self, apply: impl FnOnce(&mut WorkflowUpdate)) -> Self {
        apply(self.workflow.get_or_insert_with(WorkflowUpdate::default));
        self
    }

    pub fn update_tab(mut self, slug: &str, apply: impl FnOnce(&mut TabUpdate)) -> Self {
        self.clear_tab_slugs.remove(slug);
        apply(self.tabs.entry(slug.to_owned()).or_default());
        self
    }

    pub fn clear_tab(mut self, slug: &str) -> Self {
        self.tabs.remove(slug);
        self.clear_tab_slugs.insert(slug.to_owned());
        self
    }

    pub fn update_step(mut self, step_id: StepId, apply: impl FnOnce(&mut StepUpdate)) -> Self {
        if self.clear_step_ids.contains(&step_id) {
            return self;
        }
        apply(self.steps.entry(step_id).or_default());
        self
    }

    pub fn clear_step(mut self, step_id: StepId) -> Self {
        self.steps.remove(&step_id);
        self.clear_step_ids.insert(step_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleared_step_ignores_later_updates() {
        let update = ClientUpdate::default()
            .clear_step(4)
            .update_step(4, |step| step.last_relevant_delta_id = Some(9));

        assert!(update.steps.is_empty());
        assert!(update.clear_step_ids.contains(&4));
    }

    #[test]
    fn updating_tab_undoes_clear() {
        let update = ClientUpdate::default()
            .clear_tab("tab-2")
            .update_tab("tab-2", |tab| tab.name = Some("Restored".into()));

        assert!(update.clear_tab_slugs.is_empty());
        assert_eq!(update.tabs["tab-2"].name.as_deref(), Some("Restored"));
    }

    #[test]
    fn empty_sections_are_omitted_from_json() {
        let json = serde_json::to_value(ClientUpdate::default().with_mutation_id("m-1"))
            .expect("update should serialize");
        assert_eq!(json, serde_json::json!({ "mutation_id": "m-1" }));
    }
}
