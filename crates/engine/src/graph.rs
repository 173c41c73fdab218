// Which steps read which tabs, and what a tab change invalidates.
//
// Output order is always tab order, then position within the tab, so callers
// and tests see the same list for the same document.

use std::collections::{BTreeSet, HashMap, HashSet};

use workbench_common::module::ModuleCatalog;
use workbench_common::types::StepId;

use crate::error::StoreError;
use crate::store::DocumentTx;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabNode {
    pub slug: String,
    /// Live steps in position order. Each one reads the output of the one
    /// before it.
    pub step_ids: Vec<StepId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    tabs: Vec<TabNode>,
    steps: HashMap<StepId, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new(tabs: Vec<TabNode>, steps: HashMap<StepId, BTreeSet<String>>) -> Self {
        Self { tabs, steps }
    }

    /// Build the graph from the document's live tabs and steps.
    ///
    /// Steps whose module is not in `catalog` are treated as independent.
    pub fn load_from_workflow(doc: &DocumentTx<'_>, catalog: &ModuleCatalog) -> Result<Self, StoreError> {
        let mut tabs = Vec::new();
        let mut steps = HashMap::new();

        for tab in doc.live_tabs()? {
            let live = doc.live_steps(tab.id)?;
            let mut step_ids = Vec::with_capacity(live.len());
            for step in live {
                step_ids.push(step.id);
                steps.insert(step.id, catalog.step_tab_dependencies(&step.module_id_name, &step.params));
            }
            tabs.push(TabNode { slug: tab.slug, step_ids });
        }

        Ok(Self { tabs, steps })
    }

    /// Every step whose output changes when the outputs of `tab_slugs` change.
    ///
    /// Within a tab, the first step reading a changed tab makes every later
    /// step in that tab dependent too, and that tab joins the changed set.
    /// Repeats until no new tab joins.
    pub fn affected_steps<'a>(&self, tab_slugs: impl IntoIterator<Item = &'a str>) -> Vec<StepId> {
        let mut frontier: HashSet<&str> = tab_slugs.into_iter().collect();
        let mut dependent: HashSet<StepId> = HashSet::new();

        loop {
            let mut newly_changed = Vec::new();

            for tab in &self.tabs {
                let first_dependent = tab.step_ids.iter().position(|step_id| {
                    self.steps
                        .get(step_id)
                        .is_some_and(|reads| reads.iter().any(|slug| frontier.contains(slug.as_str())))
                });
                let Some(first) = first_dependent else {
                    continue;
                };

                dependent.extend(&tab.step_ids[first..]);
                if !frontier.contains(tab.slug.as_str()) {
                    newly_changed.push(tab.slug.as_str());
                }
            }

            if newly_changed.is_empty() {
                break;
            }
            frontier.extend(newly_changed);
        }

        self.tabs
            .iter()
            .flat_map(|tab| tab.step_ids.iter().copied())
            .filter(|step_id| dependent.contains(step_id))
            .collect()
    }

    pub fn tabs(&self) -> &[TabNode] {
        &self.tabs
    }
}
