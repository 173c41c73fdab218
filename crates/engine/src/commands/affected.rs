// Bookkeeping for commands that change step outputs.
//
// Each such entry records `(step_id, last_relevant_delta_id before forward)`.
// `forward` stamps those steps with the entry id; `backward` puts the recorded
// ids back.

use std::collections::HashSet;

use workbench_common::protocol::update::ClientUpdate;
use workbench_common::types::{Delta, StepDeltaRef, StepId, Tab};

use crate::error::StoreError;
use crate::graph::DependencyGraph;
use crate::store::DocumentTx;

/// Live steps in `tab` at or after `position`, then every step reading `tab`.
pub(crate) fn from_position(
    doc: &DocumentTx<'_>,
    graph: &DependencyGraph,
    tab: &Tab,
    position: i64,
) -> Result<Vec<StepId>, StoreError> {
    let mut step_ids: Vec<StepId> = doc
        .live_steps(tab.id)?
        .into_iter()
        .filter(|step| step.position >= position)
        .map(|step| step.id)
        .collect();
    step_ids.extend(graph.affected_steps([tab.slug.as_str()]));
    Ok(step_ids)
}

/// Record each step's current version, keeping first-seen order.
pub(crate) fn snapshot(
    doc: &DocumentTx<'_>,
    step_ids: impl IntoIterator<Item = StepId>,
) -> Result<Vec<StepDeltaRef>, StoreError> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();
    for step_id in step_ids {
        if !seen.insert(step_id) {
            continue;
        }
        if let Some(step) = doc.step(step_id)? {
            refs.push(StepDeltaRef { step_id, prev_relevant_delta_id: step.last_relevant_delta_id });
        }
    }
    Ok(refs)
}

pub(crate) fn stamp(doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), StoreError> {
    for entry in &delta.step_delta_ids {
        doc.set_step_last_relevant_delta(entry.step_id, Some(delta.id))?;
    }
    Ok(())
}

pub(crate) fn restore(doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), StoreError> {
    for entry in &delta.step_delta_ids {
        doc.set_step_last_relevant_delta(entry.step_id, entry.prev_relevant_delta_id)?;
    }
    Ok(())
}

/// Add the current version of every live affected step to `update`.
pub(crate) fn describe(
    mut update: ClientUpdate,
    doc: &DocumentTx<'_>,
    delta: &Delta,
) -> Result<ClientUpdate, StoreError> {
    for step_id in delta.affected_step_ids() {
        if let Some(step) = doc.step(step_id)?.filter(|step| !step.is_deleted) {
            update = update.update_step(step_id, |out| {
                out.last_relevant_delta_id = step.last_relevant_delta_id;
            });
        }
    }
    Ok(update)
}
