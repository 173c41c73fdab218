use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use workbench_common::command::{CommandArgs, CommandName};
use workbench_common::module::ModuleCatalog;
use workbench_common::protocol::update::ClientUpdate;
use workbench_common::types::{Delta, Step, StepId, Tab};

use crate::error::{CommandError, StoreError, ValidationError};
use crate::graph::DependencyGraph;
use crate::store::DocumentTx;

use super::tabs::{check_permutation, check_slug, require_live_tab};
use super::{affected, decode_payload, encode_payload, mismatch, Command, NewDelta, StagedRow};

fn require_live_step(doc: &DocumentTx<'_>, slug: &str) -> Result<(Step, Tab), CommandError> {
    let not_found = || CommandError::from(ValidationError::StepNotFound(slug.to_owned()));
    let step = doc.live_step_by_slug(slug)?.ok_or_else(not_found)?;
    let tab = doc.tab(step.tab_id)?.ok_or_else(not_found)?;
    Ok((step, tab))
}

fn entry_step(command: CommandName, delta: &Delta) -> Result<StepId, CommandError> {
    delta.step_id.ok_or(CommandError::MissingReference { command, what: "step" })
}

fn entry_step_and_tab(
    command: CommandName,
    doc: &DocumentTx<'_>,
    delta: &Delta,
) -> Result<(Step, Tab), CommandError> {
    let step_id = entry_step(command, delta)?;
    let step = doc.step(step_id)?.ok_or(CommandError::MissingReference { command, what: "step" })?;
    let tab = doc.tab(step.tab_id)?.ok_or(CommandError::MissingReference { command, what: "tab" })?;
    Ok((step, tab))
}

/// Steps whose output changes when `step`'s does.
fn downstream_of(
    doc: &DocumentTx<'_>,
    catalog: &ModuleCatalog,
    tab: &Tab,
    position: i64,
) -> Result<Vec<workbench_common::types::StepDeltaRef>, StoreError> {
    let graph = DependencyGraph::load_from_workflow(doc, catalog)?;
    affected::snapshot(doc, affected::from_position(doc, &graph, tab, position)?)
}

fn with_tab_steps(update: ClientUpdate, doc: &DocumentTx<'_>, tab: &Tab) -> Result<ClientUpdate, StoreError> {
    let step_ids = doc.live_steps(tab.id)?.into_iter().map(|step| step.id).collect();
    Ok(update.update_tab(&tab.slug, |out| out.step_ids = Some(step_ids)))
}

fn describe_step(update: ClientUpdate, step: Step, tab: &Tab) -> ClientUpdate {
    if step.is_deleted {
        return update.clear_step(step.id);
    }
    let tab_slug = tab.slug.clone();
    update.update_step(step.id, move |out| {
        out.slug = Some(step.slug);
        out.tab_slug = Some(tab_slug);
        out.module_id_name = Some(step.module_id_name);
        out.params = Some(step.params);
        out.notes = Some(step.notes);
        out.stored_data_version = step.stored_data_version;
        out.last_relevant_delta_id = step.last_relevant_delta_id;
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct StepPosition {
    position: i64,
}

// ── AddStep ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct AddStep;

impl Command for AddStep {
    fn name(&self) -> CommandName {
        CommandName::AddStep
    }

    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        let CommandArgs::AddStep { tab_slug, slug, module_id_name, position, params } = args else {
            return Err(mismatch(self.name(), args));
        };

        let tab = require_live_tab(doc, tab_slug)?;
        check_slug(slug)?;
        if doc.step_slug_in_use(slug)? {
            return Err(ValidationError::DuplicateStepSlug(slug.clone()).into());
        }
        if !params.is_object() {
            return Err(ValidationError::ParamsNotObject.into());
        }
        let max = doc.live_steps(tab.id)?.len() as i64;
        if !(0..=max).contains(position) {
            return Err(ValidationError::PositionOutOfRange { position: *position, max }.into());
        }

        let refs = downstream_of(doc, catalog, &tab, *position)?;
        let placement = StepPosition { position: *position };
        Ok(Some(encode_payload(self.name(), &placement, &placement)?.with_step_delta_ids(refs).staging(
            StagedRow::Step {
                tab_id: tab.id,
                slug: slug.clone(),
                module_id_name: module_id_name.clone(),
                position: *position,
                params: params.clone(),
            },
        )))
    }

    fn forward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let (step, tab) = entry_step_and_tab(self.name(), doc, delta)?;
        let StepPosition { position } = decode_payload(self.name(), &delta.values_for_forward)?;

        // The new step's first version is this entry; it keeps it on redo.
        if step.last_relevant_delta_id.is_none() {
            doc.set_step_last_relevant_delta(step.id, Some(delta.id))?;
        }
        doc.shift_steps(tab.id, position, 1)?;
        doc.set_step_position(step.id, position)?;
        doc.set_step_deleted(step.id, false)?;
        affected::stamp(doc, delta)?;
        Ok(())
    }

    fn backward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let (step, tab) = entry_step_and_tab(self.name(), doc, delta)?;
        let StepPosition { position } = decode_payload(self.name(), &delta.values_for_backward)?;

        doc.set_step_deleted(step.id, true)?;
        doc.shift_steps(tab.id, position + 1, -1)?;
        affected::restore(doc, delta)?;
        Ok(())
    }

    fn notification_payload(&self, doc: &DocumentTx<'_>, delta: &Delta) -> Result<ClientUpdate, CommandError> {
        let (step, tab) = entry_step_and_tab(self.name(), doc, delta)?;
        let update = with_tab_steps(ClientUpdate::for_workflow(doc.workflow()), doc, &tab)?;
        let update = describe_step(update, step, &tab);
        Ok(affected::describe(update, doc, delta)?)
    }

    /// A new step always needs a render, even in an otherwise empty tab.
    fn modifies_render_output(&self, _delta: &Delta) -> bool {
        true
    }
}

// ── DeleteStep ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteStep;

impl Command for DeleteStep {
    fn name(&self) -> CommandName {
        CommandName::DeleteStep
    }

    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        let CommandArgs::DeleteStep { step_slug } = args else {
            return Err(mismatch(self.name(), args));
        };

        let (step, tab) = require_live_step(doc, step_slug)?;
        let refs = downstream_of(doc, catalog, &tab, step.position)?;
        let placement = StepPosition { position: step.position };
        Ok(Some(
            encode_payload(self.name(), &placement, &placement)?
                .with_tab(tab.id)
                .with_step(step.id)
                .with_step_delta_ids(refs),
        ))
    }

    fn forward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let (step, tab) = entry_step_and_tab(self.name(), doc, delta)?;
        let StepPosition { position } = decode_payload(self.name(), &delta.values_for_forward)?;

        doc.set_step_deleted(step.id, true)?;
        doc.shift_steps(tab.id, position + 1, -1)?;
        affected::stamp(doc, delta)?;
        Ok(())
    }

    fn backward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let (step, tab) = entry_step_and_tab(self.name(), doc, delta)?;
        let StepPosition { position } = decode_payload(self.name(), &delta.values_for_backward)?;

        doc.shift_steps(tab.id, position, 1)?;
        doc.set_step_position(step.id, position)?;
        doc.set_step_deleted(step.id, false)?;
        affected::restore(doc, delta)?;
        Ok(())
    }

    fn notification_payload(&self, doc: &DocumentTx<'_>, delta: &Delta) -> Result<ClientUpdate, CommandError> {
        let (step, tab) = entry_step_and_tab(self.name(), doc, delta)?;
        let update = with_tab_steps(ClientUpdate::for_workflow(doc.workflow()), doc, &tab)?;
        // Affected steps first: a cleared step must stay cleared.
        let update = affected::describe(update, doc, delta)?;
        Ok(describe_step(update, step, &tab))
    }
}

// ── ReorderSteps ────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct StepOrder {
    step_ids: Vec<StepId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReorderSteps;

impl ReorderSteps {
    fn apply(&self, doc: &mut DocumentTx<'_>, payload: &Value) -> Result<(), CommandError> {
        let order: StepOrder = decode_payload(self.name(), payload)?;
        for (position, step_id) in order.step_ids.iter().enumerate() {
            doc.set_step_position(*step_id, position as i64)?;
        }
        Ok(())
    }

    fn tab(&self, doc: &DocumentTx<'_>, delta: &Delta) -> Result<Tab, CommandError> {
        let command = self.name();
        let tab_id = delta.tab_id.ok_or(CommandError::MissingReference { command, what: "tab" })?;
        doc.tab(tab_id)?.ok_or(CommandError::MissingReference { command, what: "tab" })
    }
}

impl Command for ReorderSteps {
    fn name(&self) -> CommandName {
        CommandName::ReorderSteps
    }

    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        let CommandArgs::ReorderSteps { tab_slug, new_order } = args else {
            return Err(mismatch(self.name(), args));
        };

        let tab = require_live_tab(doc, tab_slug)?;
        let steps = doc.live_steps(tab.id)?;
        let current: Vec<&str> = steps.iter().map(|step| step.slug.as_str()).collect();
        check_permutation(&current, new_order)?;

        let Some(first_moved) =
            current.iter().zip(new_order).position(|(old, new)| *old != new.as_str())
        else {
            return Ok(None);
        };

        let new_ids: Vec<StepId> = new_order
            .iter()
            .filter_map(|slug| steps.iter().find(|step| step.slug == *slug))
            .map(|step| step.id)
            .collect();
        let old_ids: Vec<StepId> = steps.iter().map(|step| step.id).collect();

        let refs = downstream_of(doc, catalog, &tab, first_moved as i64)?;
        Ok(Some(
            encode_payload(self.name(), &StepOrder { step_ids: new_ids }, &StepOrder { step_ids: old_ids })?
                .with_tab(tab.id)
                .with_step_delta_ids(refs),
        ))
    }

    fn forward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        self.apply(doc, &delta.values_for_forward)?;
        affected::stamp(doc, delta)?;
        Ok(())
    }

    fn backward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        self.apply(doc, &delta.values_for_backward)?;
        affected::restore(doc, delta)?;
        Ok(())
    }

    fn notification_payload(&self, doc: &DocumentTx<'_>, delta: &Delta) -> Result<ClientUpdate, CommandError> {
        let tab = self.tab(doc, delta)?;
        let update = with_tab_steps(ClientUpdate::for_workflow(doc.workflow()), doc, &tab)?;
        Ok(affected::describe(update, doc, delta)?)
    }
}

// ── SetStepParams ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Params {
    params: Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetStepParams;

impl Command for SetStepParams {
    fn name(&self) -> CommandName {
        CommandName::SetStepParams
    }

    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        let CommandArgs::SetStepParams { step_slug, params } = args else {
            return Err(mismatch(self.name(), args));
        };

        if !params.is_object() {
            return Err(ValidationError::ParamsNotObject.into());
        }
        let (step, tab) = require_live_step(doc, step_slug)?;
        if &step.params == params {
            return Ok(None);
        }

        let refs = downstream_of(doc, catalog, &tab, step.position)?;
        Ok(Some(
            encode_payload(self.name(), &Params { params: params.clone() }, &Params { params: step.params })?
                .with_step(step.id)
                .with_step_delta_ids(refs),
        ))
    }

    fn forward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let Params { params } = decode_payload(self.name(), &delta.values_for_forward)?;
        doc.set_step_params(entry_step(self.name(), delta)?, &params)?;
        affected::stamp(doc, delta)?;
        Ok(())
    }

    fn backward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let Params { params } = decode_payload(self.name(), &delta.values_for_backward)?;
        doc.set_step_params(entry_step(self.name(), delta)?, &params)?;
        affected::restore(doc, delta)?;
        Ok(())
    }

    fn notification_payload(&self, doc: &DocumentTx<'_>, delta: &Delta) -> Result<ClientUpdate, CommandError> {
        let (step, _) = entry_step_and_tab(self.name(), doc, delta)?;
        let update = ClientUpdate::for_workflow(doc.workflow())
            .update_step(step.id, |out| out.params = Some(step.params.clone()));
        Ok(affected::describe(update, doc, delta)?)
    }
}

// ── SetStepNote ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Note {
    note: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetStepNote;

impl Command for SetStepNote {
    fn name(&self) -> CommandName {
        CommandName::SetStepNote
    }

    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        _catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        let CommandArgs::SetStepNote { step_slug, new_value } = args else {
            return Err(mismatch(self.name(), args));
        };

        let (step, _) = require_live_step(doc, step_slug)?;
        if &step.notes == new_value {
            return Ok(None);
        }

        Ok(Some(
            encode_payload(self.name(), &Note { note: new_value.clone() }, &Note { note: step.notes })?
                .with_step(step.id),
        ))
    }

    fn forward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let Note { note } = decode_payload(self.name(), &delta.values_for_forward)?;
        doc.set_step_notes(entry_step(self.name(), delta)?, &note)?;
        Ok(())
    }

    fn backward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let Note { note } = decode_payload(self.name(), &delta.values_for_backward)?;
        doc.set_step_notes(entry_step(self.name(), delta)?, &note)?;
        Ok(())
    }

    fn notification_payload(&self, doc: &DocumentTx<'_>, delta: &Delta) -> Result<ClientUpdate, CommandError> {
        let (step, _) = entry_step_and_tab(self.name(), doc, delta)?;
        Ok(ClientUpdate::for_workflow(doc.workflow()).update_step(step.id, |out| out.notes = Some(step.notes)))
    }

    fn modifies_render_output(&self, _delta: &Delta) -> bool {
        false
    }
}

// ── SetStepDataVersion ──────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct DataVersion {
    version: Option<DateTime<Utc>>,
}

/// Points a step at a different stored data version, typically after a
/// background fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetStepDataVersion;

impl Command for SetStepDataVersion {
    fn name(&self) -> CommandName {
        CommandName::SetStepDataVersion
    }

    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        let CommandArgs::SetStepDataVersion { step_slug, new_version } = args else {
            return Err(mismatch(self.name(), args));
        };

        let (step, tab) = require_live_step(doc, step_slug)?;
        if step.stored_data_version == Some(*new_version) {
            return Ok(None);
        }

        let refs = downstream_of(doc, catalog, &tab, step.position)?;
        Ok(Some(
            encode_payload(
                self.name(),
                &DataVersion { version: Some(*new_version) },
                &DataVersion { version: step.stored_data_version },
            )?
            .with_step(step.id)
            .with_step_delta_ids(refs),
        ))
    }

    fn forward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let DataVersion { version } = decode_payload(self.name(), &delta.values_for_forward)?;
        doc.set_step_data_version(entry_step(self.name(), delta)?, version)?;
        affected::stamp(doc, delta)?;
        Ok(())
    }

    fn backward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let DataVersion { version } = decode_payload(self.name(), &delta.values_for_backward)?;
        doc.set_step_data_version(entry_step(self.name(), delta)?, version)?;
        affected::restore(doc, delta)?;
        Ok(())
    }

    fn notification_payload(&self, doc: &DocumentTx<'_>, delta: &Delta) -> Result<ClientUpdate, CommandError> {
        let (step, _) = entry_step_and_tab(self.name(), doc, delta)?;
        let update = ClientUpdate::for_workflow(doc.workflow())
            .update_step(step.id, |out| out.stored_data_version = step.stored_data_version);
        Ok(affected::describe(update, doc, delta)?)
    }

    fn triggers_data_refresh(&self) -> bool {
        true
    }
}
