use serde::{Deserialize, Serialize};
use workbench_common::command::{CommandArgs, CommandName};
use workbench_common::module::ModuleCatalog;
use workbench_common::protocol::update::ClientUpdate;
use workbench_common::slug::{first_duplicate, validate_slug};
use workbench_common::types::{Delta, Tab, TabId};

use crate::error::{CommandError, ValidationError};
use crate::graph::DependencyGraph;
use crate::store::DocumentTx;

use super::{affected, decode_payload, encode_payload, mismatch, Command, NewDelta, StagedRow};

pub(super) fn check_slug(slug: &str) -> Result<(), ValidationError> {
    validate_slug(slug)
        .map(|_| ())
        .map_err(|source| ValidationError::InvalidSlug { slug: slug.to_owned(), source })
}

pub(super) fn require_live_tab(doc: &DocumentTx<'_>, slug: &str) -> Result<Tab, CommandError> {
    doc.live_tab_by_slug(slug)?.ok_or_else(|| ValidationError::TabNotFound(slug.to_owned()).into())
}

fn entry_tab(command: CommandName, delta: &Delta) -> Result<TabId, CommandError> {
    delta.tab_id.ok_or(CommandError::MissingReference { command, what: "tab" })
}

/// Tab order and selection, which every tab-structure change reports.
fn tab_list_update(doc: &DocumentTx<'_>) -> Result<ClientUpdate, CommandError> {
    let slugs: Vec<String> = doc.live_tabs()?.into_iter().map(|tab| tab.slug).collect();
    let selected = doc.workflow().selected_tab_position;
    Ok(ClientUpdate::for_workflow(doc.workflow()).update_workflow(|workflow| {
        workflow.tab_slugs = Some(slugs);
        workflow.selected_tab_position = selected;
    }))
}

/// Full tab description, or a clear if the tab is gone.
fn describe_tab(update: ClientUpdate, doc: &DocumentTx<'_>, tab: &Tab) -> Result<ClientUpdate, CommandError> {
    if tab.is_deleted {
        return Ok(update.clear_tab(&tab.slug));
    }
    let step_ids = doc.live_steps(tab.id)?.into_iter().map(|step| step.id).collect();
    let name = tab.name.clone();
    Ok(update.update_tab(&tab.slug, |out| {
        out.name = Some(name);
        out.step_ids = Some(step_ids);
    }))
}

#[derive(Debug, Serialize, Deserialize)]
struct Placement {
    position: i64,
    selected_tab_position: Option<i64>,
}

// ── AddTab ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct AddTab;

impl Command for AddTab {
    fn name(&self) -> CommandName {
        CommandName::AddTab
    }

    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        let CommandArgs::AddTab { slug, name } = args else {
            return Err(mismatch(self.name(), args));
        };

        check_slug(slug)?;
        if doc.tab_slug_in_use(slug)? {
            return Err(ValidationError::DuplicateTabSlug(slug.clone()).into());
        }

        let position = doc.live_tabs()?.len() as i64;
        // Steps that already name this slug start reading a real tab.
        let graph = DependencyGraph::load_from_workflow(doc, catalog)?;
        let refs = affected::snapshot(doc, graph.affected_steps([slug.as_str()]))?;

        let forward = Placement { position, selected_tab_position: Some(position) };
        let backward = Placement { position, selected_tab_position: doc.workflow().selected_tab_position };
        Ok(Some(
            encode_payload(self.name(), &forward, &backward)?
                .with_step_delta_ids(refs)
                .staging(StagedRow::Tab { slug: slug.clone(), name: name.clone(), position }),
        ))
    }

    fn forward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let tab_id = entry_tab(self.name(), delta)?;
        let placement: Placement = decode_payload(self.name(), &delta.values_for_forward)?;

        doc.shift_tabs(placement.position, 1)?;
        doc.set_tab_position(tab_id, placement.position)?;
        doc.set_tab_deleted(tab_id, false)?;
        doc.set_selected_tab_position(placement.selected_tab_position)?;
        affected::stamp(doc, delta)?;
        Ok(())
    }

    fn backward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let tab_id = entry_tab(self.name(), delta)?;
        let placement: Placement = decode_payload(self.name(), &delta.values_for_backward)?;

        doc.set_tab_deleted(tab_id, true)?;
        doc.shift_tabs(placement.position + 1, -1)?;
        doc.set_selected_tab_position(placement.selected_tab_position)?;
        affected::restore(doc, delta)?;
        Ok(())
    }

    fn notification_payload(&self, doc: &DocumentTx<'_>, delta: &Delta) -> Result<ClientUpdate, CommandError> {
        let update = tab_list_update(doc)?;
        let update = match doc.tab(entry_tab(self.name(), delta)?)? {
            Some(tab) => describe_tab(update, doc, &tab)?,
            None => update,
        };
        Ok(affected::describe(update, doc, delta)?)
    }
}

// ── DeleteTab ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteTab;

impl Command for DeleteTab {
    fn name(&self) -> CommandName {
        CommandName::DeleteTab
    }

    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        let CommandArgs::DeleteTab { slug } = args else {
            return Err(mismatch(self.name(), args));
        };

        let tab = require_live_tab(doc, slug)?;
        if doc.live_tabs()?.len() <= 1 {
            // A workflow always keeps one tab.
            return Ok(None);
        }

        let old_selected = doc.workflow().selected_tab_position;
        let new_selected = match old_selected {
            Some(selected) if selected >= tab.position && selected > 0 => Some(selected - 1),
            other => other,
        };

        let graph = DependencyGraph::load_from_workflow(doc, catalog)?;
        let refs = affected::snapshot(doc, graph.affected_steps([tab.slug.as_str()]))?;

        let forward = Placement { position: tab.position, selected_tab_position: new_selected };
        let backward = Placement { position: tab.position, selected_tab_position: old_selected };
        Ok(Some(encode_payload(self.name(), &forward, &backward)?.with_tab(tab.id).with_step_delta_ids(refs)))
    }

    fn forward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let tab_id = entry_tab(self.name(), delta)?;
        let placement: Placement = decode_payload(self.name(), &delta.values_for_forward)?;

        doc.set_tab_deleted(tab_id, true)?;
        doc.shift_tabs(placement.position + 1, -1)?;
        doc.set_selected_tab_position(placement.selected_tab_position)?;
        affected::stamp(doc, delta)?;
        Ok(())
    }

    fn backward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let tab_id = entry_tab(self.name(), delta)?;
        let placement: Placement = decode_payload(self.name(), &delta.values_for_backward)?;

        doc.shift_tabs(placement.position, 1)?;
        doc.set_tab_position(tab_id, placement.position)?;
        doc.set_tab_deleted(tab_id, false)?;
        doc.set_selected_tab_position(placement.selected_tab_position)?;
        affected::restore(doc, delta)?;
        Ok(())
    }

    fn notification_payload(&self, doc: &DocumentTx<'_>, delta: &Delta) -> Result<ClientUpdate, CommandError> {
        let update = tab_list_update(doc)?;
        let update = match doc.tab(entry_tab(self.name(), delta)?)? {
            Some(tab) => describe_tab(update, doc, &tab)?,
            None => update,
        };
        Ok(affected::describe(update, doc, delta)?)
    }
}

// ── SetTabName ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct TabName {
    name: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetTabName;

impl Command for SetTabName {
    fn name(&self) -> CommandName {
        CommandName::SetTabName
    }

    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        _catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        let CommandArgs::SetTabName { slug, new_name } = args else {
            return Err(mismatch(self.name(), args));
        };

        let tab = require_live_tab(doc, slug)?;
        if &tab.name == new_name {
            return Ok(None);
        }

        Ok(Some(
            encode_payload(self.name(), &TabName { name: new_name.clone() }, &TabName { name: tab.name })?
                .with_tab(tab.id),
        ))
    }

    fn forward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let TabName { name } = decode_payload(self.name(), &delta.values_for_forward)?;
        doc.set_tab_name(entry_tab(self.name(), delta)?, &name)?;
        Ok(())
    }

    fn backward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        let TabName { name } = decode_payload(self.name(), &delta.values_for_backward)?;
        doc.set_tab_name(entry_tab(self.name(), delta)?, &name)?;
        Ok(())
    }

    fn notification_payload(&self, doc: &DocumentTx<'_>, delta: &Delta) -> Result<ClientUpdate, CommandError> {
        let update = ClientUpdate::for_workflow(doc.workflow());
        match doc.tab(entry_tab(self.name(), delta)?)? {
            Some(tab) if !tab.is_deleted => {
                Ok(update.update_tab(&tab.slug, |out| out.name = Some(tab.name.clone())))
            }
            _ => Ok(update),
        }
    }
}

// ── ReorderTabs ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct TabOrder {
    tab_ids: Vec<TabId>,
    selected_tab_position: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReorderTabs;

impl ReorderTabs {
    fn apply(&self, doc: &mut DocumentTx<'_>, payload: &serde_json::Value) -> Result<(), CommandError> {
        let order: TabOrder = decode_payload(self.name(), payload)?;
        for (position, tab_id) in order.tab_ids.iter().enumerate() {
            doc.set_tab_position(*tab_id, position as i64)?;
        }
        doc.set_selected_tab_position(order.selected_tab_position)?;
        Ok(())
    }
}

/// Check `new_order` is a permutation of `current` slugs.
pub(super) fn check_permutation(current: &[&str], new_order: &[String]) -> Result<(), ValidationError> {
    if let Some(duplicate) = first_duplicate(new_order.iter().map(String::as_str)) {
        return Err(ValidationError::DuplicateInOrder(duplicate.to_owned()));
    }
    if let Some(unknown) = new_order.iter().find(|slug| !current.contains(&slug.as_str())) {
        return Err(ValidationError::UnknownInOrder(unknown.clone()));
    }
    if new_order.len() != current.len() {
        return Err(ValidationError::WrongCount { expected: current.len(), actual: new_order.len() });
    }
    Ok(())
}

impl Command for ReorderTabs {
    fn name(&self) -> CommandName {
        CommandName::ReorderTabs
    }

    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        let CommandArgs::ReorderTabs { new_order } = args else {
            return Err(mismatch(self.name(), args));
        };

        let tabs = doc.live_tabs()?;
        let current: Vec<&str> = tabs.iter().map(|tab| tab.slug.as_str()).collect();
        check_permutation(&current, new_order)?;
        if current.iter().zip(new_order).all(|(old, new)| *old == new.as_str()) {
            return Ok(None);
        }

        let by_slug = |slug: &str| tabs.iter().find(|tab| tab.slug == slug);
        let new_ids: Vec<TabId> = new_order.iter().filter_map(|slug| by_slug(slug.as_str())).map(|tab| tab.id).collect();
        let old_ids: Vec<TabId> = tabs.iter().map(|tab| tab.id).collect();

        // The selection follows the selected tab to its new position.
        let old_selected = doc.workflow().selected_tab_position;
        let new_selected = old_selected
            .and_then(|position| old_ids.get(usize::try_from(position).ok()?))
            .and_then(|selected_id| new_ids.iter().position(|id| id == selected_id))
            .map(|position| position as i64)
            .or(old_selected);

        let moved: Vec<&str> = new_order
            .iter()
            .enumerate()
            .filter(|(position, slug)| current.get(*position) != Some(&slug.as_str()))
            .map(|(_, slug)| slug.as_str())
            .collect();
        let graph = DependencyGraph::load_from_workflow(doc, catalog)?;
        let refs = affected::snapshot(doc, graph.affected_steps(moved))?;

        let forward = TabOrder { tab_ids: new_ids, selected_tab_position: new_selected };
        let backward = TabOrder { tab_ids: old_ids, selected_tab_position: old_selected };
        Ok(Some(encode_payload(self.name(), &forward, &backward)?.with_step_delta_ids(refs)))
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
        Ok(affected::describe(tab_list_update(doc)?, doc, delta)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(slugs: &[&str]) -> Vec<String> {
        slugs.iter().map(|slug| (*slug).to_owned()).collect()
    }

    #[test]
    fn permutation_accepts_reordering() {
        assert_eq!(check_permutation(&["a", "b", "c"], &order(&["c", "a", "b"])), Ok(()));
    }

    #[test]
    fn permutation_rejects_duplicates_first() {
        assert_eq!(
            check_permutation(&["a", "b"], &order(&["a", "a", "b"])),
            Err(ValidationError::DuplicateInOrder("a".into()))
        );
    }

    #[test]
    fn permutation_rejects_missing_and_unknown_entries() {
        assert_eq!(
            check_permutation(&["a", "b", "c"], &order(&["a", "b"])),
            Err(ValidationError::WrongCount { expected: 3, actual: 2 })
        );
        assert_eq!(
            check_permutation(&["a", "b"], &order(&["a", "z"])),
            Err(ValidationError::UnknownInOrder("z".into()))
        );
    }

    #[test]
    fn bad_slugs_are_validation_errors() {
        assert!(matches!(check_slug("tab one"), Err(ValidationError::InvalidSlug { .. })));
        assert_eq!(check_slug("tab-1"), Ok(()));
    }
}
