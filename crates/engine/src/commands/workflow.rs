use serde::{Deserialize, Serialize};
use workbench_common::command::{CommandArgs, CommandName};
use workbench_common::module::ModuleCatalog;
use workbench_common::protocol::update::ClientUpdate;
use workbench_common::types::Delta;

use crate::error::{CommandError, ValidationError};
use crate::store::DocumentTx;

use super::{decode_payload, encode_payload, mismatch, Command, NewDelta};

/// First entry of every chain. Written when the workflow is created; never
/// created by callers and never undone.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitWorkflow;

impl Command for InitWorkflow {
    fn name(&self) -> CommandName {
        CommandName::InitWorkflow
    }

    fn amend_create_args(
        &self,
        _doc: &DocumentTx<'_>,
        _catalog: &ModuleCatalog,
        _args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        Err(ValidationError::NotCreatable(CommandName::InitWorkflow).into())
    }

    fn forward(&self, _doc: &mut DocumentTx<'_>, _delta: &Delta) -> Result<(), CommandError> {
        Ok(())
    }

    fn backward(&self, _doc: &mut DocumentTx<'_>, _delta: &Delta) -> Result<(), CommandError> {
        Ok(())
    }

    fn notification_payload(&self, doc: &DocumentTx<'_>, _delta: &Delta) -> Result<ClientUpdate, CommandError> {
        Ok(ClientUpdate::for_workflow(doc.workflow()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Title {
    title: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetWorkflowTitle;

impl SetWorkflowTitle {
    fn apply(&self, doc: &mut DocumentTx<'_>, payload: &serde_json::Value) -> Result<(), CommandError> {
        let Title { title } = decode_payload(self.name(), payload)?;
        doc.set_workflow_name(&title)?;
        Ok(())
    }
}

impl Command for SetWorkflowTitle {
    fn name(&self) -> CommandName {
        CommandName::SetWorkflowTitle
    }

    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        _catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError> {
        let CommandArgs::SetWorkflowTitle { new_value } = args else {
            return Err(mismatch(self.name(), args));
        };

        let old_value = &doc.workflow().name;
        if old_value == new_value {
            return Ok(None);
        }

        encode_payload(
            self.name(),
            &Title { title: new_value.clone() },
            &Title { title: old_value.clone() },
        )
        .map(Some)
    }

    fn forward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        self.apply(doc, &delta.values_for_forward)
    }

    fn backward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError> {
        self.apply(doc, &delta.values_for_backward)
    }

    fn notification_payload(&self, doc: &DocumentTx<'_>, _delta: &Delta) -> Result<ClientUpdate, CommandError> {
        let name = doc.workflow().name.clone();
        Ok(ClientUpdate::for_workflow(doc.workflow()).update_workflow(|workflow| workflow.name = Some(name)))
    }
}
