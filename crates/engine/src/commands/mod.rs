// Command registry and the `Command` capability every history entry is
// dispatched through.
//
// A command never touches the lock itself: the orchestrator hands it a
// `DocumentTx` that is already held.

mod affected;
mod steps;
mod tabs;
mod workflow;

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use workbench_common::command::{CommandArgs, CommandName};
use workbench_common::module::ModuleCatalog;
use workbench_common::protocol::update::ClientUpdate;
use workbench_common::types::{Delta, StepDeltaRef, StepId, TabId};

use crate::error::CommandError;
use crate::store::deltas::PendingDelta;
use crate::store::DocumentTx;

pub use steps::{AddStep, DeleteStep, ReorderSteps, SetStepDataVersion, SetStepNote, SetStepParams};
pub use tabs::{AddTab, DeleteTab, ReorderTabs, SetTabName};
pub use workflow::{InitWorkflow, SetWorkflowTitle};

/// A row a creation command needs before its entry can be written. The
/// orchestrator inserts it soft-deleted; `forward` reveals it.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedRow {
    Tab { slug: String, name: String, position: i64 },
    Step { tab_id: TabId, slug: String, module_id_name: String, position: i64, params: Value },
}

/// What `amend_create_args` asks the orchestrator to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDelta {
    pub values_for_forward: Value,
    pub values_for_backward: Value,
    pub tab_id: Option<TabId>,
    pub step_id: Option<StepId>,
    pub step_delta_ids: Vec<StepDeltaRef>,
    pub stage: Option<StagedRow>,
}

impl NewDelta {
    pub fn new(forward: &impl Serialize, backward: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            values_for_forward: serde_json::to_value(forward)?,
            values_for_backward: serde_json::to_value(backward)?,
            tab_id: None,
            step_id: None,
            step_delta_ids: Vec::new(),
            stage: None,
        })
    }

    pub fn with_tab(mut self, tab_id: TabId) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    pub fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_step_delta_ids(mut self, refs: Vec<StepDeltaRef>) -> Self {
        self.step_delta_ids = refs;
        self
    }

    pub fn staging(mut self, row: StagedRow) -> Self {
        self.stage = Some(row);
        self
    }

    /// Stage the creation row if any, then describe the entry to insert.
    pub(crate) fn into_pending(
        self,
        command_name: CommandName,
        doc: &mut DocumentTx<'_>,
    ) -> Result<PendingDelta, CommandError> {
        let mut tab_id = self.tab_id;
        let mut step_id = self.step_id;

        match self.stage {
            Some(StagedRow::Tab { slug, name, position }) => {
                tab_id = Some(doc.stage_tab(&slug, &name, position)?);
            }
            Some(StagedRow::Step { tab_id: parent, slug, module_id_name, position, params }) => {
                step_id = Some(doc.stage_step(parent, &slug, &module_id_name, position, &params)?);
                tab_id = Some(parent);
            }
            None => {}
        }

        Ok(PendingDelta {
            command_name,
            values_for_forward: self.values_for_forward,
            values_for_backward: self.values_for_backward,
            tab_id,
            step_id,
            step_delta_ids: self.step_delta_ids,
        })
    }
}

/// The forward/backward logic bound to a history entry by its stored name.
pub trait Command: Send + Sync {
    fn name(&self) -> CommandName;

    /// Validate `args` against the current document and describe the entry
    /// to create. `Ok(None)` means the command would change nothing.
    fn amend_create_args(
        &self,
        doc: &DocumentTx<'_>,
        catalog: &ModuleCatalog,
        args: &CommandArgs,
    ) -> Result<Option<NewDelta>, CommandError>;

    fn forward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError>;

    fn backward(&self, doc: &mut DocumentTx<'_>, delta: &Delta) -> Result<(), CommandError>;

    /// Payload for collaborators, read from the document as it stands now.
    fn notification_payload(&self, doc: &DocumentTx<'_>, delta: &Delta) -> Result<ClientUpdate, CommandError>;

    fn modifies_render_output(&self, delta: &Delta) -> bool {
        !delta.step_delta_ids.is_empty()
    }

    /// Data-refresh commands only render eagerly when someone is watching.
    fn triggers_data_refresh(&self) -> bool {
        false
    }
}

#[derive(Debug, Error)]
#[error("unknown command {0:?}")]
pub struct UnknownCommand(pub String);

/// Maps persisted command names to their implementations.
pub struct CommandRegistry {
    commands: HashMap<&'static str, Box<dyn Command>>,
}

impl CommandRegistry {
    pub fn empty() -> Self {
        Self { commands: HashMap::new() }
    }

    /// Every built-in command, checked against `CommandName::ALL`.
    pub fn builtin() -> Result<Self, UnknownCommand> {
        let mut registry = Self::empty();
        registry.register(Box::new(InitWorkflow));
        registry.register(Box::new(SetWorkflowTitle));
        registry.register(Box::new(AddTab));
        registry.register(Box::new(DeleteTab));
        registry.register(Box::new(SetTabName));
        registry.register(Box::new(ReorderTabs));
        registry.register(Box::new(AddStep));
        registry.register(Box::new(DeleteStep));
        registry.register(Box::new(ReorderSteps));
        registry.register(Box::new(SetStepParams));
        registry.register(Box::new(SetStepNote));
        registry.register(Box::new(SetStepDataVersion));

        for name in CommandName::ALL {
            registry.resolve(name.as_str())?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, command: Box<dyn Command>) {
        self.commands.insert(command.name().as_str(), command);
    }

    pub fn resolve(&self, name: &str) -> Result<&dyn Command, UnknownCommand> {
        self.commands.get(name).map(|command| command.as_ref()).ok_or_else(|| UnknownCommand(name.to_owned()))
    }

    /// Fail on the first name that does not resolve.
    pub fn verify<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<(), UnknownCommand> {
        for name in names {
            self.resolve(name)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.commands.keys().collect();
        names.sort();
        f.debug_struct("CommandRegistry").field("commands", &names).finish()
    }
}

pub(crate) fn decode_payload<T: DeserializeOwned>(command: CommandName, value: &Value) -> Result<T, CommandError> {
    serde_json::from_value(value.clone()).map_err(|source| CommandError::Payload { command, source })
}

pub(crate) fn encode_payload(command: CommandName, forward: &impl Serialize, backward: &impl Serialize) -> Result<NewDelta, CommandError> {
    NewDelta::new(forward, backward).map_err(|source| CommandError::Payload { command, source })
}

pub(crate) fn mismatch(command: CommandName, args: &CommandArgs) -> CommandError {
    CommandError::ArgsMismatch { command, received: args.command_name() }
}
