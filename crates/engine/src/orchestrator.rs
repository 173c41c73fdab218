// do / undo / redo.
//
// Each operation has two phases. The mutation phase runs on a blocking thread
// under the document lock and either commits or rolls back as a whole. The
// delivery phase runs afterwards without the lock: notify collaborators, then
// (maybe) ask for a render. Notification always goes out first.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use workbench_common::command::CommandArgs;
use workbench_common::module::ModuleCatalog;
use workbench_common::protocol::update::ClientUpdate;
use workbench_common::types::{CursorState, Delta, DeltaId, WorkflowId};

use crate::clock::Clock;
use crate::commands::CommandRegistry;
use crate::error::EngineError;
use crate::notify::Collaborators;
use crate::reaper;
use crate::store::{DocumentTx, Store};

const COMMIT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryAction {
    Do,
    Undo,
    Redo,
}

impl HistoryAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Do => "do",
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }
}

/// Published once a history change has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub workflow_id: WorkflowId,
    pub action: HistoryAction,
    pub delta_id: DeltaId,
    pub head_delta_id: Option<DeltaId>,
}

/// Result of a committed mutation, handed to the delivery phase.
#[derive(Debug)]
struct Applied {
    delta: Delta,
    update: ClientUpdate,
    render_delta_id: Option<DeltaId>,
    data_refresh: bool,
}

/// Everything the mutation phase needs, shareable with a blocking thread.
#[derive(Debug)]
struct Core {
    store: Arc<Store>,
    registry: Arc<CommandRegistry>,
    catalog: Arc<ModuleCatalog>,
    clock: Arc<dyn Clock>,
    commits: broadcast::Sender<CommitEvent>,
}

/// The single entry point for mutating a workflow.
pub struct Orchestrator {
    core: Arc<Core>,
    collaborators: Arc<dyn Collaborators>,
}

impl Orchestrator {
    /// Fails with `UnknownCommand` if stored history names a command the
    /// registry cannot resolve.
    pub fn new(
        store: Arc<Store>,
        registry: Arc<CommandRegistry>,
        catalog: Arc<ModuleCatalog>,
        collaborators: Arc<dyn Collaborators>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let persisted = store.persisted_command_names()?;
        registry.verify(persisted.iter().map(String::as_str))?;

        let (commits, _) = broadcast::channel(COMMIT_EVENT_CAPACITY);
        Ok(Self { core: Arc::new(Core { store, registry, catalog, clock, commits }), collaborators })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.core.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommitEvent> {
        self.core.commits.subscribe()
    }

    /// Apply a new command. Returns `None` when the command would change
    /// nothing.
    pub async fn do_command(
        &self,
        workflow_id: WorkflowId,
        args: CommandArgs,
        mutation_id: Option<String>,
    ) -> Result<Option<Delta>, EngineError> {
        let command = args.command_name();
        let span = info_span!("engine.orchestrator.do", workflow_id, command = %command);
        async {
            let core = Arc::clone(&self.core);
            let applied =
                run_blocking(move || core.apply_do(workflow_id, &args, mutation_id)).await?;
            self.deliver(workflow_id, applied).await
        }
        .instrument(span)
        .await
    }

    /// Revert the entry at the cursor. `None` when there is nothing to undo.
    pub async fn undo(&self, workflow_id: WorkflowId) -> Result<Option<Delta>, EngineError> {
        let span = info_span!("engine.orchestrator.undo", workflow_id);
        async {
            let core = Arc::clone(&self.core);
            let applied = run_blocking(move || core.apply_undo(workflow_id)).await?;
            self.deliver(workflow_id, applied).await
        }
        .instrument(span)
        .await
    }

    /// Re-apply the entry just past the cursor. `None` when there is nothing
    /// to redo.
    pub async fn redo(&self, workflow_id: WorkflowId) -> Result<Option<Delta>, EngineError> {
        let span = info_span!("engine.orchestrator.redo", workflow_id);
        async {
            let core = Arc::clone(&self.core);
            let applied = run_blocking(move || core.apply_redo(workflow_id)).await?;
            self.deliver(workflow_id, applied).await
        }
        .instrument(span)
        .await
    }

    async fn deliver(
        &self,
        workflow_id: WorkflowId,
        applied: Option<Applied>,
    ) -> Result<Option<Delta>, EngineError> {
        let Some(applied) = applied else {
            return Ok(None);
        };

        if let Err(error) = self.collaborators.notify(workflow_id, applied.update).await {
            warn!(workflow_id, error = %error, "failed to notify collaborators");
        }

        if let Some(render_delta_id) = applied.render_delta_id {
            let eager = !applied.data_refresh
                || self.collaborators.has_notification_subscribers(workflow_id).await
                || self.collaborators.has_active_viewers(workflow_id).await;
            if eager {
                if let Err(error) = self.collaborators.request_render(workflow_id, render_delta_id).await {
                    warn!(workflow_id, delta_id = render_delta_id, error = %error, "failed to request render");
                }
            } else {
                debug!(workflow_id, delta_id = render_delta_id, "render deferred until someone is watching");
            }
        }

        Ok(Some(applied.delta))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").field("core", &self.core).finish_non_exhaustive()
    }
}

/// Run a mutation on the blocking pool, keeping the caller's span.
async fn run_blocking<T, F>(body: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    let span = Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(body)).await?
}

impl Core {
    fn apply_do(
        &self,
        workflow_id: WorkflowId,
        args: &CommandArgs,
        mutation_id: Option<String>,
    ) -> Result<Option<Applied>, EngineError> {
        self.store.with_document_lock(workflow_id, |doc| {
            let name = args.command_name();
            let command = self.registry.resolve(name.as_str())?;

            let Some(new_delta) = command.amend_create_args(doc, &self.catalog, args)? else {
                debug!(workflow_id, command = %name, "command is a no-op");
                return Ok(None);
            };

            let head = doc.workflow().head_delta_id;
            let superseded = match doc.cursor_state()? {
                CursorState::MidChain => reaper::trim_superseded(doc, head)?,
                CursorState::AtHead => 0,
            };
            // Rows only the discarded entries held go before staging, so a
            // staged row can reuse their slug.
            if superseded > 0 {
                doc.delete_orphans()?;
            }

            let prev_delta_id = doc.head_delta()?.map(|delta| delta.id);
            let pending = new_delta.into_pending(name, doc)?;
            let now = self.clock.now();
            let delta = doc.insert_delta(&pending, prev_delta_id, now)?;
            command.forward(doc, &delta)?;
            doc.set_head(Some(delta.id))?;
            doc.touch_workflow(now)?;

            let mut update = command.notification_payload(doc, &delta)?;
            if let Some(mutation_id) = mutation_id {
                update = update.with_mutation_id(mutation_id);
            }
            let render_delta_id = command.modifies_render_output(&delta).then_some(delta.id);

            info!(workflow_id, delta_id = delta.id, command = %name, superseded, "applied command");
            self.publish_on_commit(doc, HistoryAction::Do, delta.id);
            Ok(Some(Applied { delta, update, render_delta_id, data_refresh: command.triggers_data_refresh() }))
        })
    }

    fn apply_undo(&self, workflow_id: WorkflowId) -> Result<Option<Applied>, EngineError> {
        self.store.with_document_lock(workflow_id, |doc| {
            let Some(delta) = doc.undo_target()? else {
                debug!(workflow_id, "nothing to undo");
                return Ok(None);
            };
            let command = self.registry.resolve(&delta.command_name)?;

            command.backward(doc, &delta)?;
            doc.set_head(delta.prev_delta_id)?;
            let now = self.clock.now();
            doc.touch_delta(delta.id, now)?;
            doc.touch_workflow(now)?;

            let update = command.notification_payload(doc, &delta)?;
            // The render that matters now is the one for the restored head.
            let render_delta_id = if command.modifies_render_output(&delta) { delta.prev_delta_id } else { None };

            info!(workflow_id, delta_id = delta.id, command = %delta.command_name, "undid command");
            self.publish_on_commit(doc, HistoryAction::Undo, delta.id);
            Ok(Some(Applied { delta, update, render_delta_id, data_refresh: command.triggers_data_refresh() }))
        })
    }

    fn apply_redo(&self, workflow_id: WorkflowId) -> Result<Option<Applied>, EngineError> {
        self.store.with_document_lock(workflow_id, |doc| {
            let Some(delta) = doc.redo_target()? else {
                debug!(workflow_id, "nothing to redo");
                return Ok(None);
            };
            let command = self.registry.resolve(&delta.command_name)?;

            command.forward(doc, &delta)?;
            doc.set_head(Some(delta.id))?;
            let now = self.clock.now();
            doc.touch_delta(delta.id, now)?;
            doc.touch_workflow(now)?;

            let update = command.notification_payload(doc, &delta)?;
            let render_delta_id = command.modifies_render_output(&delta).then_some(delta.id);

            info!(workflow_id, delta_id = delta.id, command = %delta.command_name, "redid command");
            self.publish_on_commit(doc, HistoryAction::Redo, delta.id);
            Ok(Some(Applied { delta, update, render_delta_id, data_refresh: command.triggers_data_refresh() }))
        })
    }

    fn publish_on_commit(&self, doc: &mut DocumentTx<'_>, action: HistoryAction, delta_id: DeltaId) {
        let event = CommitEvent {
            workflow_id: doc.workflow_id(),
            action,
            delta_id,
            head_delta_id: doc.workflow().head_delta_id,
        };
        let commits = self.commits.clone();
        doc.on_commit(move || {
            // No subscribers is fine.
            let _ = commits.send(event);
        });
    }
}
