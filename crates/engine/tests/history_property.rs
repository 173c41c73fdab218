use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};
use workbench_common::command::CommandArgs;
use workbench_common::module::{ModuleCatalog, ModuleSpec, ParamKind, ParamSpec};
use workbench_common::types::{DeltaId, WorkflowId};
use workbench_engine::clock::ManualClock;
use workbench_engine::config::RetentionConfig;
use workbench_engine::notify::ChannelCollaborators;
use workbench_engine::reaper::Reaper;
use workbench_engine::{CommandRegistry, Orchestrator, Store};

const MAX_AGE_DAYS: u32 = 30;

#[derive(Debug, Clone)]
enum Op {
    Title(u8),
    AddTab,
    DeleteTab(usize),
    RenameTab(usize, u8),
    RotateTabs(usize),
    AddStep { tab: usize, position: usize, reads: Option<usize> },
    DeleteStep(usize),
    SetNote(usize, u8),
    Undo,
    Redo,
    Age(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<u8>().prop_map(Op::Title),
        Just(Op::AddTab),
        any::<usize>().prop_map(Op::DeleteTab),
        (any::<usize>(), any::<u8>()).prop_map(|(tab, name)| Op::RenameTab(tab, name)),
        (1usize..4).prop_map(Op::RotateTabs),
        (any::<usize>(), any::<usize>(), proptest::option::of(any::<usize>()))
            .prop_map(|(tab, position, reads)| Op::AddStep { tab, position, reads }),
        any::<usize>().prop_map(Op::DeleteStep),
        (any::<usize>(), any::<u8>()).prop_map(|(step, note)| Op::SetNote(step, note)),
        Just(Op::Undo),
        Just(Op::Redo),
        (0u8..20).prop_map(Op::Age),
    ]
}

/// Everything a client can observe about a workflow's structure.
#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    title: String,
    selected_tab_position: Option<i64>,
    tabs: Vec<(String, String, Vec<(String, Value, String, Option<DeltaId>)>)>,
}

struct World {
    orchestrator: Orchestrator,
    clock: Arc<ManualClock>,
    workflow_id: WorkflowId,
    next_slug: usize,
}

impl World {
    fn new() -> Self {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid start time");
        let clock = Arc::new(ManualClock::new(start));
        let store = Store::open_in_memory().expect("in-memory store");
        let workflow_id = store.create_workflow("w", start).expect("workflow should be created").id;
        let (collaborators, _outbound) = ChannelCollaborators::new();
        let catalog = ModuleCatalog::from_specs([
            ModuleSpec { id_name: "source".into(), parameters: vec![] },
            ModuleSpec { id_name: "join".into(), parameters: vec![ParamSpec::new("right", ParamKind::Tab)] },
        ]);
        let orchestrator = Orchestrator::new(
            Arc::new(store),
            Arc::new(CommandRegistry::builtin().expect("builtin registry")),
            Arc::new(catalog),
            Arc::new(collaborators),
            clock.clone(),
        )
        .expect("orchestrator should start");
        Self { orchestrator, clock, workflow_id, next_slug: 0 }
    }

    fn store(&self) -> &Store {
        self.orchestrator.store()
    }

    fn snapshot(&self) -> Snapshot {
        let workflow = self.store().load_workflow(self.workflow_id).expect("workflow should load");
        let tabs = self
            .store()
            .live_tabs(self.workflow_id)
            .expect("tabs should load")
            .into_iter()
            .map(|tab| {
                let steps = self
                    .store()
                    .live_steps(self.workflow_id, &tab.slug)
                    .expect("steps should load")
                    .into_iter()
                    .map(|step| (step.slug, step.params, step.notes, step.last_relevant_delta_id))
                    .collect();
                (tab.slug, tab.name, steps)
            })
            .collect();
        Snapshot { title: workflow.name, selected_tab_position: workflow.selected_tab_position, tabs }
    }

    fn tab_slugs(&self) -> Vec<String> {
        self.snapshot().tabs.into_iter().map(|(slug, _, _)| slug).collect()
    }

    fn step_slugs(&self) -> Vec<String> {
        self.snapshot().tabs.into_iter().flat_map(|(_, _, steps)| steps).map(|(slug, ..)| slug).collect()
    }

    /// Slugs never collide with `INITIAL_TAB_SLUG` or with each other.
    fn fresh_slug(&mut self, prefix: &str) -> String {
        self.next_slug += 1;
        format!("{prefix}-p{}", self.next_slug)
    }

    /// Translate an op into command arguments against the current structure.
    fn args_for(&mut self, op: &Op) -> Option<CommandArgs> {
        let tabs = self.tab_slugs();
        let steps = self.step_slugs();
        let pick = |slugs: &[String], index: usize| (!slugs.is_empty()).then(|| slugs[index % slugs.len()].clone());

        match op {
            Op::Title(n) => Some(CommandArgs::SetWorkflowTitle { new_value: format!("title {n}") }),
            Op::AddTab => {
                let slug = self.fresh_slug("tab");
                Some(CommandArgs::AddTab { name: slug.to_uppercase(), slug })
            }
            Op::DeleteTab(index) => pick(&tabs, *index).map(|slug| CommandArgs::DeleteTab { slug }),
            Op::RenameTab(index, n) => {
                pick(&tabs, *index).map(|slug| CommandArgs::SetTabName { slug, new_name: format!("name {n}") })
            }
            Op::RotateTabs(by) => {
                let mut new_order = tabs.clone();
                new_order.rotate_left(by % tabs.len().max(1));
                Some(CommandArgs::ReorderTabs { new_order })
            }
            Op::AddStep { tab, position, reads } => {
                let tab_slug = pick(&tabs, *tab)?;
                let live = self.snapshot().tabs.into_iter().find(|(slug, ..)| *slug == tab_slug)?.2.len();
                let (module_id_name, params) = match reads.and_then(|index| pick(&tabs, index)) {
                    Some(right) => ("join", json!({ "right": right })),
                    None => ("source", json!({})),
                };
                Some(CommandArgs::AddStep {
                    tab_slug,
                    slug: self.fresh_slug("step"),
                    module_id_name: module_id_name.into(),
                    position: (position % (live + 1)) as i64,
                    params,
                })
            }
            Op::DeleteStep(index) => pick(&steps, *index).map(|step_slug| CommandArgs::DeleteStep { step_slug }),
            Op::SetNote(index, n) => pick(&steps, *index)
                .map(|step_slug| CommandArgs::SetStepNote { step_slug, new_value: format!("note {n}") }),
            Op::Undo | Op::Redo | Op::Age(_) => None,
        }
    }

    fn chain(&self) -> Vec<(DeltaId, Option<DeltaId>)> {
        self.store()
            .list_deltas(self.workflow_id)
            .expect("history should load")
            .into_iter()
            .map(|delta| (delta.id, delta.prev_delta_id))
            .collect()
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime should build")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn undo_restores_and_redo_reproduces(ops in proptest::collection::vec(op(), 1..40)) {
        runtime().block_on(async {
            let mut world = World::new();
            for op in &ops {
                let Some(args) = world.args_for(op) else {
                    continue;
                };
                let before = world.snapshot();
                let applied = world
                    .orchestrator
                    .do_command(world.workflow_id, args, None)
                    .await
                    .expect("generated commands are valid");
                let Some(applied) = applied else {
                    prop_assert_eq!(world.snapshot(), before);
                    continue;
                };
                let after = world.snapshot();

                let undone = world.orchestrator.undo(world.workflow_id).await.expect("undo").expect("entry to undo");
                prop_assert_eq!(undone.id, applied.id);
                prop_assert_eq!(world.snapshot(), before.clone());

                let redone = world.orchestrator.redo(world.workflow_id).await.expect("redo").expect("entry to redo");
                prop_assert_eq!(redone.id, applied.id);
                prop_assert_eq!(world.snapshot(), after);
            }
            Ok(())
        })?;
    }

    #[test]
    fn retention_never_leaves_a_hole_in_the_chain(ops in proptest::collection::vec(op(), 1..60)) {
        runtime().block_on(async {
            let mut world = World::new();
            for op in &ops {
                match op {
                    Op::Undo => {
                        world.orchestrator.undo(world.workflow_id).await.expect("undo");
                    }
                    Op::Redo => {
                        world.orchestrator.redo(world.workflow_id).await.expect("redo");
                    }
                    Op::Age(days) => world.clock.advance(Duration::days(i64::from(*days))),
                    other => {
                        if let Some(args) = world.args_for(other) {
                            world.orchestrator.do_command(world.workflow_id, args, None).await.expect("valid command");
                        }
                    }
                }
            }

            let before = world.snapshot();
            let reaper = Reaper::new(
                world.orchestrator.store().clone(),
                world.clock.clone(),
                RetentionConfig { max_age_days: MAX_AGE_DAYS, interval_secs: 60, max_workflows_per_cycle: 10 },
            );
            reaper.sweep_once().await.expect("sweep should succeed");

            // Retention never changes what the workflow looks like.
            prop_assert_eq!(world.snapshot(), before);

            let chain = world.chain();
            for (index, (id, prev)) in chain.iter().enumerate() {
                let expected_prev = index.checked_sub(1).map(|previous| chain[previous].0);
                prop_assert_eq!(*prev, expected_prev, "entry {} breaks the chain", id);
            }
            let head = world.store().load_workflow(world.workflow_id).expect("workflow").head_delta_id;
            if let Some(head) = head {
                prop_assert!(chain.iter().any(|(id, _)| *id == head), "head {} was deleted", head);
            }

            // Whatever survived still undoes and redoes cleanly.
            while world.orchestrator.undo(world.workflow_id).await.expect("undo").is_some() {}
            while world.orchestrator.redo(world.workflow_id).await.expect("redo").is_some() {}
            Ok(())
        })?;
    }
}
