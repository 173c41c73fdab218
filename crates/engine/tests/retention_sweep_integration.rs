use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use workbench_common::command::CommandArgs;
use workbench_common::module::ModuleCatalog;
use workbench_common::types::{CursorState, DeltaId, WorkflowId};
use workbench_engine::clock::{Clock, ManualClock};
use workbench_engine::config::RetentionConfig;
use workbench_engine::notify::ChannelCollaborators;
use workbench_engine::reaper::{Reaper, SweepReport};
use workbench_engine::{CommandRegistry, Orchestrator, Store};

const MAX_AGE_DAYS: u32 = 30;

struct Fixture {
    orchestrator: Orchestrator,
    clock: Arc<ManualClock>,
    start: DateTime<Utc>,
}

fn fixture() -> Fixture {
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid start time");
    let clock = Arc::new(ManualClock::new(start));
    let (collaborators, _outbound) = ChannelCollaborators::new();
    let orchestrator = Orchestrator::new(
        Arc::new(Store::open_in_memory().expect("in-memory store")),
        Arc::new(CommandRegistry::builtin().expect("builtin registry")),
        Arc::new(ModuleCatalog::new()),
        Arc::new(collaborators),
        clock.clone(),
    )
    .expect("orchestrator should start");
    Fixture { orchestrator, clock, start }
}

impl Fixture {
    fn store(&self) -> &Store {
        self.orchestrator.store()
    }

    fn reaper(&self, max_workflows_per_cycle: usize) -> Reaper {
        Reaper::new(
            self.orchestrator.store().clone(),
            self.clock.clone(),
            RetentionConfig { max_age_days: MAX_AGE_DAYS, interval_secs: 60, max_workflows_per_cycle },
        )
    }

    fn create(&self) -> WorkflowId {
        self.store().create_workflow("Untitled", self.clock.now()).expect("workflow should be created").id
    }

    fn create_at(&self, at: DateTime<Utc>) -> WorkflowId {
        self.store().create_workflow("Untitled", at).expect("workflow should be created").id
    }

    async fn title(&self, workflow_id: WorkflowId, title: &str) -> DeltaId {
        let args = CommandArgs::SetWorkflowTitle { new_value: title.into() };
        self.apply(workflow_id, args).await
    }

    async fn apply(&self, workflow_id: WorkflowId, args: CommandArgs) -> DeltaId {
        self.orchestrator
            .do_command(workflow_id, args, None)
            .await
            .expect("command should apply")
            .expect("command should not be a no-op")
            .id
    }

    async fn undo(&self, workflow_id: WorkflowId) {
        self.orchestrator.undo(workflow_id).await.expect("undo should succeed").expect("something to undo");
    }

    fn chain(&self, workflow_id: WorkflowId) -> Vec<(DeltaId, Option<DeltaId>)> {
        self.store()
            .list_deltas(workflow_id)
            .expect("history should load")
            .into_iter()
            .map(|delta| (delta.id, delta.prev_delta_id))
            .collect()
    }

    fn head(&self, workflow_id: WorkflowId) -> Option<DeltaId> {
        self.store().load_workflow(workflow_id).expect("workflow should load").head_delta_id
    }

    fn age_past_retention(&self) {
        self.clock.advance(Duration::days(i64::from(MAX_AGE_DAYS) + 10));
    }
}

#[tokio::test]
async fn stale_prefix_goes_and_the_survivor_starts_the_chain() {
    let f = fixture();
    let workflow_id = f.create();
    f.title(workflow_id, "a").await;
    f.title(workflow_id, "b").await;

    f.age_past_retention();
    let fresh = f.title(workflow_id, "c").await;

    let report = f.reaper(100).sweep_once().await.expect("sweep should succeed");
    assert_eq!(report, SweepReport { workflows_visited: 1, deltas_deleted: 3, tabs_deleted: 0, steps_deleted: 0 });

    assert_eq!(f.chain(workflow_id), vec![(fresh, None)]);
    assert_eq!(f.head(workflow_id), Some(fresh));

    // The surviving entry still undoes; nothing older remains.
    f.undo(workflow_id).await;
    assert_eq!(f.store().load_workflow(workflow_id).unwrap().name, "b");
    assert_eq!(f.orchestrator.undo(workflow_id).await.unwrap(), None);
}

#[tokio::test]
async fn fully_stale_history_leaves_the_cursor_before_an_empty_chain() {
    let f = fixture();
    let workflow_id = f.create();
    f.title(workflow_id, "a").await;

    f.age_past_retention();
    f.reaper(100).sweep_once().await.expect("sweep should succeed");

    assert!(f.chain(workflow_id).is_empty());
    assert_eq!(f.head(workflow_id), None);
    assert_eq!(f.store().cursor_state(workflow_id).unwrap(), CursorState::AtHead);
    assert_eq!(f.store().load_workflow(workflow_id).unwrap().name, "a");

    // New work starts a fresh chain.
    let next = f.title(workflow_id, "b").await;
    assert_eq!(f.chain(workflow_id), vec![(next, None)]);
    f.undo(workflow_id).await;
    assert_eq!(f.store().load_workflow(workflow_id).unwrap().name, "a");
}

#[tokio::test]
async fn stale_undone_suffix_goes_while_fresh_entries_stay() {
    let f = fixture();
    let workflow_id = f.create();
    f.title(workflow_id, "a").await;
    let b = f.title(workflow_id, "b").await;
    f.title(workflow_id, "c").await;
    f.undo(workflow_id).await;
    f.undo(workflow_id).await;

    f.age_past_retention();
    f.orchestrator.redo(workflow_id).await.unwrap().expect("b should redo");

    let report = f.reaper(100).sweep_once().await.expect("sweep should succeed");
    // init and a before the cursor, c after it.
    assert_eq!(report.deltas_deleted, 3);
    assert_eq!(f.chain(workflow_id), vec![(b, None)]);
    assert_eq!(f.head(workflow_id), Some(b));
    assert_eq!(f.orchestrator.redo(workflow_id).await.unwrap(), None);

    f.undo(workflow_id).await;
    assert_eq!(f.store().load_workflow(workflow_id).unwrap().name, "a");
}

#[tokio::test]
async fn stale_entries_behind_a_fresh_one_are_kept() {
    let f = fixture();
    let later = f.start + Duration::days(i64::from(MAX_AGE_DAYS) + 10);
    let workflow_id = f.create_at(later);
    f.title(workflow_id, "old").await;
    f.age_past_retention();
    f.title(workflow_id, "new").await;

    let before = f.chain(workflow_id);
    let report = f.reaper(100).sweep_once().await.expect("sweep should succeed");

    assert_eq!(report.workflows_visited, 1);
    assert_eq!(report.deltas_deleted, 0);
    assert_eq!(f.chain(workflow_id), before);
}

#[tokio::test]
async fn orphans_of_reaped_entries_are_hard_deleted() {
    let f = fixture();
    let workflow_id = f.create();
    f.apply(workflow_id, CommandArgs::AddTab { slug: "tab-2".into(), name: "Two".into() }).await;
    f.apply(
        workflow_id,
        CommandArgs::AddStep {
            tab_slug: "tab-1".into(),
            slug: "step-1".into(),
            module_id_name: "filter".into(),
            position: 0,
            params: json!({}),
        },
    )
    .await;
    f.undo(workflow_id).await;
    f.undo(workflow_id).await;

    f.age_past_retention();
    let report = f.reaper(100).sweep_once().await.expect("sweep should succeed");

    assert_eq!(report, SweepReport { workflows_visited: 1, deltas_deleted: 3, tabs_deleted: 1, steps_deleted: 1 });
    assert!(f.store().load_tab_by_slug(workflow_id, "tab-2").unwrap().is_none());
    assert!(f.store().load_step_by_slug(workflow_id, "step-1").unwrap().is_none());
    // Live structure is untouched.
    assert_eq!(f.store().live_tabs(workflow_id).unwrap().len(), 1);
}

#[tokio::test]
async fn each_sweep_visits_a_bounded_batch() {
    let f = fixture();
    let first = f.create();
    let second = f.create();
    f.title(first, "a").await;
    f.title(second, "a").await;

    f.age_past_retention();
    let reaper = f.reaper(1);

    let report = reaper.sweep_once().await.expect("first sweep");
    assert_eq!(report.workflows_visited, 1);
    assert!(f.chain(first).is_empty());
    assert_eq!(f.chain(second).len(), 2);

    let report = reaper.sweep_once().await.expect("second sweep");
    assert_eq!(report.workflows_visited, 1);
    assert!(f.chain(second).is_empty());

    let report = reaper.sweep_once().await.expect("third sweep");
    assert_eq!(report, SweepReport::default());
}

#[tokio::test]
async fn fresh_history_is_not_a_candidate() {
    let f = fixture();
    let workflow_id = f.create();
    f.title(workflow_id, "a").await;
    f.clock.advance(Duration::days(i64::from(MAX_AGE_DAYS) - 1));

    let report = f.reaper(100).sweep_once().await.expect("sweep should succeed");
    assert_eq!(report, SweepReport::default());
    assert_eq!(f.chain(workflow_id).len(), 2);
}

#[tokio::test]
async fn background_loop_stops_on_shutdown() {
    let f = fixture();
    let workflow_id = f.create();
    f.title(workflow_id, "a").await;
    f.age_past_retention();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let task = tokio::spawn(f.reaper(100).run(shutdown_rx));

    // The first tick fires immediately.
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !f.chain(workflow_id).is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first sweep should run promptly");

    shutdown_tx.send(()).expect("reaper is listening");
    task.await.expect("reaper task should exit cleanly");
}
