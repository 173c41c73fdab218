// Persistence: SQLite schema, the document lock, and history/structure access.
//
// Reads are available on `Store` directly. Every write goes through a
// `DocumentTx`, which only the orchestrator and the reaper can obtain.

pub mod deltas;
pub mod lock;
pub mod schema;
pub mod structure;

use std::fs;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use workbench_common::command::CommandName;
use workbench_common::types::{CursorState, Delta, Step, Tab, Workflow, WorkflowId};

use crate::error::StoreError;

pub use lock::DocumentTx;

/// Slug and name of the tab every new workflow starts with.
pub const INITIAL_TAB_SLUG: &str = "tab-1";
pub const INITIAL_TAB_NAME: &str = "Tab 1";

#[derive(Debug)]
pub struct Store {
    conn: ReentrantMutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|source| StoreError::Io { path: parent.to_path_buf(), source })?;
        }

        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        schema::configure(&conn)?;
        schema::migrate(&mut conn)?;
        Ok(Self { conn: ReentrantMutex::new(conn) })
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        schema::current_schema_version(&self.connection())
    }

    /// Create a workflow with its first tab and the sentinel history entry.
    pub fn create_workflow(&self, name: &str, now: DateTime<Utc>) -> Result<Workflow, StoreError> {
        let conn = self.connection();
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
        let now_str = encode_ts(now);

        tx.execute(
            "INSERT INTO workflows (name, head_delta_id, selected_tab_position, created_at, updated_at) \
             VALUES (?1, NULL, 0, ?2, ?2)",
            params![name, now_str],
        )?;
        let workflow_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO tabs (workflow_id, slug, name, position, is_deleted) \
             VALUES (?1, ?2, ?3, 0, 0)",
            params![workflow_id, INITIAL_TAB_SLUG, INITIAL_TAB_NAME],
        )?;

        tx.execute(
            "INSERT INTO deltas (workflow_id, command_name, prev_delta_id, last_applied_at) \
             VALUES (?1, ?2, NULL, ?3)",
            params![workflow_id, CommandName::InitWorkflow.as_str(), now_str],
        )?;
        let init_delta_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE workflows SET head_delta_id = ?1 WHERE id = ?2",
            params![init_delta_id, workflow_id],
        )?;

        let workflow = load_workflow(&tx, workflow_id)?.ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        tx.commit()?;
        Ok(workflow)
    }

    pub fn load_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, StoreError> {
        load_workflow(&self.connection(), workflow_id)?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    /// Every surviving history entry of the workflow, in chain order.
    pub fn list_deltas(&self, workflow_id: WorkflowId) -> Result<Vec<Delta>, StoreError> {
        deltas::list_deltas(&self.connection(), workflow_id)
    }

    pub fn live_tabs(&self, workflow_id: WorkflowId) -> Result<Vec<Tab>, StoreError> {
        structure::live_tabs(&self.connection(), workflow_id)
    }

    /// Looks up a tab by slug, soft-deleted or not.
    pub fn load_tab_by_slug(
        &self,
        workflow_id: WorkflowId,
        slug: &str,
    ) -> Result<Option<Tab>, StoreError> {
        structure::tab_by_slug(&self.connection(), workflow_id, slug)
    }

    pub fn live_steps(&self, workflow_id: WorkflowId, tab_slug: &str) -> Result<Vec<Step>, StoreError> {
        let conn = self.connection();
        match structure::tab_by_slug(&conn, workflow_id, tab_slug)? {
            Some(tab) if !tab.is_deleted => structure::live_steps(&conn, tab.id),
            _ => Ok(Vec::new()),
        }
    }

    /// Looks up a step by slug, soft-deleted or not.
    pub fn load_step_by_slug(
        &self,
        workflow_id: WorkflowId,
        slug: &str,
    ) -> Result<Option<Step>, StoreError> {
        structure::step_by_slug(&self.connection(), workflow_id, slug)
    }

    pub fn cursor_state(&self, workflow_id: WorkflowId) -> Result<CursorState, StoreError> {
        let conn = self.connection();
        let workflow =
            load_workflow(&conn, workflow_id)?.ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        deltas::cursor_state(&conn, &workflow)
    }

    /// Distinct command identifiers present in stored history.
    pub fn persisted_command_names(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connection();
        let mut stmt =
            conn.prepare("SELECT DISTINCT command_name FROM deltas ORDER BY command_name")?;
        let names = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Workflows holding at least one entry last applied before `cutoff`.
    pub fn find_workflows_with_stale_deltas(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowId>, StoreError> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT workflow_id FROM deltas \
             GROUP BY workflow_id \
             HAVING MIN(last_applied_at) < ?1 \
             ORDER BY workflow_id \
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let ids = stmt
            .query_map(params![encode_ts(cutoff), limit], |row| row.get(0))?
            .collect::<Result<Vec<WorkflowId>, _>>()?;
        Ok(ids)
    }

    /// Take the document lock. Prefer `with_document_lock`.
    ///
    /// The returned guard borrows a `ReentrantMutexGuard` and is therefore
    /// `!Send`: it must be dropped before any `.await`. Taking the lock again
    /// for the same workflow on the same thread yields a nested guard over
    /// the open transaction; taking it for another workflow is an error.
    pub(crate) fn acquire_document(&self, workflow_id: WorkflowId) -> Result<DocumentTx<'_>, StoreError> {
        let held = lock::HeldMarker::claim(workflow_id)?;
        let conn = self.connection();
        DocumentTx::begin(conn, workflow_id, held)
    }

    /// Run `body` inside a transaction holding the document lock.
    ///
    /// Commits (then runs after-commit callbacks) when `body` succeeds; rolls
    /// back when it fails. A nested call for the same workflow runs `body`
    /// inside the caller's transaction: its writes and callbacks land when
    /// the outermost guard commits.
    pub(crate) fn with_document_lock<T, E, F>(&self, workflow_id: WorkflowId, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut DocumentTx<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut tx = self.acquire_document(workflow_id)?;
        let value = body(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn connection(&self) -> ReentrantMutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

pub(crate) fn load_workflow(
    conn: &Connection,
    workflow_id: WorkflowId,
) -> Result<Option<Workflow>, StoreError> {
    conn.query_row_and_then(
        "SELECT id, name, head_delta_id, selected_tab_position, created_at, updated_at \
         FROM workflows WHERE id = ?1",
        params![workflow_id],
        |row| -> Result<Workflow, StoreError> {
            Ok(Workflow {
                id: row.get(0)?,
                name: row.get(1)?,
                head_delta_id: row.get(2)?,
                selected_tab_position: row.get(3)?,
                created_at: decode_ts(&row.get::<_, String>(4)?)?,
                updated_at: decode_ts(&row.get::<_, String>(5)?)?,
            })
        },
    )
    .map(Some)
    .or_else(|error| match error {
        StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        other => Err(other),
    })
}

pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_owned()))
}

pub(crate) fn decode_optional_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(decode_ts).transpose()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("timestamp should be valid")
    }

    #[test]
    fn timestamps_round_trip_and_sort_lexically() {
        let early = encode_ts(ts(0));
        let late = encode_ts(ts(1_600_000_000));

        assert!(early < late);
        assert_eq!(decode_ts(&late).expect("timestamp should decode"), ts(1_600_000_000));
    }

    #[test]
    fn create_workflow_seeds_tab_and_sentinel_entry() {
        let store = Store::open_in_memory().expect("store should open");
        let workflow = store.create_workflow("Untitled", ts(10)).expect("workflow should be created");

        let tabs = store.live_tabs(workflow.id).expect("tabs should load");
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].slug, INITIAL_TAB_SLUG);

        let history = store.list_deltas(workflow.id).expect("history should load");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command_name, "InitWorkflow");
        assert_eq!(history[0].prev_delta_id, None);
        assert_eq!(workflow.head_delta_id, Some(history[0].id));
        assert_eq!(store.cursor_state(workflow.id).expect("cursor should load"), CursorState::AtHead);
    }

    #[test]
    fn load_missing_workflow_is_not_found() {
        let store = Store::open_in_memory().expect("store should open");
        assert!(matches!(store.load_workflow(42), Err(StoreError::WorkflowNotFound(42))));
    }

    #[test]
    fn reads_on_the_locking_thread_see_pending_writes() {
        let store = Store::open_in_memory().expect("store should open");
        let workflow = store.create_workflow("Untitled", ts(10)).expect("workflow should be created");

        let mut tx = store.acquire_document(workflow.id).expect("lock should be acquired");
        tx.set_workflow_name("Pending").expect("rename should succeed");
        assert_eq!(store.load_workflow(workflow.id).expect("workflow should load").name, "Pending");
        assert_eq!(store.list_deltas(workflow.id).expect("history should load").len(), 1);
        drop(tx);

        assert_eq!(store.load_workflow(workflow.id).expect("workflow should load").name, "Untitled");
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("nested").join("workbench.db");

        let store = Store::open(&path).expect("store should open on disk");
        assert_eq!(store.schema_version().expect("schema version should be readable"), 1);
        assert!(path.exists());
    }

    #[test]
    fn stale_workflow_query_respects_cutoff_and_limit() {
        let store = Store::open_in_memory().expect("store should open");
        let old_a = store.create_workflow("a", ts(100)).expect("workflow a");
        let old_b = store.create_workflow("b", ts(100)).expect("workflow b");
        store.create_workflow("fresh", ts(10_000)).expect("fresh workflow");

        let stale = store.find_workflows_with_stale_deltas(ts(5_000), 10).expect("query should run");
        assert_eq!(stale, vec![old_a.id, old_b.id]);

        let limited = store.find_workflows_with_stale_deltas(ts(5_000), 1).expect("query should run");
        assert_eq!(limited, vec![old_a.id]);
    }
}
