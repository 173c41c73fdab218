// History chain storage: append, cursor lookups, and range deletion.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use workbench_common::command::CommandName;
use workbench_common::types::{
    CursorState, Delta, DeltaId, StepDeltaRef, StepId, TabId, Workflow, WorkflowId,
};

use crate::error::StoreError;

use super::{decode_ts, encode_ts, DocumentTx};

/// Tables whose rows hang off a history entry and go when it goes.
/// Each pair is `(table, column referencing deltas.id)`.
pub(crate) const LOG_CHILD_TABLES: &[(&str, &str)] = &[("delta_step_versions", "delta_id")];

const DELTA_COLUMNS: &str = "id, workflow_id, command_name, prev_delta_id, values_for_forward, \
                             values_for_backward, tab_id, step_id, last_applied_at";

/// A history entry ready to be appended, before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelta {
    pub command_name: CommandName,
    pub values_for_forward: Value,
    pub values_for_backward: Value,
    pub tab_id: Option<TabId>,
    pub step_id: Option<StepId>,
    pub step_delta_ids: Vec<StepDeltaRef>,
}

pub(crate) fn list_deltas(conn: &Connection, workflow_id: WorkflowId) -> Result<Vec<Delta>, StoreError> {
    let mut versions = step_versions_for_workflow(conn, workflow_id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {DELTA_COLUMNS} FROM deltas WHERE workflow_id = ?1 ORDER BY id"
    ))?;
    let deltas = stmt
        .query_and_then(params![workflow_id], |row| {
            let mut delta = delta_from_row(row)?;
            delta.step_delta_ids = versions.remove(&delta.id).unwrap_or_default();
            Ok::<_, StoreError>(delta)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(deltas)
}

pub(crate) fn load_delta(
    conn: &Connection,
    workflow_id: WorkflowId,
    predicate: &str,
    param: i64,
) -> Result<Option<Delta>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DELTA_COLUMNS} FROM deltas WHERE workflow_id = ?1 AND {predicate} ORDER BY id LIMIT 1"
    ))?;
    let mut rows = stmt.query_and_then(params![workflow_id, param], delta_from_row)?;
    match rows.next() {
        Some(delta) => {
            let mut delta = delta?;
            delta.step_delta_ids = step_versions_for_delta(conn, delta.id)?;
            Ok(Some(delta))
        }
        None => Ok(None),
    }
}

pub(crate) fn cursor_state(conn: &Connection, workflow: &Workflow) -> Result<CursorState, StoreError> {
    let undone: i64 = conn.query_row(
        "SELECT COUNT(*) FROM deltas WHERE workflow_id = ?1 AND id > ?2",
        params![workflow.id, workflow.head_delta_id.unwrap_or(0)],
        |row| row.get(0),
    )?;
    Ok(if undone == 0 { CursorState::AtHead } else { CursorState::MidChain })
}

fn delta_from_row(row: &Row<'_>) -> Result<Delta, StoreError> {
    let forward: String = row.get(4)?;
    let backward: String = row.get(5)?;
    Ok(Delta {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        command_name: row.get(2)?,
        prev_delta_id: row.get(3)?,
        values_for_forward: serde_json::from_str(&forward)?,
        values_for_backward: serde_json::from_str(&backward)?,
        tab_id: row.get(6)?,
        step_id: row.get(7)?,
        step_delta_ids: Vec::new(),
        last_applied_at: decode_ts(&row.get::<_, String>(8)?)?,
    })
}

fn step_versions_for_delta(conn: &Connection, delta_id: DeltaId) -> Result<Vec<StepDeltaRef>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT step_id, prev_relevant_delta_id FROM delta_step_versions \
         WHERE delta_id = ?1 ORDER BY ordinal",
    )?;
    let refs = stmt
        .query_map(params![delta_id], |row| {
            Ok(StepDeltaRef { step_id: row.get(0)?, prev_relevant_delta_id: row.get(1)? })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(refs)
}

fn step_versions_for_workflow(
    conn: &Connection,
    workflow_id: WorkflowId,
) -> Result<HashMap<DeltaId, Vec<StepDeltaRef>>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT v.delta_id, v.step_id, v.prev_relevant_delta_id \
         FROM delta_step_versions v JOIN deltas d ON d.id = v.delta_id \
         WHERE d.workflow_id = ?1 \
         ORDER BY v.delta_id, v.ordinal",
    )?;
    let mut grouped: HashMap<DeltaId, Vec<StepDeltaRef>> = HashMap::new();
    let rows = stmt.query_map(params![workflow_id], |row| {
        Ok((
            row.get::<_, DeltaId>(0)?,
            StepDeltaRef { step_id: row.get(1)?, prev_relevant_delta_id: row.get(2)? },
        ))
    })?;
    for row in rows {
        let (delta_id, entry) = row?;
        grouped.entry(delta_id).or_default().push(entry);
    }
    Ok(grouped)
}

impl DocumentTx<'_> {
    pub fn list_deltas(&self) -> Result<Vec<Delta>, StoreError> {
        list_deltas(self.conn(), self.workflow_id())
    }

    pub fn load_delta(&self, delta_id: DeltaId) -> Result<Option<Delta>, StoreError> {
        load_delta(self.conn(), self.workflow_id(), "id = ?2", delta_id)
    }

    /// The entry the cursor points at, if it still exists.
    pub fn head_delta(&self) -> Result<Option<Delta>, StoreError> {
        match self.workflow().head_delta_id {
            Some(head) => self.load_delta(head),
            None => Ok(None),
        }
    }

    /// The entry `undo` would revert. The sentinel entry is never undone.
    pub fn undo_target(&self) -> Result<Option<Delta>, StoreError> {
        Ok(self
            .head_delta()?
            .filter(|delta| delta.command_name != CommandName::InitWorkflow.as_str()))
    }

    /// The entry `redo` would re-apply: the first one past the cursor.
    pub fn redo_target(&self) -> Result<Option<Delta>, StoreError> {
        let head = self.workflow().head_delta_id.unwrap_or(0);
        load_delta(self.conn(), self.workflow_id(), "id > ?2", head)
    }

    pub fn cursor_state(&self) -> Result<CursorState, StoreError> {
        cursor_state(self.conn(), self.workflow())
    }

    /// Append an entry to the chain. Does not move the cursor.
    pub fn insert_delta(
        &mut self,
        pending: &PendingDelta,
        prev_delta_id: Option<DeltaId>,
        now: DateTime<Utc>,
    ) -> Result<Delta, StoreError> {
        let workflow_id = self.workflow_id();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO deltas (workflow_id, command_name, prev_delta_id, values_for_forward, \
             values_for_backward, tab_id, step_id, last_applied_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                workflow_id,
                pending.command_name.as_str(),
                prev_delta_id,
                serde_json::to_string(&pending.values_for_forward)?,
                serde_json::to_string(&pending.values_for_backward)?,
                pending.tab_id,
                pending.step_id,
                encode_ts(now),
            ],
        )?;
        let delta_id = conn.last_insert_rowid();

        let mut insert_version = conn.prepare(
            "INSERT INTO delta_step_versions (delta_id, ordinal, step_id, prev_relevant_delta_id) \
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (ordinal, entry) in pending.step_delta_ids.iter().enumerate() {
            insert_version.execute(params![
                delta_id,
                ordinal as i64,
                entry.step_id,
                entry.prev_relevant_delta_id
            ])?;
        }

        Ok(Delta {
            id: delta_id,
            workflow_id,
            command_name: pending.command_name.as_str().to_owned(),
            prev_delta_id,
            values_for_forward: pending.values_for_forward.clone(),
            values_for_backward: pending.values_for_backward.clone(),
            tab_id: pending.tab_id,
            step_id: pending.step_id,
            step_delta_ids: pending.step_delta_ids.clone(),
            last_applied_at: now,
        })
    }

    pub fn touch_delta(&mut self, delta_id: DeltaId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE deltas SET last_applied_at = ?1 WHERE id = ?2 AND workflow_id = ?3",
            params![encode_ts(now), delta_id, self.workflow_id()],
        )?;
        if updated == 0 {
            return Err(StoreError::DeltaNotFound(delta_id));
        }
        Ok(())
    }

    /// `(id, last_applied_at)` for every entry, in chain order.
    pub fn delta_ages(&self) -> Result<Vec<(DeltaId, DateTime<Utc>)>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT id, last_applied_at FROM deltas WHERE workflow_id = ?1 ORDER BY id",
        )?;
        let ages = stmt
            .query_and_then(params![self.workflow_id()], |row| {
                Ok::<_, StoreError>((row.get(0)?, decode_ts(&row.get::<_, String>(1)?)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ages)
    }

    /// Delete every entry with `first <= id <= last`, children first.
    /// Returns the number of entries removed.
    pub fn delete_delta_range(&mut self, first: DeltaId, last: DeltaId) -> Result<usize, StoreError> {
        let workflow_id = self.workflow_id();
        let conn = self.conn();
        for (table, column) in LOG_CHILD_TABLES {
            conn.execute(
                &format!(
                    "DELETE FROM {table} WHERE {column} IN \
                     (SELECT id FROM deltas WHERE workflow_id = ?1 AND id BETWEEN ?2 AND ?3)"
                ),
                params![workflow_id, first, last],
            )?;
        }
        let deleted = conn.execute(
            "DELETE FROM deltas WHERE workflow_id = ?1 AND id BETWEEN ?2 AND ?3",
            params![workflow_id, first, last],
        )?;
        Ok(deleted)
    }

    /// Drop every entry past `head` (all entries when `head` is `None`).
    pub fn delete_deltas_after(&mut self, head: Option<DeltaId>) -> Result<usize, StoreError> {
        self.delete_delta_range(head.map_or(0, |id| id + 1), DeltaId::MAX)
    }

    /// Make the oldest surviving entry the start of the chain.
    pub fn detach_chain_start(&mut self) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE deltas SET prev_delta_id = NULL \
             WHERE id = (SELECT MIN(id) FROM deltas WHERE workflow_id = ?1)",
            params![self.workflow_id()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::store::Store;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn title_change(old: &str, new: &str) -> PendingDelta {
        PendingDelta {
            command_name: CommandName::SetWorkflowTitle,
            values_for_forward: json!({ "title": new }),
            values_for_backward: json!({ "title": old }),
            tab_id: None,
            step_id: None,
            step_delta_ids: Vec::new(),
        }
    }

    #[test]
    fn insert_links_chain_and_keeps_step_versions_in_order() {
        let store = Store::open_in_memory().expect("store should open");
        let workflow = store.create_workflow("w", ts(0)).expect("workflow");

        let mut tx = store.acquire_document(workflow.id).expect("lock");
        let head = tx.workflow().head_delta_id;
        let mut pending = title_change("w", "x");
        pending.step_delta_ids = vec![
            StepDeltaRef { step_id: 20, prev_relevant_delta_id: None },
            StepDeltaRef { step_id: 10, prev_relevant_delta_id: Some(3) },
        ];
        let inserted = tx.insert_delta(&pending, head, ts(5)).expect("insert");
        tx.commit().expect("commit");

        let history = store.list_deltas(workflow.id).expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], inserted);
        assert_eq!(history[1].prev_delta_id, head);
        assert_eq!(history[1].affected_step_ids().collect::<Vec<_>>(), vec![20, 10]);
    }

    #[test]
    fn redo_target_is_first_entry_past_cursor() {
        let store = Store::open_in_memory().expect("store should open");
        let workflow = store.create_workflow("w", ts(0)).expect("workflow");

        let mut tx = store.acquire_document(workflow.id).expect("lock");
        let init = tx.workflow().head_delta_id;
        let first = tx.insert_delta(&title_change("w", "a"), init, ts(1)).expect("first");
        let second = tx.insert_delta(&title_change("a", "b"), Some(first.id), ts(2)).expect("second");
        tx.set_head(init).expect("move cursor");

        assert_eq!(tx.redo_target().expect("redo").map(|d| d.id), Some(first.id));
        assert_eq!(tx.cursor_state().expect("cursor"), CursorState::MidChain);
        assert!(tx.undo_target().expect("undo").is_none(), "sentinel must not be undoable");

        tx.set_head(Some(second.id)).expect("move cursor");
        assert!(tx.redo_target().expect("redo").is_none());
        assert_eq!(tx.undo_target().expect("undo").map(|d| d.id), Some(second.id));
    }

    #[test]
    fn delete_after_head_removes_children_too() {
        let store = Store::open_in_memory().expect("store should open");
        let workflow = store.create_workflow("w", ts(0)).expect("workflow");

        let mut tx = store.acquire_document(workflow.id).expect("lock");
        let init = tx.workflow().head_delta_id;
        let mut pending = title_change("w", "a");
        pending.step_delta_ids = vec![StepDeltaRef { step_id: 1, prev_relevant_delta_id: None }];
        tx.insert_delta(&pending, init, ts(1)).expect("insert");

        assert_eq!(tx.delete_deltas_after(init).expect("trim"), 1);
        let orphans: i64 = tx
            .conn()
            .query_row("SELECT COUNT(*) FROM delta_step_versions", [], |row| row.get(0))
            .expect("count");
        assert_eq!(orphans, 0);
        tx.commit().expect("commit");

        assert_eq!(store.list_deltas(workflow.id).expect("history").len(), 1);
    }

    #[test]
    fn touch_delta_on_missing_entry_fails() {
        let store = Store::open_in_memory().expect("store should open");
        let workflow = store.create_workflow("w", ts(0)).expect("workflow");

        let mut tx = store.acquire_document(workflow.id).expect("lock");
        assert!(matches!(tx.touch_delta(404, ts(1)), Err(StoreError::DeltaNotFound(404))));
    }
}
