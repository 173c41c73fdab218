// Tabs and steps: lookups, soft deletion, positions, and orphan cleanup.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use workbench_common::types::{DeltaId, Step, StepId, Tab, TabId, WorkflowId};

use crate::error::StoreError;

use super::{decode_optional_ts, encode_ts, DocumentTx};

const TAB_COLUMNS: &str = "id, workflow_id, slug, name, position, is_deleted";
const STEP_COLUMNS: &str = "s.id, s.tab_id, s.slug, s.module_id_name, s.position, s.params, \
                            s.notes, s.stored_data_version, s.last_relevant_delta_id, s.is_deleted";

/// Rows removed by an orphan sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphansDeleted {
    pub tabs: usize,
    pub steps: usize,
}

fn tab_from_row(row: &Row<'_>) -> rusqlite::Result<Tab> {
    Ok(Tab {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        slug: row.get(2)?,
        name: row.get(3)?,
        position: row.get(4)?,
        is_deleted: row.get(5)?,
    })
}

fn step_from_row(row: &Row<'_>) -> Result<Step, StoreError> {
    let params: String = row.get(5)?;
    Ok(Step {
        id: row.get(0)?,
        tab_id: row.get(1)?,
        slug: row.get(2)?,
        module_id_name: row.get(3)?,
        position: row.get(4)?,
        params: serde_json::from_str(&params)?,
        notes: row.get(6)?,
        stored_data_version: decode_optional_ts(row.get(7)?)?,
        last_relevant_delta_id: row.get(8)?,
        is_deleted: row.get(9)?,
    })
}

pub(crate) fn live_tabs(conn: &Connection, workflow_id: WorkflowId) -> Result<Vec<Tab>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TAB_COLUMNS} FROM tabs WHERE workflow_id = ?1 AND is_deleted = 0 ORDER BY position"
    ))?;
    let tabs = stmt.query_map(params![workflow_id], tab_from_row)?.collect::<Result<Vec<_>, _>>()?;
    Ok(tabs)
}

pub(crate) fn tab_by_slug(
    conn: &Connection,
    workflow_id: WorkflowId,
    slug: &str,
) -> Result<Option<Tab>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TAB_COLUMNS} FROM tabs WHERE workflow_id = ?1 AND slug = ?2"
    ))?;
    let mut rows = stmt.query_map(params![workflow_id, slug], tab_from_row)?;
    Ok(rows.next().transpose()?)
}

fn tab_by_id(conn: &Connection, workflow_id: WorkflowId, tab_id: TabId) -> Result<Option<Tab>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TAB_COLUMNS} FROM tabs WHERE workflow_id = ?1 AND id = ?2"
    ))?;
    let mut rows = stmt.query_map(params![workflow_id, tab_id], tab_from_row)?;
    Ok(rows.next().transpose()?)
}

pub(crate) fn live_steps(conn: &Connection, tab_id: TabId) -> Result<Vec<Step>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM steps s WHERE s.tab_id = ?1 AND s.is_deleted = 0 ORDER BY s.position"
    ))?;
    let steps = stmt.query_and_then(params![tab_id], step_from_row)?.collect::<Result<Vec<_>, _>>()?;
    Ok(steps)
}

pub(crate) fn step_by_slug(
    conn: &Connection,
    workflow_id: WorkflowId,
    slug: &str,
) -> Result<Option<Step>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM steps s JOIN tabs t ON t.id = s.tab_id \
         WHERE t.workflow_id = ?1 AND s.slug = ?2 \
         ORDER BY s.is_deleted, s.id DESC LIMIT 1"
    ))?;
    let mut rows = stmt.query_and_then(params![workflow_id, slug], step_from_row)?;
    rows.next().transpose()
}

fn step_by_id(conn: &Connection, workflow_id: WorkflowId, step_id: StepId) -> Result<Option<Step>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM steps s JOIN tabs t ON t.id = s.tab_id \
         WHERE t.workflow_id = ?1 AND s.id = ?2"
    ))?;
    let mut rows = stmt.query_and_then(params![workflow_id, step_id], step_from_row)?;
    rows.next().transpose()
}

impl DocumentTx<'_> {
    // ── Tabs ────────────────────────────────────────────────────────

    pub fn live_tabs(&self) -> Result<Vec<Tab>, StoreError> {
        live_tabs(self.conn(), self.workflow_id())
    }

    /// Any tab with this slug, including soft-deleted ones.
    pub fn tab_by_slug(&self, slug: &str) -> Result<Option<Tab>, StoreError> {
        tab_by_slug(self.conn(), self.workflow_id(), slug)
    }

    pub fn live_tab_by_slug(&self, slug: &str) -> Result<Option<Tab>, StoreError> {
        Ok(self.tab_by_slug(slug)?.filter(|tab| !tab.is_deleted))
    }

    pub fn tab(&self, tab_id: TabId) -> Result<Option<Tab>, StoreError> {
        tab_by_id(self.conn(), self.workflow_id(), tab_id)
    }

    /// Whether a new tab may not take `slug`.
    ///
    /// Soft-deleted tabs still own their slug while an entry at or before the
    /// head refers to them. A tab referred to only by entries past the head
    /// does not count: recording a new entry discards those entries, and the
    /// tab with them.
    pub fn tab_slug_in_use(&self, slug: &str) -> Result<bool, StoreError> {
        let head = self.workflow().head_delta_id.unwrap_or(0);
        Ok(self.conn().query_row(
            "SELECT EXISTS ( \
                 SELECT 1 FROM tabs t \
                 WHERE t.workflow_id = ?1 AND t.slug = ?2 \
                   AND NOT ( \
                       t.is_deleted = 1 \
                       AND NOT EXISTS ( \
                           SELECT 1 FROM deltas d LEFT JOIN steps s ON s.id = d.step_id \
                           WHERE (d.tab_id = t.id OR s.tab_id = t.id) AND d.id <= ?3 \
                       ) \
                       AND EXISTS ( \
                           SELECT 1 FROM deltas d LEFT JOIN steps s ON s.id = d.step_id \
                           WHERE (d.tab_id = t.id OR s.tab_id = t.id) AND d.id > ?3 \
                       ) \
                   ) \
             )",
            params![self.workflow_id(), slug, head],
            |row| row.get(0),
        )?)
    }

    /// Insert a tab that stays invisible until a forward application
    /// un-deletes it.
    pub fn stage_tab(&mut self, slug: &str, name: &str, position: i64) -> Result<TabId, StoreError> {
        self.conn().execute(
            "INSERT INTO tabs (workflow_id, slug, name, position, is_deleted) VALUES (?1, ?2, ?3, ?4, 1)",
            params![self.workflow_id(), slug, name, position],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn set_tab_deleted(&mut self, tab_id: TabId, is_deleted: bool) -> Result<(), StoreError> {
        self.update_tab("is_deleted", tab_id, is_deleted)
    }

    pub fn set_tab_name(&mut self, tab_id: TabId, name: &str) -> Result<(), StoreError> {
        self.update_tab("name", tab_id, name)
    }

    pub fn set_tab_position(&mut self, tab_id: TabId, position: i64) -> Result<(), StoreError> {
        self.update_tab("position", tab_id, position)
    }

    /// Add `offset` to the position of every live tab at or after `from`.
    pub fn shift_tabs(&mut self, from: i64, offset: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE tabs SET position = position + ?1 \
             WHERE workflow_id = ?2 AND is_deleted = 0 AND position >= ?3",
            params![offset, self.workflow_id(), from],
        )?;
        Ok(())
    }

    fn update_tab(&mut self, column: &str, tab_id: TabId, value: impl rusqlite::ToSql) -> Result<(), StoreError> {
        self.conn().execute(
            &format!("UPDATE tabs SET {column} = ?1 WHERE id = ?2 AND workflow_id = ?3"),
            params![value, tab_id, self.workflow_id()],
        )?;
        Ok(())
    }

    // ── Steps ───────────────────────────────────────────────────────

    pub fn live_steps(&self, tab_id: TabId) -> Result<Vec<Step>, StoreError> {
        live_steps(self.conn(), tab_id)
    }

    /// A step with this slug anywhere in the workflow. Live steps win over
    /// soft-deleted ones.
    pub fn step_by_slug(&self, slug: &str) -> Result<Option<Step>, StoreError> {
        step_by_slug(self.conn(), self.workflow_id(), slug)
    }

    /// A live step with this slug whose tab is also live.
    pub fn live_step_by_slug(&self, slug: &str) -> Result<Option<Step>, StoreError> {
        let Some(step) = self.step_by_slug(slug)?.filter(|step| !step.is_deleted) else {
            return Ok(None);
        };
        match self.tab(step.tab_id)? {
            Some(tab) if !tab.is_deleted => Ok(Some(step)),
            _ => Ok(None),
        }
    }

    pub fn step(&self, step_id: StepId) -> Result<Option<Step>, StoreError> {
        step_by_id(self.conn(), self.workflow_id(), step_id)
    }

    /// Whether a new step may not take `slug`. Same ownership rule as
    /// [`DocumentTx::tab_slug_in_use`].
    pub fn step_slug_in_use(&self, slug: &str) -> Result<bool, StoreError> {
        let head = self.workflow().head_delta_id.unwrap_or(0);
        Ok(self.conn().query_row(
            "SELECT EXISTS ( \
                 SELECT 1 FROM steps s JOIN tabs t ON t.id = s.tab_id \
                 WHERE t.workflow_id = ?1 AND s.slug = ?2 \
                   AND NOT ( \
                       s.is_deleted = 1 \
                       AND NOT EXISTS (SELECT 1 FROM deltas d WHERE d.step_id = s.id AND d.id <= ?3) \
                       AND EXISTS (SELECT 1 FROM deltas d WHERE d.step_id = s.id AND d.id > ?3) \
                   ) \
             )",
            params![self.workflow_id(), slug, head],
            |row| row.get(0),
        )?)
    }

    pub fn stage_step(
        &mut self,
        tab_id: TabId,
        slug: &str,
        module_id_name: &str,
        position: i64,
        params: &Value,
    ) -> Result<StepId, StoreError> {
        self.conn().execute(
            "INSERT INTO steps (tab_id, slug, module_id_name, position, params, is_deleted) \
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![tab_id, slug, module_id_name, position, serde_json::to_string(params)?],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn set_step_deleted(&mut self, step_id: StepId, is_deleted: bool) -> Result<(), StoreError> {
        self.update_step("is_deleted", step_id, is_deleted)
    }

    pub fn set_step_position(&mut self, step_id: StepId, position: i64) -> Result<(), StoreError> {
        self.update_step("position", step_id, position)
    }

    pub fn set_step_params(&mut self, step_id: StepId, params: &Value) -> Result<(), StoreError> {
        self.update_step("params", step_id, serde_json::to_string(params)?)
    }

    pub fn set_step_notes(&mut self, step_id: StepId, notes: &str) -> Result<(), StoreError> {
        self.update_step("notes", step_id, notes)
    }

    pub fn set_step_data_version(
        &mut self,
        step_id: StepId,
        version: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.update_step("stored_data_version", step_id, version.map(encode_ts))
    }

    pub fn set_step_last_relevant_delta(
        &mut self,
        step_id: StepId,
        delta_id: Option<DeltaId>,
    ) -> Result<(), StoreError> {
        self.update_step("last_relevant_delta_id", step_id, delta_id)
    }

    /// Add `offset` to the position of every live step in `tab_id` at or
    /// after `from`.
    pub fn shift_steps(&mut self, tab_id: TabId, from: i64, offset: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE steps SET position = position + ?1 \
             WHERE tab_id = ?2 AND is_deleted = 0 AND position >= ?3",
            params![offset, tab_id, from],
        )?;
        Ok(())
    }

    fn update_step(&mut self, column: &str, step_id: StepId, value: impl rusqlite::ToSql) -> Result<(), StoreError> {
        self.conn().execute(
            &format!(
                "UPDATE steps SET {column} = ?1 \
                 WHERE id = ?2 AND tab_id IN (SELECT id FROM tabs WHERE workflow_id = ?3)"
            ),
            params![value, step_id, self.workflow_id()],
        )?;
        Ok(())
    }

    // ── Orphans ─────────────────────────────────────────────────────

    /// Hard-delete soft-deleted tabs and steps no surviving history entry
    /// refers to. A tab is kept while any entry refers to one of its steps.
    pub fn delete_orphans(&mut self) -> Result<OrphansDeleted, StoreError> {
        let workflow_id = self.workflow_id();
        let conn = self.conn();

        let steps = conn.execute(
            "DELETE FROM steps \
             WHERE is_deleted = 1 \
               AND tab_id IN (SELECT id FROM tabs WHERE workflow_id = ?1) \
               AND NOT EXISTS (SELECT 1 FROM deltas d WHERE d.step_id = steps.id)",
            params![workflow_id],
        )?;

        let tabs = conn.execute(
            "DELETE FROM tabs \
             WHERE workflow_id = ?1 AND is_deleted = 1 \
               AND NOT EXISTS (SELECT 1 FROM deltas d WHERE d.tab_id = tabs.id) \
               AND NOT EXISTS ( \
                   SELECT 1 FROM deltas d JOIN steps s ON s.id = d.step_id \
                   WHERE s.tab_id = tabs.id \
               )",
            params![workflow_id],
        )?;

        if steps > 0 || tabs > 0 {
            tracing::debug!(workflow_id, tabs, steps, "deleted orphaned tabs and steps");
        }
        Ok(OrphansDeleted { tabs, steps })
    }
}
