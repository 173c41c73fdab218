// Per-document mutation lock.
//
// A `DocumentTx` owns the connection lock for its whole lifetime and an open
// `BEGIN IMMEDIATE` transaction. It is `!Send` (it holds a
// `ReentrantMutexGuard`), so it cannot be carried across an `.await` inside a
// spawned task.
//
// Taking the lock again for the same workflow on the same thread is a no-op:
// the nested guard works inside the outer transaction behind a savepoint, and
// its after-commit callbacks wait for the outermost commit. Taking it for a
// different workflow while one is held is reported instead of deadlocking.

use std::cell::{Cell, RefCell};

use chrono::{DateTime, Utc};
use parking_lot::ReentrantMutexGuard;
use rusqlite::{params, Connection};
use workbench_common::types::{Workflow, WorkflowId};

use crate::error::StoreError;

use super::{encode_ts, load_workflow};

const NESTED_SAVEPOINT: &str = "document_nested";

type CommitCallback = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static HELD_DOCUMENT: Cell<Option<WorkflowId>> = const { Cell::new(None) };
    static PENDING_CALLBACKS: RefCell<Vec<CommitCallback>> = const { RefCell::new(Vec::new()) };
}

/// Records that this thread holds a document lock. The outermost marker
/// clears the record on drop.
#[derive(Debug)]
pub(crate) struct HeldMarker {
    nested: bool,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl HeldMarker {
    pub(crate) fn claim(workflow_id: WorkflowId) -> Result<Self, StoreError> {
        HELD_DOCUMENT.with(|held| match held.get() {
            Some(current) if current == workflow_id => {
                Ok(Self { nested: true, _not_send: std::marker::PhantomData })
            }
            Some(current) => Err(StoreError::LockReentered { held: current, requested: workflow_id }),
            None => {
                held.set(Some(workflow_id));
                Ok(Self { nested: false, _not_send: std::marker::PhantomData })
            }
        })
    }

    pub(crate) fn is_nested(&self) -> bool {
        self.nested
    }
}

impl Drop for HeldMarker {
    fn drop(&mut self) {
        if !self.nested {
            HELD_DOCUMENT.with(|held| held.set(None));
        }
    }
}

/// Exclusive, transactional access to one workflow's document.
pub struct DocumentTx<'a> {
    conn: ReentrantMutexGuard<'a, Connection>,
    workflow: Workflow,
    /// Length of the pending callback queue when this guard began.
    callback_mark: usize,
    finished: bool,
    held: HeldMarker,
}

impl<'a> DocumentTx<'a> {
    pub(crate) fn begin(
        conn: ReentrantMutexGuard<'a, Connection>,
        workflow_id: WorkflowId,
        held: HeldMarker,
    ) -> Result<Self, StoreError> {
        let nested = held.is_nested();
        if nested {
            conn.execute_batch(&format!("SAVEPOINT {NESTED_SAVEPOINT}"))?;
        } else {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }

        // Re-read under the lock: the row may have changed or vanished since
        // the caller last looked.
        let workflow = match load_workflow(&conn, workflow_id) {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                abort_quietly(&conn, nested);
                return Err(StoreError::WorkflowNotFound(workflow_id));
            }
            Err(error) => {
                abort_quietly(&conn, nested);
                return Err(error);
            }
        };

        let callback_mark = PENDING_CALLBACKS.with(|pending| pending.borrow().len());
        Ok(Self { conn, workflow, callback_mark, finished: false, held })
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow.id
    }

    /// True when this guard runs inside another guard's transaction.
    pub fn is_nested(&self) -> bool {
        self.held.is_nested()
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Re-read the workflow row, e.g. after a nested guard changed it.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        let workflow_id = self.workflow.id;
        self.workflow =
            load_workflow(&self.conn, workflow_id)?.ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        Ok(())
    }

    /// Queue work to run once the outermost transaction has committed and
    /// the lock is released. Dropped silently on rollback.
    pub fn on_commit(&mut self, callback: impl FnOnce() + Send + 'static) {
        PENDING_CALLBACKS.with(|pending| pending.borrow_mut().push(Box::new(callback)));
    }

    pub fn set_workflow_name(&mut self, name: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE workflows SET name = ?1 WHERE id = ?2",
            params![name, self.workflow.id],
        )?;
        self.workflow.name = name.to_owned();
        Ok(())
    }

    pub fn set_head(&mut self, head_delta_id: Option<i64>) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE workflows SET head_delta_id = ?1 WHERE id = ?2",
            params![head_delta_id, self.workflow.id],
        )?;
        self.workflow.head_delta_id = head_delta_id;
        Ok(())
    }

    pub fn set_selected_tab_position(&mut self, position: Option<i64>) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE workflows SET selected_tab_position = ?1 WHERE id = ?2",
            params![position, self.workflow.id],
        )?;
        self.workflow.selected_tab_position = position;
        Ok(())
    }

    pub fn touch_workflow(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE workflows SET updated_at = ?1 WHERE id = ?2",
            params![encode_ts(now), self.workflow.id],
        )?;
        self.workflow.updated_at = now;
        Ok(())
    }

    /// Commit, release the lock, then run queued callbacks in order.
    ///
    /// A nested guard only releases its savepoint; its callbacks stay queued
    /// for the outermost commit.
    pub fn commit(mut self) -> Result<(), StoreError> {
        // On failure `self` drops unfinished and the work rolls back.
        if self.is_nested() {
            self.conn.execute_batch(&format!("RELEASE {NESTED_SAVEPOINT}"))?;
            self.finished = true;
            return Ok(());
        }

        self.conn.execute_batch("COMMIT")?;
        self.finished = true;

        let callbacks = PENDING_CALLBACKS.with(|pending| std::mem::take(&mut *pending.borrow_mut()));
        drop(self);
        for callback in callbacks {
            callback();
        }
        Ok(())
    }
}

impl Drop for DocumentTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            abort_quietly(&self.conn, self.is_nested());
            PENDING_CALLBACKS.with(|pending| pending.borrow_mut().truncate(self.callback_mark));
        }
    }
}

impl std::fmt::Debug for DocumentTx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = PENDING_CALLBACKS.with(|pending| pending.borrow().len());
        f.debug_struct("DocumentTx")
            .field("workflow_id", &self.workflow.id)
            .field("nested", &self.is_nested())
            .field("pending_callbacks", &pending.saturating_sub(self.callback_mark))
            .finish()
    }
}

fn abort_quietly(conn: &Connection, nested: bool) {
    let sql = if nested {
        format!("ROLLBACK TO {NESTED_SAVEPOINT}; RELEASE {NESTED_SAVEPOINT}")
    } else {
        "ROLLBACK".to_string()
    };
    if let Err(error) = conn.execute_batch(&sql) {
        tracing::warn!(error = %error, nested, "failed to roll back document transaction");
    }
}
