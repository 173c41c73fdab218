use rusqlite::{params, Connection};

use crate::error::StoreError;

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE workflows (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    name                    TEXT NOT NULL,
    head_delta_id           INTEGER NULL,
    selected_tab_position   INTEGER NULL,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL
);

CREATE TABLE tabs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_id     INTEGER NOT NULL REFERENCES workflows (id),
    slug            TEXT NOT NULL,
    name            TEXT NOT NULL,
    position        INTEGER NOT NULL,
    is_deleted      INTEGER NOT NULL DEFAULT 0,
    UNIQUE (workflow_id, slug)
);

CREATE TABLE steps (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    tab_id                  INTEGER NOT NULL REFERENCES tabs (id) ON DELETE CASCADE,
    slug                    TEXT NOT NULL,
    module_id_name          TEXT NOT NULL,
    position                INTEGER NOT NULL,
    params                  TEXT NOT NULL DEFAULT '{}',
    notes                   TEXT NOT NULL DEFAULT '',
    stored_data_version     TEXT NULL,
    last_relevant_delta_id  INTEGER NULL,
    is_deleted              INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX steps_tab_idx ON steps (tab_id, position);

CREATE TABLE deltas (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_id             INTEGER NOT NULL REFERENCES workflows (id),
    command_name            TEXT NOT NULL,
    prev_delta_id           INTEGER NULL UNIQUE
                                REFERENCES deltas (id) DEFERRABLE INITIALLY DEFERRED,
    values_for_forward      TEXT NOT NULL DEFAULT '{}',
    values_for_backward     TEXT NOT NULL DEFAULT '{}',
    tab_id                  INTEGER NULL
                                REFERENCES tabs (id) DEFERRABLE INITIALLY DEFERRED,
    step_id                 INTEGER NULL
                                REFERENCES steps (id) DEFERRABLE INITIALLY DEFERRED,
    last_applied_at         TEXT NOT NULL
);

CREATE INDEX deltas_workflow_idx ON deltas (workflow_id, id);
CREATE INDEX deltas_tab_idx ON deltas (tab_id);
CREATE INDEX deltas_step_idx ON deltas (step_id);

CREATE TABLE delta_step_versions (
    delta_id                INTEGER NOT NULL
                                REFERENCES deltas (id) DEFERRABLE INITIALLY DEFERRED,
    ordinal                 INTEGER NOT NULL,
    step_id                 INTEGER NOT NULL,
    prev_relevant_delta_id  INTEGER NULL,
    PRIMARY KEY (delta_id, ordinal)
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

pub(crate) fn configure(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA journal_mode = WAL;
        ",
    )?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

pub(crate) fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    ensure_migration_table(conn)?;
    apply_pending_migrations(conn)
}

fn ensure_migration_table(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

pub(crate) fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })?)
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .map_err(|source| StoreError::Migration { version: *version, source })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )?;
        tx.commit()?;
        current_version = *version;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::{current_schema_version, migrate};

    const EXPECTED_TABLES: &[&str] =
        &["schema_migrations", "workflows", "tabs", "steps", "deltas", "delta_step_versions"];

    #[test]
    fn migrate_creates_schema_and_records_version() {
        let mut conn = Connection::open_in_memory().expect("in-memory db should open");
        migrate(&mut conn).expect("migrations should apply");

        for table in EXPECTED_TABLES {
            let exists: i64 = conn
                .query_row(
                    "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .expect("table existence query should succeed");
            assert_eq!(exists, 1, "expected `{table}` table to exist");
        }

        assert_eq!(current_schema_version(&conn).expect("version should be readable"), 1);
    }

    #[test]
    fn migrating_twice_is_idempotent() {
        let mut conn = Connection::open_in_memory().expect("in-memory db should open");
        migrate(&mut conn).expect("first migration should apply");
        migrate(&mut conn).expect("second migration should be a no-op");

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .expect("migration count query should succeed");
        assert_eq!(rows, 1);
    }
}
