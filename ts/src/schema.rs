//! SQLite schema for tasks and runs
//!
//! Creation and destruction are both idempotent. Runs cascade on task
//! deletion and are never deleted individually, which keeps `run_id`
//! assignment via MAX(run_id)+1 gapless.

use rusqlite::Connection;
use tracing::debug;

const CREATE_SQL: &str = "
-- Tasks: the unit of work
CREATE TABLE IF NOT EXISTS tasks (
    task_id         TEXT PRIMARY KEY,
    provisioner_id  TEXT NOT NULL,
    worker_type     TEXT NOT NULL,
    routing         TEXT NOT NULL DEFAULT '',
    priority        INTEGER NOT NULL DEFAULT 0,
    retries         INTEGER NOT NULL DEFAULT 0 CHECK (retries >= 0),
    timeout_secs    INTEGER NOT NULL,
    payload         TEXT NOT NULL DEFAULT 'null',   -- JSON
    created_ms      INTEGER NOT NULL,
    deadline_ms     INTEGER NOT NULL,
    taken_until_ms  INTEGER NOT NULL DEFAULT 0,
    state           TEXT NOT NULL DEFAULT 'pending',
    reason          TEXT NOT NULL DEFAULT 'none'
);

-- Runs: one attempt to execute a task, created at claim time
CREATE TABLE IF NOT EXISTS runs (
    task_id       TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
    run_id        INTEGER NOT NULL,
    worker_group  TEXT NOT NULL,
    worker_id     TEXT NOT NULL,
    started_ms    INTEGER NOT NULL,
    PRIMARY KEY (task_id, run_id)
);

-- Reaper sweeps scan by state + claim expiry and by deadline
CREATE INDEX IF NOT EXISTS idx_tasks_state_taken_until
    ON tasks (state, taken_until_ms);
CREATE INDEX IF NOT EXISTS idx_tasks_deadline
    ON tasks (deadline_ms) WHERE state IN ('pending', 'running');

-- Listings select by worker pool
CREATE INDEX IF NOT EXISTS idx_tasks_pool
    ON tasks (provisioner_id, worker_type);
";

const DROP_SQL: &str = "
DROP INDEX IF EXISTS idx_tasks_pool;
DROP INDEX IF EXISTS idx_tasks_deadline;
DROP INDEX IF EXISTS idx_tasks_state_taken_until;
DROP TABLE IF EXISTS runs;
DROP TABLE IF EXISTS tasks;
";

/// Create tables and indexes if absent
pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    debug!("ensure_schema: applying DDL");
    conn.execute_batch(CREATE_SQL)
}

/// Drop tables and indexes if present
pub fn drop_schema(conn: &Connection) -> rusqlite::Result<()> {
    debug!("drop_schema: dropping tables");
    conn.execute_batch(DROP_SQL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", true).unwrap();
        conn
    }

    #[test]
    fn test_ensure_schema_idempotent() {
        let conn = open_test_connection();
        ensure_schema(&conn).unwrap();
        ensure_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_drop_schema_idempotent() {
        let conn = open_test_connection();
        ensure_schema(&conn).unwrap();
        drop_schema(&conn).unwrap();
        // Dropping an already-dropped schema is fine
        drop_schema(&conn).unwrap();

        let result: rusqlite::Result<i64> =
            conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0));
        assert!(result.is_err());
    }

    #[test]
    fn test_runs_cascade_on_task_delete() {
        let conn = open_test_connection();
        ensure_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO tasks (task_id, provisioner_id, worker_type, timeout_secs, created_ms, deadline_ms)
             VALUES ('t1', 'aws', 'builder', 60, 0, 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO runs (task_id, run_id, worker_group, worker_id, started_ms)
             VALUES ('t1', 1, 'g', 'w', 0)",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM tasks WHERE task_id = 't1'", []).unwrap();

        let runs: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(runs, 0);
    }
}
