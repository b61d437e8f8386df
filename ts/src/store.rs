//! SQLite-backed task store
//!
//! Provides the atomic primitives the queue engine is built on. Every
//! multi-statement mutation runs inside an immediate transaction so the
//! write lock is taken up front and conflicting writers serialize in the
//! store, not in process. Conditional updates (`WHERE state = ...`) are the
//! compare-and-swap that makes claims race-safe across processes.
//!
//! The store never publishes events; callers publish after a successful
//! mutation so no lock is held across message-bus I/O.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use tracing::debug;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::schema;
use crate::task::{Run, Task, TaskFilter, TaskId, TaskState, TaskStatus, epoch};

/// Column list shared by every task SELECT so row mapping stays in sync
const TASK_COLUMNS: &str = "task_id, provisioner_id, worker_type, routing, priority, retries, \
                            timeout_secs, payload, created_ms, deadline_ms, taken_until_ms, state, reason";

/// Outcome of an atomic first-claim attempt
#[derive(Debug)]
pub enum ClaimAttempt {
    /// The compare-and-swap succeeded; the snapshot includes the new run
    Claimed(TaskStatus),
    /// The task exists but was not pending (lost race, already claimed,
    /// or already resolved) - carries the state observed in-transaction
    NotClaimed(TaskState),
}

/// Handle to the task database
///
/// Opens a fresh connection per operation (no pooled mutable state), so the
/// handle is cheap to clone and safe to share across threads.
#[derive(Debug, Clone)]
pub struct TaskStore {
    database_path: PathBuf,
}

impl TaskStore {
    /// Open the store at the given path, creating the schema if absent
    pub fn open(database_path: impl Into<PathBuf>) -> StoreResult<Self> {
        let store = Self {
            database_path: database_path.into(),
        };
        debug!(path = %store.database_path.display(), "TaskStore::open: called");
        store.with_connection("open", |conn| Ok(schema::ensure_schema(conn)?))?;
        Ok(store)
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    /// Create tables and indexes if absent (idempotent)
    pub fn ensure_schema(&self) -> StoreResult<()> {
        self.with_connection("ensure_schema", |conn| Ok(schema::ensure_schema(conn)?))
    }

    /// Drop tables and indexes if present (idempotent)
    pub fn drop_schema(&self) -> StoreResult<()> {
        self.with_connection("drop_schema", |conn| Ok(schema::drop_schema(conn)?))
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        debug!(operation = operation_name, "TaskStore: opening connection");
        let mut connection = open_connection(&self.database_path)?;
        operation(&mut connection)
    }

    /// Insert a new task in state `pending` with no runs
    ///
    /// The stored row always starts pending with an empty claim window,
    /// regardless of the snapshot's lifecycle fields.
    pub fn create(&self, task: &Task) -> StoreResult<()> {
        debug!(task_id = %task.task_id, "TaskStore::create: called");
        self.with_connection("create", |conn| {
            let result = conn.execute(
                "INSERT INTO tasks (task_id, provisioner_id, worker_type, routing, priority, retries, \
                                    timeout_secs, payload, created_ms, deadline_ms, taken_until_ms, state, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 'pending', 'none')",
                params![
                    task.task_id.to_string(),
                    task.provisioner_id,
                    task.worker_type,
                    task.routing,
                    task.priority,
                    task.retries,
                    task.timeout_secs,
                    task.payload.to_string(),
                    task.created.timestamp_millis(),
                    task.deadline.timestamp_millis(),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(task.task_id))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Fetch a task and all its runs, ordered by `run_id`
    pub fn get(&self, task_id: TaskId) -> StoreResult<TaskStatus> {
        self.with_connection("get", |conn| {
            fetch_status(conn, task_id)?.ok_or(StoreError::NotFound(task_id))
        })
    }

    /// Remove a task; runs are removed by cascade
    pub fn delete(&self, task_id: TaskId) -> StoreResult<()> {
        debug!(%task_id, "TaskStore::delete: called");
        self.with_connection("delete", |conn| {
            let deleted = conn.execute(
                "DELETE FROM tasks WHERE task_id = ?1",
                params![task_id.to_string()],
            )?;
            if deleted == 0 {
                return Err(StoreError::NotFound(task_id));
            }
            Ok(())
        })
    }

    /// Atomically claim a pending task
    ///
    /// The conditional update is the linchpin: `WHERE state = 'pending'`
    /// makes it a compare-and-swap, so of N concurrent claimers exactly one
    /// sees a changed row. The claim window is computed in SQL from the
    /// task's own `timeout_secs`, and the next `run_id` is assigned inside
    /// the same immediate transaction, so two first-claims can never both
    /// observe the same maximum.
    ///
    /// Retries are decremented with a floor of zero; a task created with a
    /// zero budget gets exactly one attempt.
    pub fn create_claim(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
        worker_group: &str,
        worker_id: &str,
    ) -> StoreResult<ClaimAttempt> {
        debug!(%task_id, worker_group, worker_id, "TaskStore::create_claim: called");
        self.with_connection("create_claim", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let changed = tx.execute(
                "UPDATE tasks
                 SET state = 'running',
                     reason = 'none',
                     retries = CASE WHEN retries > 0 THEN retries - 1 ELSE 0 END,
                     taken_until_ms = ?2 + timeout_secs * 1000
                 WHERE task_id = ?1 AND state = 'pending'",
                params![task_id.to_string(), now.timestamp_millis()],
            )?;

            if changed == 0 {
                let state = fetch_state(&tx, task_id)?.ok_or(StoreError::NotFound(task_id))?;
                return Ok(ClaimAttempt::NotClaimed(state));
            }

            let run_id: u32 = tx.query_row(
                "SELECT COALESCE(MAX(run_id), 0) + 1 FROM runs WHERE task_id = ?1",
                params![task_id.to_string()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO runs (task_id, run_id, worker_group, worker_id, started_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task_id.to_string(),
                    run_id,
                    worker_group,
                    worker_id,
                    now.timestamp_millis(),
                ],
            )?;

            let status = fetch_status(&tx, task_id)?.ok_or(StoreError::NotFound(task_id))?;
            tx.commit()?;
            Ok(ClaimAttempt::Claimed(status))
        })
    }

    /// Extend the claim window of an existing run without creating a new one
    ///
    /// Not-claimed when the task is no longer running or `run_id` is not the
    /// latest run (a superseded worker cannot extend a claim it no longer
    /// owns). Retries are untouched.
    pub fn refresh_claim(
        &self,
        task_id: TaskId,
        run_id: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimAttempt> {
        debug!(%task_id, run_id, "TaskStore::refresh_claim: called");
        self.with_connection("refresh_claim", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let changed = tx.execute(
                "UPDATE tasks
                 SET taken_until_ms = ?3 + timeout_secs * 1000
                 WHERE task_id = ?1 AND state = 'running'
                   AND ?2 = (SELECT COALESCE(MAX(run_id), 0) FROM runs WHERE task_id = ?1)",
                params![task_id.to_string(), run_id, now.timestamp_millis()],
            )?;

            if changed == 0 {
                let state = fetch_state(&tx, task_id)?.ok_or(StoreError::NotFound(task_id))?;
                return Ok(ClaimAttempt::NotClaimed(state));
            }

            let status = fetch_status(&tx, task_id)?.ok_or(StoreError::NotFound(task_id))?;
            tx.commit()?;
            Ok(ClaimAttempt::Claimed(status))
        })
    }

    /// Transition `running -> completed`
    ///
    /// Returns `(changed, snapshot)`; a second call returns `false`, not an
    /// error, and any other non-running state is likewise a no-op.
    pub fn complete_run(&self, task_id: TaskId) -> StoreResult<(bool, TaskStatus)> {
        debug!(%task_id, "TaskStore::complete_run: called");
        self.with_connection("complete_run", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let changed = tx.execute(
                "UPDATE tasks SET state = 'completed', reason = 'none'
                 WHERE task_id = ?1 AND state = 'running'",
                params![task_id.to_string()],
            )?;

            let status = fetch_status(&tx, task_id)?.ok_or(StoreError::NotFound(task_id))?;
            tx.commit()?;
            Ok((changed == 1, status))
        })
    }

    /// Re-enter `pending` from a terminal state with a fresh retry budget
    ///
    /// Prior runs are preserved; `taken_until` is reset to epoch zero.
    pub fn rerun(&self, task_id: TaskId, new_retries: u32) -> StoreResult<TaskStatus> {
        debug!(%task_id, new_retries, "TaskStore::rerun: called");
        self.with_connection("rerun", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let changed = tx.execute(
                "UPDATE tasks
                 SET state = 'pending', reason = 'rerun-requested', retries = ?2, taken_until_ms = 0
                 WHERE task_id = ?1 AND state IN ('completed', 'failed')",
                params![task_id.to_string(), new_retries],
            )?;

            if changed == 0 {
                let state = fetch_state(&tx, task_id)?.ok_or(StoreError::NotFound(task_id))?;
                return Err(StoreError::InvalidState { task_id, state });
            }

            let status = fetch_status(&tx, task_id)?.ok_or(StoreError::NotFound(task_id))?;
            tx.commit()?;
            Ok(status)
        })
    }

    /// Atomically fail every task past its deadline or out of retries
    ///
    /// One transaction flips (deadline passed, pending or running) to
    /// failed/deadline-exceeded, then (running, no retries left, claim
    /// expired) to failed/retries-exhausted, and returns the updated
    /// snapshots. Nothing can interleave between find and update.
    pub fn find_expired_running(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskStatus>> {
        self.with_connection("find_expired_running", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now_ms = now.timestamp_millis();

            let mut ids = updated_ids(
                &tx,
                "UPDATE tasks SET state = 'failed', reason = 'deadline-exceeded'
                 WHERE deadline_ms < ?1 AND state IN ('pending', 'running')
                 RETURNING task_id",
                now_ms,
            )?;
            ids.extend(updated_ids(
                &tx,
                "UPDATE tasks SET state = 'failed', reason = 'retries-exhausted'
                 WHERE state = 'running' AND retries = 0 AND taken_until_ms < ?1
                 RETURNING task_id",
                now_ms,
            )?);

            let statuses = collect_statuses(&tx, &ids)?;
            tx.commit()?;
            Ok(statuses)
        })
    }

    /// Atomically re-queue every running task whose claim expired with
    /// retries remaining, and return the updated snapshots
    pub fn find_expired_claims(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskStatus>> {
        self.with_connection("find_expired_claims", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let ids = updated_ids(
                &tx,
                "UPDATE tasks SET state = 'pending', reason = 'claim-expired', taken_until_ms = 0
                 WHERE state = 'running' AND taken_until_ms < ?1 AND retries > 0
                 RETURNING task_id",
                now.timestamp_millis(),
            )?;

            let statuses = collect_statuses(&tx, &ids)?;
            tx.commit()?;
            Ok(statuses)
        })
    }

    /// Read-only listing by equality filter, runs included
    pub fn query(&self, filter: &TaskFilter) -> StoreResult<Vec<TaskStatus>> {
        self.with_connection("query", |conn| {
            let mut clauses = Vec::new();
            let mut values = Vec::new();
            if let Some(provisioner_id) = &filter.provisioner_id {
                clauses.push("provisioner_id = ?");
                values.push(provisioner_id.clone());
            }
            if let Some(worker_type) = &filter.worker_type {
                clauses.push("worker_type = ?");
                values.push(worker_type.clone());
            }
            if let Some(state) = &filter.state {
                clauses.push("state = ?");
                values.push(state.to_string());
            }

            let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY created_ms, task_id");

            let mut statement = conn.prepare(&sql)?;
            let tasks = statement
                .query_map(params_from_iter(values.iter()), task_from_row)?
                .collect::<rusqlite::Result<Vec<Task>>>()?;

            let mut statuses = Vec::with_capacity(tasks.len());
            for task in tasks {
                let runs = fetch_runs(conn, task.task_id)?;
                statuses.push(TaskStatus { task, runs });
            }
            Ok(statuses)
        })
    }
}

fn open_connection(database_path: &Path) -> StoreResult<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.pragma_update(None, "foreign_keys", true)?;
    connection.busy_timeout(Duration::from_secs(5))?;
    Ok(connection)
}

/// Run an `UPDATE ... RETURNING task_id` and collect the affected ids
fn updated_ids(conn: &Connection, sql: &str, now_ms: i64) -> StoreResult<Vec<TaskId>> {
    let mut statement = conn.prepare(sql)?;
    let rows = statement.query_map(params![now_ms], |row| row.get::<_, String>(0))?;
    let mut ids = Vec::new();
    for raw in rows {
        ids.push(parse_task_id(&raw?)?);
    }
    Ok(ids)
}

fn collect_statuses(conn: &Connection, ids: &[TaskId]) -> StoreResult<Vec<TaskStatus>> {
    let mut statuses = Vec::with_capacity(ids.len());
    for task_id in ids {
        if let Some(status) = fetch_status(conn, *task_id)? {
            statuses.push(status);
        }
    }
    Ok(statuses)
}

fn fetch_status(conn: &Connection, task_id: TaskId) -> StoreResult<Option<TaskStatus>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
            params![task_id.to_string()],
            task_from_row,
        )
        .optional()?;
    match task {
        Some(task) => {
            let runs = fetch_runs(conn, task_id)?;
            Ok(Some(TaskStatus { task, runs }))
        }
        None => Ok(None),
    }
}

fn fetch_state(conn: &Connection, task_id: TaskId) -> StoreResult<Option<TaskState>> {
    let raw = conn
        .query_row(
            "SELECT state FROM tasks WHERE task_id = ?1",
            params![task_id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(parse_state(&raw)?)),
        None => Ok(None),
    }
}

fn fetch_runs(conn: &Connection, task_id: TaskId) -> StoreResult<Vec<Run>> {
    let mut statement = conn.prepare(
        "SELECT task_id, run_id, worker_group, worker_id, started_ms
         FROM runs WHERE task_id = ?1 ORDER BY run_id",
    )?;
    let runs = statement
        .query_map(params![task_id.to_string()], run_from_row)?
        .collect::<rusqlite::Result<Vec<Run>>>()?;
    Ok(runs)
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let task_id: String = row.get(0)?;
    let payload: String = row.get(7)?;
    let state: String = row.get(11)?;
    let reason: String = row.get(12)?;

    Ok(Task {
        task_id: parse_uuid(&task_id)?,
        provisioner_id: row.get(1)?,
        worker_type: row.get(2)?,
        routing: row.get(3)?,
        priority: row.get(4)?,
        retries: row.get(5)?,
        timeout_secs: row.get(6)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(Box::new(e)))?,
        created: from_ms(row.get(8)?),
        deadline: from_ms(row.get(9)?),
        taken_until: from_ms(row.get(10)?),
        state: state.parse().map_err(string_error)?,
        reason: reason.parse().map_err(string_error)?,
    })
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let task_id: String = row.get(0)?;
    Ok(Run {
        task_id: parse_uuid(&task_id)?,
        run_id: row.get(1)?,
        worker_group: row.get(2)?,
        worker_id: row.get(3)?,
        started: from_ms(row.get(4)?),
    })
}

fn parse_task_id(raw: &str) -> StoreResult<TaskId> {
    Ok(parse_uuid(raw)?)
}

fn parse_state(raw: &str) -> StoreResult<TaskState> {
    Ok(raw.parse().map_err(string_error)?)
}

fn parse_uuid(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_error(Box::new(e)))
}

fn string_error(message: String) -> rusqlite::Error {
    conversion_error(message.into())
}

fn conversion_error(error: Box<dyn std::error::Error + Send + Sync + 'static>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, error)
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(epoch)
}
