//! SQLite-backed task store.
//!
//! The store is the single source of truth shared by the scheduler, every
//! worker, the decision gate and the janitor. One connection sits behind a
//! mutex; every write runs in an `IMMEDIATE` transaction so concurrent
//! processes sharing the database file serialize on the SQLite write lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{
    Connection, OptionalExtension, Row, ToSql, Transaction, TransactionBehavior, params,
    params_from_iter,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::core::budget::Budget;
use crate::core::lifecycle::{check_transition, stamps_ended_at};
use crate::core::types::{
    CompletionSummary, ControlFlag, DecisionAction, FinishRoute, RiskLevel, TaskMetrics,
    TaskSource, TaskState, TaskType,
};
use crate::error::RuntimeError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    goal TEXT NOT NULL,
    task_type TEXT NOT NULL,
    source TEXT NOT NULL,
    state TEXT NOT NULL,
    risk_level TEXT NOT NULL,
    risk_reasons TEXT NOT NULL DEFAULT '[]',
    finish_route TEXT NOT NULL,
    validate_skill INTEGER NOT NULL DEFAULT 0,
    skill_name TEXT,
    force_draft INTEGER NOT NULL DEFAULT 0,
    agent TEXT,
    test_command TEXT NOT NULL,
    step_index INTEGER NOT NULL DEFAULT 0,
    max_steps INTEGER NOT NULL,
    max_minutes INTEGER NOT NULL,
    control TEXT NOT NULL DEFAULT 'RUNNING',
    resume_instruction TEXT,
    blocked_reason TEXT,
    error TEXT,
    summary TEXT,
    completion TEXT,
    agent_ms INTEGER NOT NULL DEFAULT 0,
    test_ms INTEGER NOT NULL DEFAULT 0,
    elapsed_ms INTEGER NOT NULL DEFAULT 0,
    workspace_path TEXT,
    branch TEXT,
    base_revision TEXT,
    workspace_cleaned_at TEXT,
    merge_commit TEXT,
    lease_owner TEXT,
    leased_at TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state, created_at);

CREATE TABLE IF NOT EXISTS task_events (
    task_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (task_id, seq)
);

CREATE TABLE IF NOT EXISTS task_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    step INTEGER NOT NULL,
    prompt_digest TEXT NOT NULL,
    agent TEXT,
    agent_output TEXT NOT NULL,
    changed_files TEXT NOT NULL,
    test_passed INTEGER NOT NULL,
    test_exit_code INTEGER,
    test_output TEXT NOT NULL,
    signal TEXT NOT NULL,
    decision TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_task ON task_checkpoints(task_id, id);

CREATE TABLE IF NOT EXISTS task_decisions (
    token TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    bound_state TEXT NOT NULL,
    actions TEXT NOT NULL,
    suggestion TEXT,
    issued_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    consumed_at TEXT,
    consumed_by TEXT,
    consumed_action TEXT,
    consumed_suggestion TEXT,
    result TEXT,
    superseded INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_decisions_task ON task_decisions(task_id);
";

macro_rules! sql_text_enum {
    ($($ty:ty),* $(,)?) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|err: anyhow::Error| FromSqlError::Other(err.into()))
            }
        }
    )*};
}

sql_text_enum!(TaskState, TaskType, TaskSource, ControlFlag, RiskLevel, FinishRoute);

/// Format a UTC time the way the store persists it (sortable as text).
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parse timestamp '{raw}'"))?
        .with_timezone(&Utc))
}

/// A persisted task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub goal: String,
    pub task_type: TaskType,
    pub source: TaskSource,
    pub state: TaskState,
    pub risk_level: RiskLevel,
    pub risk_reasons: Vec<String>,
    pub finish: FinishRoute,
    pub validate_skill: bool,
    pub skill_name: Option<String>,
    pub force_draft: bool,
    pub agent: Option<String>,
    pub test_command: String,
    /// Number of steps started so far.
    pub step_index: u32,
    pub max_steps: u32,
    pub max_minutes: u32,
    pub control: ControlFlag,
    pub resume_instruction: Option<String>,
    pub blocked_reason: Option<String>,
    pub error: Option<String>,
    pub summary: Option<String>,
    pub completion: Option<CompletionSummary>,
    pub metrics: TaskMetrics,
    pub workspace_path: Option<PathBuf>,
    pub branch: Option<String>,
    pub base_revision: Option<String>,
    pub workspace_cleaned_at: Option<String>,
    pub merge_commit: Option<String>,
    pub lease_owner: Option<String>,
    pub leased_at: Option<String>,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

impl TaskRecord {
    pub fn budget(&self) -> Budget {
        Budget {
            max_steps: self.max_steps,
            max_minutes: self.max_minutes,
        }
    }

    /// Workspace directory if one was provisioned and not yet reclaimed.
    pub fn live_workspace(&self) -> Option<&Path> {
        if self.workspace_cleaned_at.is_some() {
            return None;
        }
        self.workspace_path.as_deref()
    }

    /// A merge holds this task; no other decision may touch it.
    pub fn merge_in_progress(&self) -> bool {
        self.state == TaskState::WaitingMerge
            && self
                .lease_owner
                .as_deref()
                .is_some_and(|owner| owner.starts_with(MERGE_CLAIM_PREFIX))
    }
}

/// Fields fixed at creation.
#[derive(Debug, Clone)]
pub struct TaskInsert {
    pub id: String,
    pub goal: String,
    pub task_type: TaskType,
    pub source: TaskSource,
    pub state: TaskState,
    pub risk_level: RiskLevel,
    pub risk_reasons: Vec<String>,
    pub finish: FinishRoute,
    pub validate_skill: bool,
    pub skill_name: Option<String>,
    pub force_draft: bool,
    pub agent: Option<String>,
    pub test_command: String,
    pub max_steps: u32,
    pub max_minutes: u32,
    pub created_by: String,
}

/// Column updates applied together with a state change. `None` leaves a
/// column untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub control: Option<ControlFlag>,
    pub resume_instruction: Option<Option<String>>,
    pub blocked_reason: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub summary: Option<Option<String>>,
    pub completion: Option<CompletionSummary>,
    pub merge_commit: Option<String>,
    pub metrics: Option<TaskMetrics>,
    pub release_lease: bool,
}

/// A requested state change. Applied atomically with a `task.transition` event.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub to: TaskState,
    /// Refuse unless the task is currently in this state.
    pub expect: Option<TaskState>,
    pub patch: TaskPatch,
    pub reason: Option<String>,
    pub actor: String,
}

impl StateChange {
    pub fn to(to: TaskState, actor: impl Into<String>) -> Self {
        Self {
            to,
            expect: None,
            patch: TaskPatch::default(),
            reason: None,
            actor: actor.into(),
        }
    }

    pub fn from(mut self, state: TaskState) -> Self {
        self.expect = Some(state);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn patch(mut self, patch: TaskPatch) -> Self {
        self.patch = patch;
        self
    }
}

/// Exclusive execution right over one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub task_id: String,
    pub worker_id: String,
    pub leased_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub task_id: String,
    pub seq: u64,
    pub kind: String,
    pub payload: Value,
    pub created_at: String,
}

/// Snapshot of one completed step. Insert-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCheckpoint {
    pub task_id: String,
    pub step: u32,
    pub prompt_digest: String,
    pub agent: Option<String>,
    pub agent_output: String,
    pub changed_files: Vec<String>,
    pub test_passed: bool,
    pub test_exit_code: Option<i32>,
    pub test_output: String,
    pub signal: String,
    pub decision: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub checkpoint: NewCheckpoint,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRecord {
    pub token: String,
    pub task_id: String,
    pub bound_state: TaskState,
    pub actions: Vec<DecisionAction>,
    pub suggestion: Option<String>,
    pub issued_by: String,
    pub created_at: String,
    pub expires_at: String,
    pub consumed_at: Option<String>,
    pub consumed_by: Option<String>,
    pub consumed_action: Option<DecisionAction>,
    pub consumed_suggestion: Option<String>,
    pub result: Option<String>,
    pub superseded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    pub branch: String,
    pub base_revision: String,
}

#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    /// Open (creating if needed) the database at `path`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open database {}", path.display()))?;
        let store = Self::init(conn)?;
        info!("task store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory database")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .context("set busy timeout")?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("enable WAL")?;
        debug!(journal_mode = %mode, "database journal mode");
        conn.execute_batch(SCHEMA).context("apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("task store mutex poisoned"))
    }

    /// Run `f` inside one `IMMEDIATE` transaction; any error rolls back.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin transaction")?;
        let out = f(&tx)?;
        tx.commit().context("commit transaction")?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    #[instrument(skip_all, fields(task_id = %task.id, state = %task.state))]
    pub fn insert_task(&self, task: &TaskInsert) -> Result<TaskRecord> {
        self.write(|tx| {
            let now = now_ts();
            let reasons = serde_json::to_string(&task.risk_reasons).context("encode reasons")?;
            tx.execute(
                "INSERT INTO tasks (
                    id, goal, task_type, source, state, risk_level, risk_reasons, finish_route,
                    validate_skill, skill_name, force_draft, agent, test_command, max_steps,
                    max_minutes, created_by, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
                params![
                    task.id,
                    task.goal,
                    task.task_type,
                    task.source,
                    task.state,
                    task.risk_level,
                    reasons,
                    task.finish,
                    task.validate_skill,
                    task.skill_name,
                    task.force_draft,
                    task.agent,
                    task.test_command,
                    task.max_steps,
                    task.max_minutes,
                    task.created_by,
                    now,
                ],
            )
            .context("insert task")?;
            insert_event(
                tx,
                &task.id,
                "task.created",
                &json!({
                    "status": task.state,
                    "task_type": task.task_type,
                    "source": task.source,
                    "risk": task.risk_level,
                    "reasons": task.risk_reasons,
                    "actor": task.created_by,
                }),
            )?;
            load_task(tx, &task.id)
        })
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.read(|conn| find_task(conn, task_id))
    }

    /// Like [`TaskStore::get_task`] but missing tasks are a `TaskNotFound` error.
    pub fn require_task(&self, task_id: &str) -> Result<TaskRecord> {
        self.read(|conn| load_task(conn, task_id))
    }

    /// Most recently created tasks first.
    pub fn list_tasks(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<TaskRecord>> {
        self.read(|conn| {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM tasks WHERE (?1 IS NULL OR state = ?1)
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                )
                .context("prepare list tasks")?;
            let rows = stmt
                .query_map(params![state, limit], task_from_row)
                .context("list tasks")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("read task rows")
        })
    }

    /// Apply one validated state change plus its `task.transition` event.
    #[instrument(skip_all, fields(task_id, to = %change.to))]
    pub fn transition(&self, task_id: &str, change: &StateChange) -> Result<TaskRecord> {
        self.write(|tx| {
            apply_transition(tx, task_id, change)?;
            load_task(tx, task_id)
        })
    }

    /// Lease the oldest `PENDING` task and move it to `RUNNING`. A pause or
    /// stop still pending on it is settled by the worker's first step.
    #[instrument(skip_all, fields(worker_id))]
    pub fn claim_next(&self, worker_id: &str) -> Result<Option<Lease>> {
        self.write(|tx| {
            let task_id: Option<String> = tx
                .query_row(
                    "SELECT id FROM tasks
                     WHERE state = 'PENDING' AND lease_owner IS NULL
                     ORDER BY created_at ASC, rowid ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .context("select pending task")?;
            let Some(task_id) = task_id else {
                return Ok(None);
            };
            let change = StateChange::to(TaskState::Running, worker_id)
                .from(TaskState::Pending)
                .reason("claimed by worker");
            apply_transition(tx, &task_id, &change)?;
            let leased_at = now_ts();
            tx.execute(
                "UPDATE tasks SET lease_owner = ?1, leased_at = ?2 WHERE id = ?3",
                params![worker_id, leased_at, task_id],
            )
            .context("record lease")?;
            debug!(task_id = %task_id, "task claimed");
            Ok(Some(Lease {
                task_id,
                worker_id: worker_id.to_string(),
                leased_at,
            }))
        })
    }

    /// Release a lease if `lease.worker_id` still holds it.
    pub fn release_lease(&self, lease: &Lease) -> Result<bool> {
        self.write(|tx| {
            let changed = tx
                .execute(
                    "UPDATE tasks SET lease_owner = NULL, leased_at = NULL
                     WHERE id = ?1 AND lease_owner = ?2",
                    params![lease.task_id, lease.worker_id],
                )
                .context("release lease")?;
            Ok(changed == 1)
        })
    }

    /// Move every `RUNNING`/`VALIDATING` task back to `PENDING` and drop leases,
    /// including merge claims on `WAITING_MERGE` tasks.
    #[instrument(skip_all)]
    pub fn requeue_inflight(&self) -> Result<Vec<String>> {
        self.write(|tx| {
            let ids = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id FROM tasks WHERE state IN ('RUNNING', 'VALIDATING')
                         ORDER BY created_at ASC, rowid ASC",
                    )
                    .context("prepare inflight query")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .context("query inflight tasks")?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .context("read inflight ids")?
            };
            for id in &ids {
                let change = StateChange::to(TaskState::Pending, "runtime")
                    .reason("requeued after restart")
                    .patch(TaskPatch {
                        release_lease: true,
                        ..TaskPatch::default()
                    });
                apply_transition(tx, id, &change)?;
            }
            let released = tx
                .execute(
                    "UPDATE tasks SET lease_owner = NULL, leased_at = NULL
                     WHERE state = 'WAITING_MERGE' AND lease_owner IS NOT NULL",
                    [],
                )
                .context("release stale merge claims")?;
            if released > 0 {
                info!(released, "released merge claims left by a previous run");
            }
            Ok(ids)
        })
    }

    pub fn claim_merge(&self, task_id: &str, actor: &str) -> Result<()> {
        self.write(|tx| claim_merge(tx, task_id, actor))
    }

    pub fn set_control(&self, task_id: &str, flag: ControlFlag, actor: &str) -> Result<()> {
        self.write(|tx| update_control(tx, task_id, flag, actor))
    }

    pub fn set_step_index(&self, task_id: &str, step: u32) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "UPDATE tasks SET step_index = ?1, updated_at = ?2 WHERE id = ?3",
                params![step, now_ts(), task_id],
            )
            .context("set step index")?;
            Ok(())
        })
    }

    pub fn update_metrics(&self, task_id: &str, metrics: &TaskMetrics) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "UPDATE tasks SET agent_ms = ?1, test_ms = ?2, elapsed_ms = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    ms_to_sql(metrics.agent_ms),
                    ms_to_sql(metrics.test_ms),
                    ms_to_sql(metrics.elapsed_ms),
                    now_ts(),
                    task_id
                ],
            )
            .context("update metrics")?;
            Ok(())
        })
    }

    pub fn set_workspace(&self, task_id: &str, workspace: &WorkspaceInfo) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "UPDATE tasks SET workspace_path = ?1, branch = ?2, base_revision = ?3,
                 workspace_cleaned_at = NULL, updated_at = ?4 WHERE id = ?5",
                params![
                    workspace.path.to_string_lossy(),
                    workspace.branch,
                    workspace.base_revision,
                    now_ts(),
                    task_id
                ],
            )
            .context("record workspace")?;
            Ok(())
        })
    }

    pub fn mark_workspace_cleaned(&self, task_id: &str, reason: &str) -> Result<()> {
        self.write(|tx| {
            let task = load_task(tx, task_id)?;
            tx.execute(
                "UPDATE tasks SET workspace_cleaned_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![now_ts(), task_id],
            )
            .context("mark workspace cleaned")?;
            insert_event(
                tx,
                task_id,
                "task.workspace_cleaned",
                &json!({
                    "status": task.state,
                    "workspace": task.workspace_path.map(|p| p.display().to_string()),
                    "reason": reason,
                }),
            )?;
            Ok(())
        })
    }

    pub fn append_event(&self, task_id: &str, kind: &str, payload: &Value) -> Result<u64> {
        self.write(|tx| insert_event(tx, task_id, kind, payload))
    }

    /// The latest `limit` events, oldest first.
    pub fn list_events(&self, task_id: &str, limit: usize) -> Result<Vec<EventRecord>> {
        self.read(|conn| {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut stmt = conn
                .prepare(
                    "SELECT task_id, seq, kind, payload, created_at FROM task_events
                     WHERE task_id = ?1 ORDER BY seq DESC LIMIT ?2",
                )
                .context("prepare list events")?;
            let rows = stmt
                .query_map(params![task_id, limit], |row| {
                    let payload: String = row.get(3)?;
                    Ok(EventRecord {
                        task_id: row.get(0)?,
                        seq: u64::try_from(row.get::<_, i64>(1)?).unwrap_or_default(),
                        kind: row.get(2)?,
                        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                        created_at: row.get(4)?,
                    })
                })
                .context("list events")?;
            let mut events = rows
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("read event rows")?;
            events.reverse();
            Ok(events)
        })
    }

    /// Delete events of terminal tasks that ended before `ended_before`.
    pub fn prune_events(&self, ended_before: &str) -> Result<usize> {
        self.write(|tx| {
            let terminal = terminal_state_list();
            let sql = format!(
                "DELETE FROM task_events WHERE task_id IN (
                    SELECT id FROM tasks WHERE state IN ({terminal})
                    AND ended_at IS NOT NULL AND ended_at < ?1)"
            );
            tx.execute(&sql, params![ended_before])
                .context("prune events")
        })
    }

    pub fn add_checkpoint(&self, checkpoint: &NewCheckpoint) -> Result<()> {
        self.write(|tx| {
            let files =
                serde_json::to_string(&checkpoint.changed_files).context("encode changed files")?;
            tx.execute(
                "INSERT INTO task_checkpoints (
                    task_id, step, prompt_digest, agent, agent_output, changed_files,
                    test_passed, test_exit_code, test_output, signal, decision, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    checkpoint.task_id,
                    checkpoint.step,
                    checkpoint.prompt_digest,
                    checkpoint.agent,
                    checkpoint.agent_output,
                    files,
                    checkpoint.test_passed,
                    checkpoint.test_exit_code,
                    checkpoint.test_output,
                    checkpoint.signal,
                    checkpoint.decision,
                    now_ts(),
                ],
            )
            .context("insert checkpoint")?;
            Ok(())
        })
    }

    pub fn last_checkpoint(&self, task_id: &str) -> Result<Option<CheckpointRecord>> {
        Ok(self.query_checkpoints(task_id, Some(1))?.pop())
    }

    /// All checkpoints of a task, oldest first.
    pub fn list_checkpoints(&self, task_id: &str) -> Result<Vec<CheckpointRecord>> {
        let mut rows = self.query_checkpoints(task_id, None)?;
        rows.reverse();
        Ok(rows)
    }

    fn query_checkpoints(&self, task_id: &str, limit: Option<usize>) -> Result<Vec<CheckpointRecord>> {
        self.read(|conn| {
            let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
            let mut stmt = conn
                .prepare(
                    "SELECT task_id, step, prompt_digest, agent, agent_output, changed_files,
                            test_passed, test_exit_code, test_output, signal, decision, created_at
                     FROM task_checkpoints WHERE task_id = ?1 ORDER BY id DESC LIMIT ?2",
                )
                .context("prepare checkpoints query")?;
            let rows = stmt
                .query_map(params![task_id, limit], |row| {
                    Ok(CheckpointRecord {
                        checkpoint: NewCheckpoint {
                            task_id: row.get(0)?,
                            step: row.get(1)?,
                            prompt_digest: row.get(2)?,
                            agent: row.get(3)?,
                            agent_output: row.get(4)?,
                            changed_files: json_column(row, 5)?,
                            test_passed: row.get(6)?,
                            test_exit_code: row.get(7)?,
                            test_output: row.get(8)?,
                            signal: row.get(9)?,
                            decision: row.get(10)?,
                        },
                        created_at: row.get(11)?,
                    })
                })
                .context("query checkpoints")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("read checkpoint rows")
        })
    }

    /// Tasks in `states` whose workspace has not been reclaimed, optionally
    /// limited to those that ended before `ended_before`.
    pub fn cleanup_candidates(
        &self,
        states: &[TaskState],
        ended_before: Option<&str>,
    ) -> Result<Vec<TaskRecord>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        self.read(|conn| {
            let list = states
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT * FROM tasks
                 WHERE state IN ({list})
                   AND workspace_path IS NOT NULL
                   AND workspace_cleaned_at IS NULL
                   AND ended_at IS NOT NULL
                   AND (?1 IS NULL OR ended_at < ?1)
                 ORDER BY ended_at ASC"
            );
            let mut stmt = conn.prepare(&sql).context("prepare cleanup query")?;
            let rows = stmt
                .query_map(params![ended_before], task_from_row)
                .context("query cleanup candidates")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("read cleanup rows")
        })
    }

    /// The live token of a task: unconsumed, not superseded, unexpired, and
    /// bound to the task's current state.
    pub fn active_decision(&self, task_id: &str, now: &str) -> Result<Option<DecisionRecord>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT d.* FROM task_decisions d JOIN tasks t ON t.id = d.task_id
                 WHERE d.task_id = ?1 AND d.consumed_at IS NULL AND d.superseded = 0
                   AND d.expires_at > ?2 AND d.bound_state = t.state
                 ORDER BY d.created_at DESC LIMIT 1",
                params![task_id, now],
                decision_from_row,
            )
            .optional()
            .context("query active decision")
        })
    }

    pub fn get_decision(&self, token: &str) -> Result<Option<DecisionRecord>> {
        self.read(|conn| load_decision(conn, token))
    }
}

fn ms_to_sql(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn terminal_state_list() -> String {
    TaskState::ALL
        .into_iter()
        .filter(|s| s.is_terminal())
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn column_index(row: &Row<'_>, name: &str) -> rusqlite::Result<usize> {
    row.as_ref().column_index(name)
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let completion: Option<String> = row.get("completion")?;
    let completion = match completion {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column_index(row, "completion").unwrap_or_default(),
                Type::Text,
                Box::new(err),
            )
        })?),
        None => None,
    };
    let ms = |name: &str| -> rusqlite::Result<u64> {
        Ok(u64::try_from(row.get::<_, i64>(name)?).unwrap_or_default())
    };
    Ok(TaskRecord {
        id: row.get("id")?,
        goal: row.get("goal")?,
        task_type: row.get("task_type")?,
        source: row.get("source")?,
        state: row.get("state")?,
        risk_level: row.get("risk_level")?,
        risk_reasons: json_column(row, column_index(row, "risk_reasons")?)?,
        finish: row.get("finish_route")?,
        validate_skill: row.get("validate_skill")?,
        skill_name: row.get("skill_name")?,
        force_draft: row.get("force_draft")?,
        agent: row.get("agent")?,
        test_command: row.get("test_command")?,
        step_index: row.get("step_index")?,
        max_steps: row.get("max_steps")?,
        max_minutes: row.get("max_minutes")?,
        control: row.get("control")?,
        resume_instruction: row.get("resume_instruction")?,
        blocked_reason: row.get("blocked_reason")?,
        error: row.get("error")?,
        summary: row.get("summary")?,
        completion,
        metrics: TaskMetrics {
            agent_ms: ms("agent_ms")?,
            test_ms: ms("test_ms")?,
            elapsed_ms: ms("elapsed_ms")?,
        },
        workspace_path: row
            .get::<_, Option<String>>("workspace_path")?
            .map(PathBuf::from),
        branch: row.get("branch")?,
        base_revision: row.get("base_revision")?,
        workspace_cleaned_at: row.get("workspace_cleaned_at")?,
        merge_commit: row.get("merge_commit")?,
        lease_owner: row.get("lease_owner")?,
        leased_at: row.get("leased_at")?,
        created_by: row.get("created_by")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
    })
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<DecisionRecord> {
    let actions: String = row.get("actions")?;
    let actions = parse_actions(&actions).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            column_index(row, "actions").unwrap_or_default(),
            Type::Text,
            err.into(),
        )
    })?;
    let consumed_action: Option<String> = row.get("consumed_action")?;
    let consumed_action = consumed_action
        .map(|raw| raw.parse::<DecisionAction>())
        .transpose()
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column_index(row, "consumed_action").unwrap_or_default(),
                Type::Text,
                err.into(),
            )
        })?;
    Ok(DecisionRecord {
        token: row.get("token")?,
        task_id: row.get("task_id")?,
        bound_state: row.get("bound_state")?,
        actions,
        suggestion: row.get("suggestion")?,
        issued_by: row.get("issued_by")?,
        created_at: row.get("created_at")?,
        expires_at: row.get("expires_at")?,
        consumed_at: row.get("consumed_at")?,
        consumed_by: row.get("consumed_by")?,
        consumed_action,
        consumed_suggestion: row.get("consumed_suggestion")?,
        result: row.get("result")?,
        superseded: row.get("superseded")?,
    })
}

fn parse_actions(raw: &str) -> Result<Vec<DecisionAction>> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect()
}

fn encode_actions(actions: &[DecisionAction]) -> String {
    actions
        .iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn find_task(conn: &Connection, task_id: &str) -> Result<Option<TaskRecord>> {
    conn.query_row(
        "SELECT * FROM tasks WHERE id = ?1",
        params![task_id],
        task_from_row,
    )
    .optional()
    .with_context(|| format!("load task {task_id}"))
}

pub(crate) fn load_task(conn: &Connection, task_id: &str) -> Result<TaskRecord> {
    find_task(conn, task_id)?.ok_or_else(|| RuntimeError::TaskNotFound(task_id.to_string()).into())
}

/// Append an event with the next per-task sequence number.
pub(crate) fn insert_event(
    conn: &Connection,
    task_id: &str,
    kind: &str,
    payload: &Value,
) -> Result<u64> {
    let seq: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM task_events WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .context("next event seq")?;
    let payload = serde_json::to_string(payload).context("encode event payload")?;
    conn.execute(
        "INSERT INTO task_events (task_id, seq, kind, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![task_id, seq, kind, payload, now_ts()],
    )
    .with_context(|| format!("append {kind} event"))?;
    Ok(u64::try_from(seq).unwrap_or_default())
}

/// Check the transition table, write the new state and patch, append the event.
pub(crate) fn apply_transition(conn: &Connection, task_id: &str, change: &StateChange) -> Result<()> {
    let task = load_task(conn, task_id)?;
    if let Some(expected) = change.expect
        && task.state != expected
    {
        return Err(RuntimeError::precondition(format!(
            "task {task_id} is {} (expected {expected})",
            task.state
        ))
        .into());
    }
    check_transition(task.state, change.to)?;

    let now = now_ts();
    let mut sets: Vec<&str> = vec!["state = ?", "updated_at = ?"];
    let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(change.to), Box::new(now.clone())];

    if stamps_ended_at(change.to) {
        sets.push("ended_at = ?");
        values.push(Box::new(now.clone()));
    } else {
        sets.push("ended_at = NULL");
    }
    if change.to == TaskState::Running {
        sets.push("started_at = COALESCE(started_at, ?)");
        values.push(Box::new(now.clone()));
    }

    let patch = &change.patch;
    if let Some(flag) = patch.control {
        sets.push("control = ?");
        values.push(Box::new(flag));
    }
    if let Some(value) = &patch.resume_instruction {
        sets.push("resume_instruction = ?");
        values.push(Box::new(value.clone()));
    }
    if let Some(value) = &patch.blocked_reason {
        sets.push("blocked_reason = ?");
        values.push(Box::new(value.clone()));
    }
    if let Some(value) = &patch.error {
        sets.push("error = ?");
        values.push(Box::new(value.clone()));
    }
    if let Some(value) = &patch.summary {
        sets.push("summary = ?");
        values.push(Box::new(value.clone()));
    }
    if let Some(completion) = &patch.completion {
        sets.push("completion = ?");
        values.push(Box::new(
            serde_json::to_string(completion).context("encode completion summary")?,
        ));
    }
    if let Some(commit) = &patch.merge_commit {
        sets.push("merge_commit = ?");
        values.push(Box::new(commit.clone()));
    }
    if let Some(metrics) = &patch.metrics {
        sets.push("agent_ms = ?");
        values.push(Box::new(ms_to_sql(metrics.agent_ms)));
        sets.push("test_ms = ?");
        values.push(Box::new(ms_to_sql(metrics.test_ms)));
        sets.push("elapsed_ms = ?");
        values.push(Box::new(ms_to_sql(metrics.elapsed_ms)));
    }
    if patch.release_lease {
        sets.push("lease_owner = NULL");
        sets.push("leased_at = NULL");
    }
    values.push(Box::new(task_id.to_string()));

    let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, params_from_iter(values.iter()))
        .with_context(|| format!("update task {task_id} to {}", change.to))?;

    let mut payload = json!({
        "from": task.state,
        "to": change.to,
        "status": change.to,
        "actor": change.actor,
    });
    if let Some(reason) = &change.reason {
        payload["reason"] = json!(reason);
    }
    if let Some(Some(error)) = &patch.error {
        payload["error"] = json!(error);
    }
    insert_event(conn, task_id, "task.transition", &payload)?;
    info!(
        task_id,
        from = %task.state,
        to = %change.to,
        actor = %change.actor,
        "task transition"
    );
    Ok(())
}

/// Set the control flag and record a `task.control` event.
pub(crate) fn update_control(
    conn: &Connection,
    task_id: &str,
    flag: ControlFlag,
    actor: &str,
) -> Result<()> {
    let task = load_task(conn, task_id)?;
    conn.execute(
        "UPDATE tasks SET control = ?1, updated_at = ?2 WHERE id = ?3",
        params![flag, now_ts(), task_id],
    )
    .context("set control flag")?;
    insert_event(
        conn,
        task_id,
        "task.control",
        &json!({ "control": flag.as_str(), "status": task.state, "actor": actor }),
    )?;
    Ok(())
}

/// Lease owner prefix marking a merge claim.
const MERGE_CLAIM_PREFIX: &str = "merge:";

/// Hold a `WAITING_MERGE` task for a single merge run. The claim lives in
/// the lease columns and is dropped by the transition that ends the merge.
pub(crate) fn claim_merge(conn: &Connection, task_id: &str, actor: &str) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE tasks SET lease_owner = ?1, leased_at = ?2
             WHERE id = ?3 AND state = 'WAITING_MERGE' AND lease_owner IS NULL",
            params![format!("{MERGE_CLAIM_PREFIX}{actor}"), now_ts(), task_id],
        )
        .context("claim task for merge")?;
    if changed == 0 {
        return Err(RuntimeError::precondition(format!(
            "task {task_id} is not waiting for a merge or is already being merged"
        ))
        .into());
    }
    debug!(task_id, actor, "task claimed for merge");
    Ok(())
}

/// Update the resume instruction without a state change.
pub(crate) fn set_resume_instruction(
    conn: &Connection,
    task_id: &str,
    instruction: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET resume_instruction = ?1, updated_at = ?2 WHERE id = ?3",
        params![instruction, now_ts(), task_id],
    )
    .context("set resume instruction")?;
    Ok(())
}

pub(crate) fn insert_decision(conn: &Connection, decision: &DecisionRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO task_decisions (
            token, task_id, bound_state, actions, suggestion, issued_by, created_at, expires_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            decision.token,
            decision.task_id,
            decision.bound_state,
            encode_actions(&decision.actions),
            decision.suggestion,
            decision.issued_by,
            decision.created_at,
            decision.expires_at,
        ],
    )
    .context("insert decision")?;
    Ok(())
}

pub(crate) fn load_decision(conn: &Connection, token: &str) -> Result<Option<DecisionRecord>> {
    conn.query_row(
        "SELECT * FROM task_decisions WHERE token = ?1",
        params![token],
        decision_from_row,
    )
    .optional()
    .context("load decision")
}

/// Supersede every outstanding token of a task. Returns how many were live.
pub(crate) fn supersede_decisions(conn: &Connection, task_id: &str) -> Result<usize> {
    conn.execute(
        "UPDATE task_decisions SET superseded = 1
         WHERE task_id = ?1 AND consumed_at IS NULL AND superseded = 0",
        params![task_id],
    )
    .context("supersede decisions")
}

/// Audit fields recorded when a token is consumed.
pub(crate) struct Consumption<'a> {
    pub token: &'a str,
    pub action: DecisionAction,
    pub actor: &'a str,
    pub suggestion: Option<&'a str>,
    pub result: &'a str,
    pub now: &'a str,
}

/// Mark a live token consumed. Returns false if it was already used,
/// superseded, or expired at `now`.
pub(crate) fn consume_decision(conn: &Connection, consumption: &Consumption<'_>) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE task_decisions
             SET consumed_at = ?1, consumed_by = ?2, consumed_action = ?3,
                 consumed_suggestion = ?4, result = ?5
             WHERE token = ?6 AND consumed_at IS NULL AND superseded = 0 AND expires_at > ?1",
            params![
                consumption.now,
                consumption.actor,
                consumption.action.as_str(),
                consumption.suggestion,
                consumption.result,
                consumption.token,
            ],
        )
        .context("consume decision")?;
    Ok(changed == 1)
}
