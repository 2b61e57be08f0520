//! Embedded SQLite store for job requests, jobs, tasks and flags.
//!
//! Only the controller process opens this database. The schema version is
//! tracked in `PRAGMA user_version`; upgrades apply ordered migration
//! statements inside a transaction. List and map columns are stored as JSON
//! text.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, RunnerError};
use crate::models::{now_secs, Flag, Job, JobRequest, Privacy, State, StatusCode, Task, TaskKind};

const MIGRATIONS: &[(i32, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE job_request (
            id TEXT PRIMARY KEY,
            backend TEXT NOT NULL,
            request TEXT NOT NULL,
            expanded BOOLEAN NOT NULL DEFAULT 0,
            created_at INT NOT NULL
        );

        CREATE TABLE job (
            id TEXT PRIMARY KEY,
            job_request_id TEXT NOT NULL,
            backend TEXT NOT NULL,
            state TEXT NOT NULL,
            repo_url TEXT NOT NULL,
            "commit" TEXT NOT NULL,
            workspace TEXT NOT NULL,
            database_name TEXT NOT NULL,
            action TEXT NOT NULL,
            requires_outputs_from TEXT NOT NULL,
            wait_for_job_ids TEXT NOT NULL,
            run_command TEXT NOT NULL,
            output_spec TEXT NOT NULL,
            outputs TEXT NOT NULL,
            unmatched_patterns TEXT NOT NULL,
            status_message TEXT NOT NULL,
            status_code TEXT NOT NULL,
            cancelled BOOLEAN NOT NULL DEFAULT 0,
            requires_db BOOLEAN NOT NULL DEFAULT 0,
            created_at INT NOT NULL,
            updated_at INT NOT NULL,
            started_at INT,
            completed_at INT,
            status_code_updated_at INT NOT NULL
        );

        CREATE INDEX idx_job__job_request_id ON job (job_request_id);

        -- Terminal jobs are never queried by the scheduler. Indexing only the
        -- non-terminal states keeps the hot query small as history grows.
        CREATE INDEX idx_job__state ON job (state)
            WHERE state NOT IN ('failed', 'succeeded');

        CREATE TABLE tasks (
            id TEXT PRIMARY KEY,
            job_id TEXT,
            backend TEXT NOT NULL,
            kind TEXT NOT NULL,
            definition TEXT NOT NULL,
            active BOOLEAN NOT NULL DEFAULT 1,
            created_at INT NOT NULL,
            finished_at INT,
            agent_stage TEXT,
            agent_complete BOOLEAN NOT NULL DEFAULT 0,
            agent_results TEXT,
            agent_timestamp_ns INT
        );

        CREATE INDEX idx_tasks__job_id ON tasks (job_id);

        CREATE TABLE flags (
            id TEXT NOT NULL,
            value TEXT,
            backend TEXT NOT NULL,
            timestamp INT NOT NULL,
            PRIMARY KEY (id, backend)
        );
        "#,
    ),
    (
        2,
        r#"
        CREATE INDEX idx_tasks__backend_active ON tasks (backend) WHERE active;
        "#,
    ),
];

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        let mut db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&mut self) -> Result<()> {
        for (version, sql) in MIGRATIONS {
            let current: i32 =
                self.conn
                    .query_row("PRAGMA user_version", [], |row| row.get(0))?;
            if current >= *version {
                continue;
            }
            let tx = self.conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.pragma_update(None, "user_version", version)?;
            tx.commit()?;
            tracing::info!(version, "Applied database migration");
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i32> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Run a composite write atomically. All multi-row state transitions go
    /// through this so readers never observe a half-applied transition.
    pub fn in_transaction<T>(
        &mut self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let tx = self.conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // ---- job requests ----

    /// Insert a job request if we have not seen it before. Returns true if
    /// the row was inserted.
    pub fn upsert_job_request(&mut self, request: &JobRequest) -> Result<bool> {
        let inserted = insert_job_request(&self.conn, request)?;
        Ok(inserted)
    }

    pub fn get_job_request(&self, id: &str) -> Result<Option<JobRequest>> {
        get_job_request(&self.conn, id)
    }

    pub fn unexpanded_job_requests(&self, backend: &str) -> Result<Vec<JobRequest>> {
        let mut stmt = self.conn.prepare(
            "SELECT request FROM job_request
             WHERE backend = ?1 AND expanded = 0 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![backend], |row| row.get::<_, String>(0))?;
        let mut requests = Vec::new();
        for raw in rows {
            requests.push(serde_json::from_str(&raw?)?);
        }
        Ok(requests)
    }

    // ---- jobs ----

    pub fn get_job(&self, id: &str) -> Result<Job> {
        get_job(&self.conn, id)?.ok_or_else(|| RunnerError::JobNotFound(id.to_string()))
    }

    pub fn insert_job(&mut self, job: &Job) -> Result<()> {
        insert_job(&self.conn, job)
    }

    pub fn update_job(&mut self, job: &Job) -> Result<()> {
        update_job(&self.conn, job)
    }

    /// All non-terminal jobs for a backend, oldest first. This is the
    /// scheduler's hot query and is served by the partial state index.
    pub fn active_jobs(&self, backend: &str) -> Result<Vec<Job>> {
        query_jobs(
            &self.conn,
            "SELECT * FROM job
             WHERE state IN ('pending', 'running') AND backend = ?1
             ORDER BY created_at",
            params![backend],
        )
    }

    pub fn running_jobs(&self, backend: &str) -> Result<Vec<Job>> {
        query_jobs(
            &self.conn,
            "SELECT * FROM job WHERE state = 'running' AND backend = ?1",
            params![backend],
        )
    }

    /// Every job on a backend, cancelled ones included. Used by reporting
    /// and tests; the scheduler sticks to [`Database::active_jobs`].
    pub fn all_jobs(&self, backend: &str) -> Result<Vec<Job>> {
        query_jobs(
            &self.conn,
            "SELECT * FROM job WHERE backend = ?1 ORDER BY created_at, id",
            params![backend],
        )
    }

    pub fn jobs_for_request(&self, job_request_id: &str) -> Result<Vec<Job>> {
        query_jobs(
            &self.conn,
            "SELECT * FROM job WHERE job_request_id = ?1 ORDER BY created_at",
            params![job_request_id],
        )
    }

    pub fn job_states(&self, ids: &[String]) -> Result<Vec<State>> {
        let mut states = Vec::with_capacity(ids.len());
        let mut stmt = self.conn.prepare("SELECT state FROM job WHERE id = ?1")?;
        for id in ids {
            let state: Option<String> = stmt
                .query_row(params![id], |row| row.get(0))
                .optional()?;
            if let Some(state) = state {
                states.push(parse_state(&state)?);
            }
        }
        Ok(states)
    }

    /// All uncancelled jobs ever run in a workspace, used to compute the
    /// latest job per action when building new jobs.
    pub fn workspace_jobs(&self, backend: &str, workspace: &str) -> Result<Vec<Job>> {
        query_jobs(
            &self.conn,
            "SELECT * FROM job
             WHERE backend = ?1 AND workspace = ?2 AND cancelled = 0
             ORDER BY created_at",
            params![backend, workspace],
        )
    }

    /// Job request ids with at least one non-terminal job.
    pub fn active_job_request_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT job_request_id FROM job
             WHERE state IN ('pending', 'running')",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Flag jobs in a request as cancelled. Jobs are modified in place in the
    /// database rather than read-modified-written so this cannot race with
    /// the scheduler updating the same rows.
    pub fn set_cancelled_flags(&mut self, job_request_id: &str, actions: &[String]) -> Result<()> {
        for action in actions {
            self.conn.execute(
                "UPDATE job SET cancelled = 1
                 WHERE job_request_id = ?1 AND action = ?2
                   AND state IN ('pending', 'running')",
                params![job_request_id, action],
            )?;
        }
        Ok(())
    }

    // ---- tasks ----

    pub fn get_task(&self, id: &str) -> Result<Task> {
        get_task(&self.conn, id)?.ok_or_else(|| RunnerError::TaskNotFound(id.to_string()))
    }

    pub fn insert_task(&mut self, task: &Task) -> Result<()> {
        insert_task(&self.conn, task)
    }

    pub fn active_tasks(&self, backend: &str) -> Result<Vec<Task>> {
        query_tasks(
            &self.conn,
            "SELECT * FROM tasks WHERE backend = ?1 AND active = 1 ORDER BY created_at",
            params![backend],
        )
    }

    pub fn tasks_for_job(&self, job_id: &str, kind: TaskKind) -> Result<Vec<Task>> {
        tasks_for_job(&self.conn, job_id, kind)
    }

    pub fn active_task_exists(&self, backend: &str, kind: TaskKind) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE backend = ?1 AND kind = ?2 AND active = 1",
            params![backend, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn task_finished_since(&self, backend: &str, kind: TaskKind, cutoff: i64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE backend = ?1 AND kind = ?2 AND active = 0 AND finished_at > ?3",
            params![backend, kind.as_str(), cutoff],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ---- flags ----

    pub fn get_flag(&self, name: &str, backend: &str) -> Result<Option<Flag>> {
        get_flag(&self.conn, name, backend)
    }

    pub fn get_flag_value(&self, name: &str, backend: &str) -> Result<Option<String>> {
        Ok(self.get_flag(name, backend)?.and_then(|f| f.value))
    }

    /// Set a flag, leaving the timestamp untouched if the value is unchanged.
    pub fn set_flag(&mut self, name: &str, value: Option<&str>, backend: &str) -> Result<Flag> {
        set_flag(&self.conn, name, value, backend)
    }

    pub fn current_flags(&self, backend: &str) -> Result<Vec<Flag>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, value, backend, timestamp FROM flags WHERE backend = ?1")?;
        let rows = stmt.query_map(params![backend], flag_from_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}

// ---- row operations, usable inside transactions ----

pub fn insert_job_request(conn: &Connection, request: &JobRequest) -> Result<bool> {
    let serialized = serde_json::to_string(request)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO job_request (id, backend, request, expanded, created_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![request.id, request.backend, serialized, now_secs()],
    )?;
    Ok(inserted > 0)
}

pub fn get_job_request(conn: &Connection, id: &str) -> Result<Option<JobRequest>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT request FROM job_request WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn mark_job_request_expanded(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE job_request SET expanded = 1 WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

pub fn insert_job(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        r#"INSERT INTO job (
            id, job_request_id, backend, state, repo_url, "commit", workspace,
            database_name, action, requires_outputs_from, wait_for_job_ids,
            run_command, output_spec, outputs, unmatched_patterns,
            status_message, status_code, cancelled, requires_db,
            created_at, updated_at, started_at, completed_at, status_code_updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
            ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24
        )"#,
        params![
            job.id,
            job.job_request_id,
            job.backend,
            job.state.as_str(),
            job.repo_url,
            job.commit,
            job.workspace,
            job.database_name,
            job.action,
            serde_json::to_string(&job.requires_outputs_from)?,
            serde_json::to_string(&job.wait_for_job_ids)?,
            serde_json::to_string(&job.run_command)?,
            serde_json::to_string(&job.output_spec)?,
            serde_json::to_string(&job.outputs)?,
            serde_json::to_string(&job.unmatched_patterns)?,
            job.status_message,
            job.status_code.as_str(),
            job.cancelled,
            job.requires_db,
            job.created_at,
            job.updated_at,
            job.started_at,
            job.completed_at,
            job.status_code_updated_at,
        ],
    )?;
    Ok(())
}

/// Update a job row. The `cancelled` column is deliberately excluded: it is
/// written by the sync path and must not be clobbered by a stale in-memory
/// copy held by the scheduler.
pub fn update_job(conn: &Connection, job: &Job) -> Result<()> {
    let updated = conn.execute(
        r#"UPDATE job SET
            state = ?2, status_message = ?3, status_code = ?4, outputs = ?5,
            unmatched_patterns = ?6, wait_for_job_ids = ?7, updated_at = ?8,
            started_at = ?9, completed_at = ?10, status_code_updated_at = ?11
        WHERE id = ?1"#,
        params![
            job.id,
            job.state.as_str(),
            job.status_message,
            job.status_code.as_str(),
            serde_json::to_string(&job.outputs)?,
            serde_json::to_string(&job.unmatched_patterns)?,
            serde_json::to_string(&job.wait_for_job_ids)?,
            job.updated_at,
            job.started_at,
            job.completed_at,
            job.status_code_updated_at,
        ],
    )?;
    if updated == 0 {
        return Err(RunnerError::JobNotFound(job.id.clone()));
    }
    Ok(())
}

pub fn get_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let mut stmt = conn.prepare("SELECT * FROM job WHERE id = ?1")?;
    let job = stmt
        .query_row(params![id], |row| {
            job_from_row(row).map_err(|e| row_error(e))
        })
        .optional()?;
    Ok(job)
}

pub fn query_jobs(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| job_from_row(row).map_err(|e| row_error(e)))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

pub fn insert_task(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks (
            id, job_id, backend, kind, definition, active, created_at,
            finished_at, agent_stage, agent_complete, agent_results, agent_timestamp_ns
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            task.id,
            task.job_id,
            task.backend,
            task.kind.as_str(),
            serde_json::to_string(&task.definition)?,
            task.active,
            task.created_at,
            task.finished_at,
            task.agent_stage,
            task.agent_complete,
            task.agent_results
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            task.agent_timestamp_ns,
        ],
    )?;
    Ok(())
}

pub fn update_task(conn: &Connection, task: &Task) -> Result<()> {
    let updated = conn.execute(
        "UPDATE tasks SET
            active = ?2, finished_at = ?3, agent_stage = ?4,
            agent_complete = ?5, agent_results = ?6, agent_timestamp_ns = ?7
         WHERE id = ?1",
        params![
            task.id,
            task.active,
            task.finished_at,
            task.agent_stage,
            task.agent_complete,
            task.agent_results
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            task.agent_timestamp_ns,
        ],
    )?;
    if updated == 0 {
        return Err(RunnerError::TaskNotFound(task.id.clone()));
    }
    Ok(())
}

pub fn get_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;
    let task = stmt
        .query_row(params![id], |row| {
            task_from_row(row).map_err(|e| row_error(e))
        })
        .optional()?;
    Ok(task)
}

/// Tasks for a job of a given kind, in creation order. Task ids embed a
/// zero-padded attempt number so id order matches creation order.
pub fn tasks_for_job(conn: &Connection, job_id: &str, kind: TaskKind) -> Result<Vec<Task>> {
    query_tasks(
        conn,
        "SELECT * FROM tasks WHERE job_id = ?1 AND kind = ?2 ORDER BY id",
        params![job_id, kind.as_str()],
    )
}

pub fn query_tasks(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| task_from_row(row).map_err(|e| row_error(e)))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

pub fn get_flag(conn: &Connection, name: &str, backend: &str) -> Result<Option<Flag>> {
    let mut stmt =
        conn.prepare("SELECT id, value, backend, timestamp FROM flags WHERE id = ?1 AND backend = ?2")?;
    Ok(stmt
        .query_row(params![name, backend], flag_from_row)
        .optional()?)
}

pub fn set_flag(conn: &Connection, name: &str, value: Option<&str>, backend: &str) -> Result<Flag> {
    if let Some(current) = get_flag(conn, name, backend)? {
        if current.value.as_deref() == value {
            return Ok(current);
        }
    }
    let flag = Flag {
        id: name.to_string(),
        value: value.map(|v| v.to_string()),
        backend: backend.to_string(),
        timestamp: now_secs(),
    };
    conn.execute(
        "INSERT INTO flags (id, value, backend, timestamp) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (id, backend) DO UPDATE SET value = ?2, timestamp = ?4",
        params![flag.id, flag.value, flag.backend, flag.timestamp],
    )?;
    Ok(flag)
}

// ---- row mapping ----

fn row_error(err: RunnerError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(SerializationError(err.to_string())),
    )
}

#[derive(Debug)]
struct SerializationError(String);

impl std::fmt::Display for SerializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SerializationError {}

fn parse_state(value: &str) -> Result<State> {
    State::from_str(value).ok_or_else(|| RunnerError::Internal(format!("unknown state '{value}'")))
}

fn job_from_row(row: &Row<'_>) -> std::result::Result<Job, RunnerError> {
    let state: String = row.get("state")?;
    let status_code: String = row.get("status_code")?;
    let requires_outputs_from: String = row.get("requires_outputs_from")?;
    let wait_for_job_ids: String = row.get("wait_for_job_ids")?;
    let run_command: String = row.get("run_command")?;
    let output_spec: String = row.get("output_spec")?;
    let outputs: String = row.get("outputs")?;
    let unmatched_patterns: String = row.get("unmatched_patterns")?;
    Ok(Job {
        id: row.get("id")?,
        job_request_id: row.get("job_request_id")?,
        backend: row.get("backend")?,
        state: parse_state(&state)?,
        repo_url: row.get("repo_url")?,
        commit: row.get("commit")?,
        workspace: row.get("workspace")?,
        database_name: row.get("database_name")?,
        action: row.get("action")?,
        requires_outputs_from: serde_json::from_str(&requires_outputs_from)?,
        wait_for_job_ids: serde_json::from_str(&wait_for_job_ids)?,
        run_command: serde_json::from_str(&run_command)?,
        output_spec: serde_json::from_str::<BTreeMap<String, Privacy>>(&output_spec)?,
        outputs: serde_json::from_str(&outputs)?,
        unmatched_patterns: serde_json::from_str(&unmatched_patterns)?,
        status_message: row.get("status_message")?,
        status_code: StatusCode::from_str(&status_code)
            .ok_or_else(|| RunnerError::Internal(format!("unknown status code '{status_code}'")))?,
        cancelled: row.get("cancelled")?,
        requires_db: row.get("requires_db")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        status_code_updated_at: row.get("status_code_updated_at")?,
    })
}

fn task_from_row(row: &Row<'_>) -> std::result::Result<Task, RunnerError> {
    let kind: String = row.get("kind")?;
    let definition: String = row.get("definition")?;
    let agent_results: Option<String> = row.get("agent_results")?;
    Ok(Task {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        backend: row.get("backend")?,
        kind: TaskKind::from_str(&kind)
            .ok_or_else(|| RunnerError::Internal(format!("unknown task kind '{kind}'")))?,
        definition: serde_json::from_str(&definition)?,
        active: row.get("active")?,
        created_at: row.get("created_at")?,
        finished_at: row.get("finished_at")?,
        agent_stage: row.get("agent_stage")?,
        agent_complete: row.get("agent_complete")?,
        agent_results: agent_results
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        agent_timestamp_ns: row.get("agent_timestamp_ns")?,
    })
}

fn flag_from_row(row: &Row<'_>) -> std::result::Result<Flag, rusqlite::Error> {
    Ok(Flag {
        id: row.get(0)?,
        value: row.get(1)?,
        backend: row.get(2)?,
        timestamp: row.get(3)?,
    })
}
