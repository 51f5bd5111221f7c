#![forbid(unsafe_code)]

use crate::backend::{LockOutcome, StoreBackend};
use crate::error::StoreError;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::path::Path;
use std::time::Duration;
use tp_core::model::{
    Checkpoint, CheckpointProgress, CommandRun, Job, JobState, RunStatus, TaskLock,
    TokenUsageRecord,
};

const DB_FILE: &str = "taskpilot.db";

const SCHEMA_SQL: &str = r#"
        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          job_type TEXT NOT NULL,
          state TEXT NOT NULL,
          command_run_id TEXT,
          command_name TEXT NOT NULL,
          workspace_id TEXT NOT NULL,
          project_key TEXT,
          payload_json TEXT NOT NULL,
          total_items INTEGER,
          processed_items INTEGER,
          last_checkpoint TEXT,
          agent_ids_json TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          completed_at_ms INTEGER,
          error_summary TEXT,
          duration_seconds REAL
        );

        CREATE TABLE IF NOT EXISTS command_runs (
          id TEXT PRIMARY KEY,
          command_name TEXT NOT NULL,
          workspace_id TEXT NOT NULL,
          project_key TEXT,
          job_id TEXT,
          task_ids_json TEXT NOT NULL,
          git_branch TEXT,
          git_base_branch TEXT,
          started_at_ms INTEGER NOT NULL,
          completed_at_ms INTEGER,
          status TEXT NOT NULL,
          error_summary TEXT,
          duration_seconds REAL,
          sp_processed INTEGER
        );

        CREATE TABLE IF NOT EXISTS checkpoints (
          job_id TEXT NOT NULL,
          checkpoint_seq INTEGER NOT NULL,
          checkpoint_id TEXT NOT NULL,
          schema_version INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL,
          status TEXT NOT NULL,
          stage TEXT NOT NULL,
          timestamp_ms INTEGER NOT NULL,
          reason TEXT,
          progress_total INTEGER,
          progress_completed INTEGER,
          details_json TEXT NOT NULL,
          PRIMARY KEY (job_id, checkpoint_seq)
        );

        -- Lease rows: at most one live lock per task. The expires index
        -- supports opportunistic sweeps; reclaim-on-acquire never needs it.
        CREATE TABLE IF NOT EXISTS task_locks (
          task_id TEXT PRIMARY KEY,
          task_run_id TEXT NOT NULL,
          job_id TEXT NOT NULL,
          acquired_at_ms INTEGER NOT NULL,
          expires_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS task_locks_by_expires ON task_locks(expires_at_ms);
        CREATE INDEX IF NOT EXISTS task_locks_by_job ON task_locks(job_id);

        CREATE TABLE IF NOT EXISTS token_usage (
          workspace_id TEXT NOT NULL,
          agent_id TEXT,
          model_name TEXT,
          job_id TEXT,
          command_run_id TEXT,
          task_run_id TEXT,
          task_id TEXT,
          input_tokens INTEGER,
          output_tokens INTEGER,
          total_tokens INTEGER,
          cost_usd REAL,
          duration_ms INTEGER,
          timestamp_ms INTEGER NOT NULL,
          metadata_json TEXT NOT NULL
        );
"#;

/// Relational mirror binding (sqlite). Optional; the file binding remains
/// the primary record, except for task locks which are arbitrated here
/// whenever the mirror is active.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let conn = Connection::open(root.join(DB_FILE))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}

struct RawJob {
    id: String,
    job_type: String,
    state: String,
    command_run_id: Option<String>,
    command_name: String,
    workspace_id: String,
    project_key: Option<String>,
    payload_json: String,
    total_items: Option<i64>,
    processed_items: Option<i64>,
    last_checkpoint: Option<String>,
    agent_ids_json: String,
    created_at_ms: i64,
    updated_at_ms: i64,
    completed_at_ms: Option<i64>,
    error_summary: Option<String>,
    duration_seconds: Option<f64>,
}

impl RawJob {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_type: row.get(1)?,
            state: row.get(2)?,
            command_run_id: row.get(3)?,
            command_name: row.get(4)?,
            workspace_id: row.get(5)?,
            project_key: row.get(6)?,
            payload_json: row.get(7)?,
            total_items: row.get(8)?,
            processed_items: row.get(9)?,
            last_checkpoint: row.get(10)?,
            agent_ids_json: row.get(11)?,
            created_at_ms: row.get(12)?,
            updated_at_ms: row.get(13)?,
            completed_at_ms: row.get(14)?,
            error_summary: row.get(15)?,
            duration_seconds: row.get(16)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        Ok(Job {
            id: self.id,
            job_type: self.job_type,
            state: parse_job_state(&self.state)?,
            command_run_id: self.command_run_id,
            command_name: self.command_name,
            workspace_id: self.workspace_id,
            project_key: self.project_key,
            payload: parse_json_map(&self.payload_json)?,
            total_items: self.total_items,
            processed_items: self.processed_items,
            last_checkpoint: self.last_checkpoint,
            agent_ids: serde_json::from_str(&self.agent_ids_json)?,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
            completed_at_ms: self.completed_at_ms,
            error_summary: self.error_summary,
            duration_seconds: self.duration_seconds,
        })
    }
}

const JOB_COLUMNS: &str = "id, job_type, state, command_run_id, command_name, workspace_id, \
     project_key, payload_json, total_items, processed_items, last_checkpoint, agent_ids_json, \
     created_at_ms, updated_at_ms, completed_at_ms, error_summary, duration_seconds";

struct RawRun {
    id: String,
    command_name: String,
    workspace_id: String,
    project_key: Option<String>,
    job_id: Option<String>,
    task_ids_json: String,
    git_branch: Option<String>,
    git_base_branch: Option<String>,
    started_at_ms: i64,
    completed_at_ms: Option<i64>,
    status: String,
    error_summary: Option<String>,
    duration_seconds: Option<f64>,
    sp_processed: Option<i64>,
}

impl RawRun {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            command_name: row.get(1)?,
            workspace_id: row.get(2)?,
            project_key: row.get(3)?,
            job_id: row.get(4)?,
            task_ids_json: row.get(5)?,
            git_branch: row.get(6)?,
            git_base_branch: row.get(7)?,
            started_at_ms: row.get(8)?,
            completed_at_ms: row.get(9)?,
            status: row.get(10)?,
            error_summary: row.get(11)?,
            duration_seconds: row.get(12)?,
            sp_processed: row.get(13)?,
        })
    }

    fn into_run(self) -> Result<CommandRun, StoreError> {
        Ok(CommandRun {
            id: self.id,
            command_name: self.command_name,
            workspace_id: self.workspace_id,
            project_key: self.project_key,
            job_id: self.job_id,
            task_ids: serde_json::from_str(&self.task_ids_json)?,
            git_branch: self.git_branch,
            git_base_branch: self.git_base_branch,
            started_at_ms: self.started_at_ms,
            completed_at_ms: self.completed_at_ms,
            status: parse_run_status(&self.status)?,
            error_summary: self.error_summary,
            duration_seconds: self.duration_seconds,
            sp_processed: self.sp_processed,
        })
    }
}

const RUN_COLUMNS: &str = "id, command_name, workspace_id, project_key, job_id, task_ids_json, \
     git_branch, git_base_branch, started_at_ms, completed_at_ms, status, error_summary, \
     duration_seconds, sp_processed";

impl StoreBackend for SqliteStore {
    fn put_job(&mut self, job: &Job) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO jobs(id, job_type, state, command_run_id, command_name, \
             workspace_id, project_key, payload_json, total_items, processed_items, \
             last_checkpoint, agent_ids_json, created_at_ms, updated_at_ms, completed_at_ms, \
             error_summary, duration_seconds) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                job.id,
                job.job_type,
                job.state.as_str(),
                job.command_run_id,
                job.command_name,
                job.workspace_id,
                job.project_key,
                JsonValue::Object(job.payload.clone()).to_string(),
                job.total_items,
                job.processed_items,
                job.last_checkpoint,
                serde_json::to_string(&job.agent_ids)?,
                job.created_at_ms,
                job.updated_at_ms,
                job.completed_at_ms,
                job.error_summary,
                job.duration_seconds,
            ],
        )?;
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
                params![job_id],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at_ms ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], RawJob::from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.into_job()?);
        }
        Ok(out)
    }

    fn put_command_run(&mut self, run: &CommandRun) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO command_runs(id, command_name, workspace_id, project_key, \
             job_id, task_ids_json, git_branch, git_base_branch, started_at_ms, completed_at_ms, \
             status, error_summary, duration_seconds, sp_processed) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                run.id,
                run.command_name,
                run.workspace_id,
                run.project_key,
                run.job_id,
                serde_json::to_string(&run.task_ids)?,
                run.git_branch,
                run.git_base_branch,
                run.started_at_ms,
                run.completed_at_ms,
                run.status.as_str(),
                run.error_summary,
                run.duration_seconds,
                run.sp_processed,
            ],
        )?;
        Ok(())
    }

    fn get_command_run(&self, run_id: &str) -> Result<Option<CommandRun>, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM command_runs WHERE id=?1"),
                params![run_id],
                RawRun::from_row,
            )
            .optional()?;
        raw.map(RawRun::into_run).transpose()
    }

    fn list_command_runs(&self) -> Result<Vec<CommandRun>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM command_runs ORDER BY started_at_ms ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], RawRun::from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.into_run()?);
        }
        Ok(out)
    }

    fn append_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO checkpoints(job_id, checkpoint_seq, checkpoint_id, schema_version, \
             created_at_ms, status, stage, timestamp_ms, reason, progress_total, \
             progress_completed, details_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                checkpoint.job_id,
                checkpoint.checkpoint_seq,
                checkpoint.checkpoint_id,
                checkpoint.schema_version,
                checkpoint.created_at_ms,
                checkpoint.status.as_str(),
                checkpoint.stage,
                checkpoint.timestamp_ms,
                checkpoint.reason,
                checkpoint.progress.total,
                checkpoint.progress.completed,
                JsonValue::Object(checkpoint.details.clone()).to_string(),
            ],
        )?;
        Ok(())
    }

    fn max_checkpoint_seq(&self, job_id: &str) -> Result<i64, StoreError> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(checkpoint_seq) FROM checkpoints WHERE job_id=?1",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    fn list_checkpoints(&self, job_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, checkpoint_seq, checkpoint_id, schema_version, created_at_ms, \
             status, stage, timestamp_ms, reason, progress_total, progress_completed, \
             details_json \
             FROM checkpoints WHERE job_id=?1 ORDER BY checkpoint_seq ASC",
        )?;
        type RawCheckpoint = (
            String,
            i64,
            String,
            i64,
            i64,
            String,
            String,
            i64,
            Option<String>,
            Option<i64>,
            Option<i64>,
            String,
        );
        let rows = stmt.query_map(params![job_id], |row| {
            Ok::<RawCheckpoint, rusqlite::Error>((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
                row.get(11)?,
            ))
        })?;
        let mut out = Vec::new();
        for raw in rows {
            let (
                job_id,
                checkpoint_seq,
                checkpoint_id,
                schema_version,
                created_at_ms,
                status,
                stage,
                timestamp_ms,
                reason,
                progress_total,
                progress_completed,
                details_json,
            ) = raw?;
            out.push(Checkpoint {
                schema_version,
                job_id,
                checkpoint_seq,
                checkpoint_id,
                created_at_ms,
                status: parse_job_state(&status)?,
                stage,
                timestamp_ms,
                reason,
                progress: CheckpointProgress {
                    total: progress_total,
                    completed: progress_completed,
                },
                details: parse_json_map(&details_json)?,
            });
        }
        Ok(out)
    }

    fn acquire_task_lock(&mut self, candidate: &TaskLock) -> Result<LockOutcome, StoreError> {
        let tx = self.conn.transaction()?;
        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT task_run_id, expires_at_ms FROM task_locks WHERE task_id=?1",
                params![candidate.task_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((task_run_id, expires_at_ms)) = existing
            && expires_at_ms > candidate.acquired_at_ms
        {
            return Ok(LockOutcome::AlreadyLocked {
                task_run_id,
                expires_at_ms,
            });
        }
        tx.execute(
            "INSERT OR REPLACE INTO task_locks(task_id, task_run_id, job_id, acquired_at_ms, \
             expires_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                candidate.task_id,
                candidate.task_run_id,
                candidate.job_id,
                candidate.acquired_at_ms,
                candidate.expires_at_ms,
            ],
        )?;
        tx.commit()?;
        Ok(LockOutcome::Acquired(candidate.clone()))
    }

    fn get_task_lock(&self, task_id: &str) -> Result<Option<TaskLock>, StoreError> {
        let lock = self
            .conn
            .query_row(
                "SELECT task_id, task_run_id, job_id, acquired_at_ms, expires_at_ms \
                 FROM task_locks WHERE task_id=?1",
                params![task_id],
                |row| {
                    Ok(TaskLock {
                        task_id: row.get(0)?,
                        task_run_id: row.get(1)?,
                        job_id: row.get(2)?,
                        acquired_at_ms: row.get(3)?,
                        expires_at_ms: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(lock)
    }

    fn release_task_lock(&mut self, task_id: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM task_locks WHERE task_id=?1", params![task_id])?;
        Ok(removed > 0)
    }

    fn release_task_locks_by_job(&mut self, job_id: &str) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM task_locks WHERE job_id=?1", params![job_id])?;
        Ok(removed)
    }

    fn append_token_usage(&mut self, record: &TokenUsageRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO token_usage(workspace_id, agent_id, model_name, job_id, \
             command_run_id, task_run_id, task_id, input_tokens, output_tokens, total_tokens, \
             cost_usd, duration_ms, timestamp_ms, metadata_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.workspace_id,
                record.agent_id,
                record.model_name,
                record.job_id,
                record.command_run_id,
                record.task_run_id,
                record.task_id,
                record.input_tokens,
                record.output_tokens,
                record.total_tokens,
                record.cost_usd,
                record.duration_ms,
                record.timestamp_ms,
                JsonValue::Object(record.metadata.clone()).to_string(),
            ],
        )?;
        Ok(())
    }

    fn list_token_usage(&self) -> Result<Vec<TokenUsageRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT workspace_id, agent_id, model_name, job_id, command_run_id, task_run_id, \
             task_id, input_tokens, output_tokens, total_tokens, cost_usd, duration_ms, \
             timestamp_ms, metadata_json \
             FROM token_usage ORDER BY timestamp_ms ASC, rowid ASC",
        )?;
        type RawUsage = (
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<f64>,
            Option<i64>,
            i64,
            String,
        );
        let rows = stmt.query_map([], |row| {
            Ok::<RawUsage, rusqlite::Error>((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
                row.get(11)?,
                row.get(12)?,
                row.get(13)?,
            ))
        })?;
        let mut out = Vec::new();
        for raw in rows {
            let (
                workspace_id,
                agent_id,
                model_name,
                job_id,
                command_run_id,
                task_run_id,
                task_id,
                input_tokens,
                output_tokens,
                total_tokens,
                cost_usd,
                duration_ms,
                timestamp_ms,
                metadata_json,
            ) = raw?;
            out.push(TokenUsageRecord {
                workspace_id,
                agent_id,
                model_name,
                job_id,
                command_run_id,
                task_run_id,
                task_id,
                input_tokens,
                output_tokens,
                total_tokens,
                cost_usd,
                duration_ms,
                timestamp_ms,
                metadata: parse_json_map(&metadata_json)?,
            });
        }
        Ok(out)
    }
}

fn parse_job_state(value: &str) -> Result<JobState, StoreError> {
    JobState::parse(value).ok_or(StoreError::InvalidInput("unknown job state in store"))
}

fn parse_run_status(value: &str) -> Result<RunStatus, StoreError> {
    RunStatus::parse(value).ok_or(StoreError::InvalidInput("unknown run status in store"))
}

fn parse_json_map(text: &str) -> Result<JsonMap<String, JsonValue>, StoreError> {
    if text.trim().is_empty() {
        return Ok(JsonMap::new());
    }
    match serde_json::from_str::<JsonValue>(text)? {
        JsonValue::Object(map) => Ok(map),
        _ => Err(StoreError::InvalidInput("expected a JSON object column")),
    }
}
