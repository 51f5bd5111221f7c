#![forbid(unsafe_code)]

use crate::backend::{LockOutcome, StoreBackend};
use crate::error::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::{File, TryLockError};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tp_core::model::{Checkpoint, CommandRun, Job, TaskLock, TokenUsageRecord};
use tp_core::time::ts_ms_to_rfc3339;

const CHECKPOINT_SUFFIX: &str = ".ckpt.json";

const LEASE_MUTEX_RETRIES: u32 = 50;
const LEASE_MUTEX_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Append-only file binding under a workspace-scoped root directory.
///
/// Layout:
///   jobs.json / command_runs.json / task_locks.json  — JSON objects keyed by id
///   task_locks.lock                                  — advisory mutex over the lease map
///   token_usage.json                                 — JSON array, append-only
///   jobs/<job_id>/checkpoints/<000001..>.ckpt.json   — one file per checkpoint
///   jobs/<job_id>/manifest.json                      — latest denormalized snapshot
///   jobs/<job_id>/logs/stream.log                    — append-only log stream
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn jobs_path(&self) -> PathBuf {
        self.root.join("jobs.json")
    }

    fn runs_path(&self) -> PathBuf {
        self.root.join("command_runs.json")
    }

    fn locks_path(&self) -> PathBuf {
        self.root.join("task_locks.json")
    }

    fn locks_mutex_path(&self) -> PathBuf {
        self.root.join("task_locks.lock")
    }

    /// Advisory cross-process mutex over the lease map. Every lease mutation
    /// is a read-modify-write of `task_locks.json`, and the lease is the only
    /// cross-process mutual-exclusion primitive, so the mutation itself must
    /// be exclusive too. The lock lives on a stable sidecar file: the map
    /// file is replaced by rename on every write and cannot carry it. The OS
    /// releases the lock when the returned handle drops, crashed holders
    /// included.
    fn lock_lease_mutex(&self) -> Result<File, StoreError> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.locks_mutex_path())?;
        for _ in 0..LEASE_MUTEX_RETRIES {
            match file.try_lock() {
                Ok(()) => return Ok(file),
                Err(TryLockError::WouldBlock) => std::thread::sleep(LEASE_MUTEX_RETRY_SLEEP),
                Err(TryLockError::Error(err)) => return Err(err.into()),
            }
        }
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            "task lock map is held by another process",
        )))
    }

    fn usage_path(&self) -> PathBuf {
        self.root.join("token_usage.json")
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join(job_id)
    }

    fn checkpoint_dir(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("checkpoints")
    }

    /// Denormalized latest Job snapshot, readable by external tooling
    /// without touching the lock/lease tables.
    pub fn write_manifest(&self, job: &Job) -> Result<(), StoreError> {
        let dir = self.job_dir(&job.id);
        std::fs::create_dir_all(&dir)?;
        let manifest = json!({
            "job_id": job.id,
            "job_type": job.job_type,
            "state": job.state,
            "command_run_id": job.command_run_id,
            "command_name": job.command_name,
            "workspace_id": job.workspace_id,
            "project_key": job.project_key,
            "payload": job.payload,
            "progress": {
                "total": job.total_items,
                "completed": job.processed_items,
            },
            "last_checkpoint": job.last_checkpoint,
            "agent_ids": job.agent_ids,
            "error_summary": job.error_summary,
            "duration_seconds": job.duration_seconds,
            "created_at": ts_ms_to_rfc3339(job.created_at_ms),
            "updated_at": ts_ms_to_rfc3339(job.updated_at_ms),
            "completed_at": job.completed_at_ms.map(ts_ms_to_rfc3339),
        });
        write_json_atomic(&dir.join("manifest.json"), &manifest)
    }

    pub fn append_log(&self, job_id: &str, line: &str) -> Result<(), StoreError> {
        let dir = self.job_dir(job_id).join("logs");
        std::fs::create_dir_all(&dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("stream.log"))?;
        file.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Returns the stream verbatim; an absent log reads as empty.
    pub fn read_log(&self, job_id: &str) -> Result<String, StoreError> {
        let path = self.job_dir(job_id).join("logs").join("stream.log");
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }
}

impl StoreBackend for FileStore {
    fn put_job(&mut self, job: &Job) -> Result<(), StoreError> {
        let mut jobs: BTreeMap<String, Job> = load_json(&self.jobs_path())?;
        jobs.insert(job.id.clone(), job.clone());
        write_json_atomic(&self.jobs_path(), &jobs)
    }

    fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let mut jobs: BTreeMap<String, Job> = load_json(&self.jobs_path())?;
        Ok(jobs.remove(job_id))
    }

    fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs: BTreeMap<String, Job> = load_json(&self.jobs_path())?;
        let mut out: Vec<Job> = jobs.into_values().collect();
        out.sort_by_key(|job| job.created_at_ms);
        Ok(out)
    }

    fn put_command_run(&mut self, run: &CommandRun) -> Result<(), StoreError> {
        let mut runs: BTreeMap<String, CommandRun> = load_json(&self.runs_path())?;
        runs.insert(run.id.clone(), run.clone());
        write_json_atomic(&self.runs_path(), &runs)
    }

    fn get_command_run(&self, run_id: &str) -> Result<Option<CommandRun>, StoreError> {
        let mut runs: BTreeMap<String, CommandRun> = load_json(&self.runs_path())?;
        Ok(runs.remove(run_id))
    }

    fn list_command_runs(&self) -> Result<Vec<CommandRun>, StoreError> {
        let runs: BTreeMap<String, CommandRun> = load_json(&self.runs_path())?;
        let mut out: Vec<CommandRun> = runs.into_values().collect();
        out.sort_by_key(|run| run.started_at_ms);
        Ok(out)
    }

    fn append_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        if checkpoint.checkpoint_seq < 1 {
            return Err(StoreError::InvalidInput("checkpoint_seq must be >= 1"));
        }
        let dir = self.checkpoint_dir(&checkpoint.job_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{:06}{CHECKPOINT_SUFFIX}", checkpoint.checkpoint_seq));
        if path.exists() {
            return Err(StoreError::InvalidInput(
                "checkpoint sequence already persisted for this job",
            ));
        }
        write_json_atomic(&path, checkpoint)
    }

    fn max_checkpoint_seq(&self, job_id: &str) -> Result<i64, StoreError> {
        let dir = self.checkpoint_dir(job_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut max_seq = 0i64;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(CHECKPOINT_SUFFIX) else {
                continue;
            };
            if let Ok(seq) = stem.parse::<i64>() {
                max_seq = max_seq.max(seq);
            }
        }
        Ok(max_seq)
    }

    fn list_checkpoints(&self, job_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let dir = self.checkpoint_dir(job_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.ends_with(CHECKPOINT_SUFFIX) {
                continue;
            }
            let text = std::fs::read_to_string(entry.path())?;
            out.push(serde_json::from_str::<Checkpoint>(&text)?);
        }
        out.sort_by_key(|checkpoint| checkpoint.checkpoint_seq);
        Ok(out)
    }

    fn acquire_task_lock(&mut self, candidate: &TaskLock) -> Result<LockOutcome, StoreError> {
        let _guard = self.lock_lease_mutex()?;
        let mut locks: BTreeMap<String, TaskLock> = load_json(&self.locks_path())?;
        if let Some(existing) = locks.get(&candidate.task_id)
            && !existing.is_expired_at(candidate.acquired_at_ms)
        {
            return Ok(LockOutcome::AlreadyLocked {
                task_run_id: existing.task_run_id.clone(),
                expires_at_ms: existing.expires_at_ms,
            });
        }
        locks.insert(candidate.task_id.clone(), candidate.clone());
        write_json_atomic(&self.locks_path(), &locks)?;
        Ok(LockOutcome::Acquired(candidate.clone()))
    }

    fn get_task_lock(&self, task_id: &str) -> Result<Option<TaskLock>, StoreError> {
        let mut locks: BTreeMap<String, TaskLock> = load_json(&self.locks_path())?;
        Ok(locks.remove(task_id))
    }

    fn release_task_lock(&mut self, task_id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock_lease_mutex()?;
        let mut locks: BTreeMap<String, TaskLock> = load_json(&self.locks_path())?;
        let removed = locks.remove(task_id).is_some();
        if removed {
            write_json_atomic(&self.locks_path(), &locks)?;
        }
        Ok(removed)
    }

    fn release_task_locks_by_job(&mut self, job_id: &str) -> Result<usize, StoreError> {
        let _guard = self.lock_lease_mutex()?;
        let mut locks: BTreeMap<String, TaskLock> = load_json(&self.locks_path())?;
        let before = locks.len();
        locks.retain(|_, lock| lock.job_id != job_id);
        let removed = before - locks.len();
        if removed > 0 {
            write_json_atomic(&self.locks_path(), &locks)?;
        }
        Ok(removed)
    }

    fn append_token_usage(&mut self, record: &TokenUsageRecord) -> Result<(), StoreError> {
        let mut ledger: Vec<TokenUsageRecord> = load_json(&self.usage_path())?;
        ledger.push(record.clone());
        write_json_atomic(&self.usage_path(), &ledger)
    }

    fn list_token_usage(&self) -> Result<Vec<TokenUsageRecord>, StoreError> {
        load_json(&self.usage_path())
    }
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(err.into()),
    };
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&text)?)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or(StoreError::InvalidInput("invalid store path"))?;
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    std::fs::write(&tmp, text)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
