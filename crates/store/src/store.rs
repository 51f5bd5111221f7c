#![forbid(unsafe_code)]

use crate::backend::{LockOutcome, StoreBackend};
use crate::error::StoreError;
use crate::file::FileStore;
use crate::sqlite::SqliteStore;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tp_core::model::{Checkpoint, CommandRun, Job, TaskLock, TokenUsageRecord};

/// How the relational mirror is wired at open time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorMode {
    /// Open the mirror if possible; fall back to file-only with a warning.
    Auto,
    /// File-only, no mirror.
    Disabled,
    /// "Require durable store": fail fast if the mirror cannot open.
    Required,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    /// File binding plus relational mirror.
    Full,
    /// File binding only.
    Degraded,
}

#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    pub mirror: MirrorMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            mirror: MirrorMode::Auto,
        }
    }
}

static MIRROR_WRITE_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_mirror_write_failed(err: &StoreError) {
    if !MIRROR_WRITE_WARNED.swap(true, Ordering::Relaxed) {
        eprintln!(
            "taskpilot: relational mirror write failed ({err}); \
             the file store remains authoritative"
        );
    }
}

/// Dual-binding durable store.
///
/// The file binding is the primary record: its errors propagate. Mirror
/// writes are best-effort and may drift behind the primary under mirror
/// failures (eventual, not atomic, by contract). Task locks are routed to
/// exactly one binding so lease arbitration has a single authority: the
/// mirror when `Full`, the file binding when `Degraded`.
#[derive(Debug)]
pub struct Store {
    file: FileStore,
    mirror: Option<SqliteStore>,
    mode: StoreMode,
}

impl Store {
    pub fn open(root: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let root = root.as_ref();
        let file = FileStore::open(root)?;
        let (mirror, mode) = match options.mirror {
            MirrorMode::Disabled => (None, StoreMode::Degraded),
            MirrorMode::Auto => match SqliteStore::open(root) {
                Ok(mirror) => (Some(mirror), StoreMode::Full),
                Err(err) => {
                    eprintln!(
                        "taskpilot: relational mirror unavailable ({err}); \
                         continuing file-only"
                    );
                    (None, StoreMode::Degraded)
                }
            },
            MirrorMode::Required => {
                let mirror = SqliteStore::open(root).map_err(|err| {
                    StoreError::DurableStoreUnavailable {
                        detail: err.to_string(),
                    }
                })?;
                (Some(mirror), StoreMode::Full)
            }
        };
        Ok(Self { file, mirror, mode })
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn root(&self) -> &Path {
        self.file.root()
    }

    fn mirror_write(
        &mut self,
        write: impl FnOnce(&mut SqliteStore) -> Result<(), StoreError>,
    ) {
        if let Some(mirror) = self.mirror.as_mut()
            && let Err(err) = write(mirror)
        {
            warn_mirror_write_failed(&err);
        }
    }

    fn lock_backend(&mut self) -> &mut dyn StoreBackend {
        match self.mirror.as_mut() {
            Some(mirror) => mirror,
            None => &mut self.file,
        }
    }

    pub fn put_job(&mut self, job: &Job) -> Result<(), StoreError> {
        self.file.put_job(job)?;
        self.mirror_write(|mirror| mirror.put_job(job));
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        self.file.get_job(job_id)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.file.list_jobs()
    }

    pub fn put_command_run(&mut self, run: &CommandRun) -> Result<(), StoreError> {
        self.file.put_command_run(run)?;
        self.mirror_write(|mirror| mirror.put_command_run(run));
        Ok(())
    }

    pub fn get_command_run(&self, run_id: &str) -> Result<Option<CommandRun>, StoreError> {
        self.file.get_command_run(run_id)
    }

    pub fn list_command_runs(&self) -> Result<Vec<CommandRun>, StoreError> {
        self.file.list_command_runs()
    }

    pub fn append_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.file.append_checkpoint(checkpoint)?;
        self.mirror_write(|mirror| mirror.append_checkpoint(checkpoint));
        Ok(())
    }

    pub fn max_checkpoint_seq(&self, job_id: &str) -> Result<i64, StoreError> {
        self.file.max_checkpoint_seq(job_id)
    }

    pub fn list_checkpoints(&self, job_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        self.file.list_checkpoints(job_id)
    }

    pub fn acquire_task_lock(&mut self, candidate: &TaskLock) -> Result<LockOutcome, StoreError> {
        self.lock_backend().acquire_task_lock(candidate)
    }

    pub fn get_task_lock(&self, task_id: &str) -> Result<Option<TaskLock>, StoreError> {
        match self.mirror.as_ref() {
            Some(mirror) => mirror.get_task_lock(task_id),
            None => self.file.get_task_lock(task_id),
        }
    }

    pub fn release_task_lock(&mut self, task_id: &str) -> Result<bool, StoreError> {
        self.lock_backend().release_task_lock(task_id)
    }

    pub fn release_task_locks_by_job(&mut self, job_id: &str) -> Result<usize, StoreError> {
        self.lock_backend().release_task_locks_by_job(job_id)
    }

    pub fn append_token_usage(&mut self, record: &TokenUsageRecord) -> Result<(), StoreError> {
        self.file.append_token_usage(record)?;
        self.mirror_write(|mirror| mirror.append_token_usage(record));
        Ok(())
    }

    pub fn list_token_usage(&self) -> Result<Vec<TokenUsageRecord>, StoreError> {
        self.file.list_token_usage()
    }

    pub fn write_manifest(&self, job: &Job) -> Result<(), StoreError> {
        self.file.write_manifest(job)
    }

    pub fn append_log(&self, job_id: &str, line: &str) -> Result<(), StoreError> {
        self.file.append_log(job_id, line)
    }

    pub fn read_log(&self, job_id: &str) -> Result<String, StoreError> {
        self.file.read_log(job_id)
    }
}
