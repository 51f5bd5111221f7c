#![forbid(unsafe_code)]

use crate::StoreError;
use tp_core::model::{Checkpoint, CommandRun, Job, TaskLock, TokenUsageRecord};

/// Outcome of a lease acquisition attempt. `AlreadyLocked` is an expected
/// branch callers handle, not a failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(TaskLock),
    AlreadyLocked {
        task_run_id: String,
        expires_at_ms: i64,
    },
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// One storage binding. The file binding is always available and acts as the
/// primary; the relational binding is an optional mirror (see `Store`).
pub trait StoreBackend {
    fn put_job(&mut self, job: &Job) -> Result<(), StoreError>;
    fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;
    fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    fn put_command_run(&mut self, run: &CommandRun) -> Result<(), StoreError>;
    fn get_command_run(&self, run_id: &str) -> Result<Option<CommandRun>, StoreError>;
    fn list_command_runs(&self) -> Result<Vec<CommandRun>, StoreError>;

    fn append_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
    fn max_checkpoint_seq(&self, job_id: &str) -> Result<i64, StoreError>;
    fn list_checkpoints(&self, job_id: &str) -> Result<Vec<Checkpoint>, StoreError>;

    /// Inserts `candidate` keyed by task id. A live existing row wins; an
    /// expired one (relative to `candidate.acquired_at_ms`) is replaced.
    fn acquire_task_lock(&mut self, candidate: &TaskLock) -> Result<LockOutcome, StoreError>;
    fn get_task_lock(&self, task_id: &str) -> Result<Option<TaskLock>, StoreError>;
    /// Idempotent; returns whether a row was actually removed.
    fn release_task_lock(&mut self, task_id: &str) -> Result<bool, StoreError>;
    fn release_task_locks_by_job(&mut self, job_id: &str) -> Result<usize, StoreError>;

    fn append_token_usage(&mut self, record: &TokenUsageRecord) -> Result<(), StoreError>;
    fn list_token_usage(&self) -> Result<Vec<TokenUsageRecord>, StoreError>;
}
