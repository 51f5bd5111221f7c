#![forbid(unsafe_code)]

use crate::engine::Engine;
use std::time::Duration;
use tp_core::model::TaskLock;
use tp_core::time::now_ms_i64;
use tp_store::{LockOutcome, StoreError};

impl Engine {
    /// Attempts to take the lease on a task. A live holder wins
    /// (`LockOutcome::AlreadyLocked`); an expired row is reclaimed
    /// transparently and the acquisition succeeds.
    pub fn acquire_task_lock(
        &self,
        task_id: &str,
        task_run_id: &str,
        job_id: &str,
        lease: Duration,
    ) -> Result<LockOutcome, StoreError> {
        let now = now_ms_i64();
        let lease_ms = lease.as_millis().min(i64::MAX as u128) as i64;
        let candidate = TaskLock {
            task_id: task_id.to_string(),
            task_run_id: task_run_id.to_string(),
            job_id: job_id.to_string(),
            acquired_at_ms: now,
            expires_at_ms: now.saturating_add(lease_ms),
        };
        self.lock_store().acquire_task_lock(&candidate)
    }

    /// Idempotent: releasing an unheld lock is not an error.
    pub fn release_task_lock(&self, task_id: &str) -> Result<bool, StoreError> {
        self.lock_store().release_task_lock(task_id)
    }

    /// Bulk release, used during cancellation and normal completion so leases
    /// never outlive the job. Callers on best-effort paths swallow the error.
    pub fn release_task_locks_by_job(&self, job_id: &str) -> Result<usize, StoreError> {
        self.lock_store().release_task_locks_by_job(job_id)
    }

    pub fn get_task_lock(&self, task_id: &str) -> Result<Option<TaskLock>, StoreError> {
        self.lock_store().get_task_lock(task_id)
    }
}
