#![forbid(unsafe_code)]

use crate::engine::Engine;
use crate::requests::{CommandRunStart, JobFilter, JobStart, JobStatusUpdate};
use tp_core::ids::new_id;
use tp_core::model::{CommandRun, Job, JobState, RunStatus};
use tp_core::time::now_ms_i64;
use tp_store::{Store, StoreError};

impl Engine {
    /// Creates a CommandRun in state `running`. No side effects beyond
    /// persistence.
    pub fn start_command_run(&self, request: CommandRunStart) -> Result<CommandRun, StoreError> {
        let now = now_ms_i64();
        let run = CommandRun {
            id: new_id("run"),
            command_name: request.command_name,
            workspace_id: self.workspace_id().as_str().to_string(),
            project_key: request.project_key,
            job_id: request.job_id,
            task_ids: request.task_ids,
            git_branch: request.git_branch,
            git_base_branch: request.git_base_branch,
            started_at_ms: now,
            completed_at_ms: None,
            status: RunStatus::Running,
            error_summary: None,
            duration_seconds: None,
            sp_processed: None,
        };
        self.lock_store().put_command_run(&run)?;
        Ok(run)
    }

    /// Terminal transition for a run. An unknown run id is a no-op: another
    /// process may have raced the run to completion, which is normal. A run
    /// that is already terminal is left untouched.
    pub fn finish_command_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error_summary: Option<String>,
        sp_processed: Option<i64>,
    ) -> Result<Option<CommandRun>, StoreError> {
        let mut store = self.lock_store();
        let Some(mut run) = store.get_command_run(run_id)? else {
            return Ok(None);
        };
        if run.status.is_terminal() {
            return Ok(Some(run));
        }
        let now = now_ms_i64();
        run.status = status;
        if let Some(error_summary) = error_summary {
            run.error_summary = Some(error_summary);
        }
        if let Some(sp_processed) = sp_processed {
            run.sp_processed = Some(sp_processed);
        }
        if status.is_terminal() {
            run.completed_at_ms = Some(now);
            run.duration_seconds = Some(duration_seconds(run.started_at_ms, now));
        }
        store.put_command_run(&run)?;
        Ok(Some(run))
    }

    /// Creates a Job in state `running`, back-links it to the owning
    /// CommandRun on both sides, writes the manifest snapshot and registers
    /// the job as active in the cancellation registry.
    pub fn start_job(&self, request: JobStart) -> Result<Job, StoreError> {
        let now = now_ms_i64();
        let mut store = self.lock_store();
        let run = match request.command_run_id.as_deref() {
            Some(run_id) => store.get_command_run(run_id)?,
            None => None,
        };
        let command_name = request
            .command_name
            .or_else(|| run.as_ref().map(|run| run.command_name.clone()))
            .unwrap_or_else(|| request.job_type.clone());
        let mut agent_ids = request.agent_ids;
        if let Some(agent_id) = request.agent_id
            && !agent_ids.contains(&agent_id)
        {
            agent_ids.push(agent_id);
        }
        let job = Job {
            id: new_id("job"),
            job_type: request.job_type,
            state: JobState::Running,
            command_run_id: request.command_run_id,
            command_name,
            workspace_id: self.workspace_id().as_str().to_string(),
            project_key: request.project_key,
            payload: request.payload,
            total_items: request.total_items,
            processed_items: request.processed_items,
            last_checkpoint: None,
            agent_ids,
            created_at_ms: now,
            updated_at_ms: now,
            completed_at_ms: None,
            error_summary: None,
            duration_seconds: None,
        };
        store.put_job(&job)?;
        if let Some(mut run) = run {
            run.job_id = Some(job.id.clone());
            store.put_command_run(&run)?;
        }
        self.snapshot_manifest(&store, &job);
        self.append_transition_log(
            &store,
            &job.id,
            &format!("job {} started (type={})", job.id, job.job_type),
        );
        drop(store);
        self.register_active_job(&job.id, job.command_run_id.clone());
        Ok(job)
    }

    /// Applies a state transition plus a partial metadata update. Payload is
    /// shallow-merged; completion time and duration are computed on the first
    /// terminal transition and frozen thereafter. Cancelling releases the
    /// job's task locks best-effort. An unknown job id is a no-op.
    pub fn update_job_status(
        &self,
        job_id: &str,
        state: JobState,
        update: JobStatusUpdate,
    ) -> Result<Option<Job>, StoreError> {
        let mut store = self.lock_store();
        let Some(mut job) = store.get_job(job_id)? else {
            return Ok(None);
        };
        let now = now_ms_i64();
        if let Some(payload) = update.payload {
            for (key, value) in payload {
                job.payload.insert(key, value);
            }
        }
        if let Some(total_items) = update.total_items {
            job.total_items = Some(total_items);
        }
        if let Some(processed_items) = update.processed_items {
            job.processed_items = Some(processed_items);
        }
        if let Some(last_checkpoint) = update.last_checkpoint {
            job.last_checkpoint = Some(last_checkpoint);
        }
        if let Some(error_summary) = update.error_summary {
            job.error_summary = Some(error_summary);
        }
        let previous_state = job.state;
        job.state = state;
        job.updated_at_ms = now;
        if state.is_terminal() && job.completed_at_ms.is_none() {
            job.completed_at_ms = Some(now);
            job.duration_seconds = Some(duration_seconds(job.created_at_ms, now));
        }
        store.put_job(&job)?;
        self.snapshot_manifest(&store, &job);
        self.append_transition_log(
            &store,
            &job.id,
            &format!("job {} state {previous_state} -> {state}", job.id),
        );
        if state == JobState::Cancelled
            && let Err(err) = store.release_task_locks_by_job(job_id)
        {
            eprintln!("taskpilot: releasing task locks for {job_id} failed ({err})");
        }
        drop(store);
        if state == JobState::Running {
            self.register_active_job(job_id, job.command_run_id.clone());
        } else if state.is_terminal() {
            self.unregister_active_job(job_id);
        }
        Ok(Some(job))
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        self.lock_store().get_job(job_id)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.lock_store().list_jobs()?;
        Ok(jobs.into_iter().filter(|job| filter.matches(job)).collect())
    }

    pub fn get_command_run(&self, run_id: &str) -> Result<Option<CommandRun>, StoreError> {
        self.lock_store().get_command_run(run_id)
    }

    pub fn list_command_runs(&self) -> Result<Vec<CommandRun>, StoreError> {
        self.lock_store().list_command_runs()
    }

    pub fn append_job_log(&self, job_id: &str, line: &str) -> Result<(), StoreError> {
        self.lock_store().append_log(job_id, line)
    }

    /// Returns the job's stream log verbatim; absent logs read as empty.
    pub fn read_job_log(&self, job_id: &str) -> Result<String, StoreError> {
        self.lock_store().read_log(job_id)
    }

    /// Manifest writes are best-effort: the primary record already holds the
    /// transition, so a snapshot failure must not fail the caller.
    pub(crate) fn snapshot_manifest(&self, store: &Store, job: &Job) {
        if let Err(err) = store.write_manifest(job) {
            eprintln!("taskpilot: manifest write failed for {} ({err})", job.id);
        }
    }

    pub(crate) fn append_transition_log(&self, store: &Store, job_id: &str, line: &str) {
        if let Err(err) = store.append_log(job_id, line) {
            eprintln!("taskpilot: stream log append failed for {job_id} ({err})");
        }
    }
}

fn duration_seconds(started_at_ms: i64, ended_at_ms: i64) -> f64 {
    (ended_at_ms.saturating_sub(started_at_ms)).max(0) as f64 / 1000.0
}
