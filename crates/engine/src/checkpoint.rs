#![forbid(unsafe_code)]

use crate::engine::Engine;
use crate::requests::CheckpointWrite;
use serde_json::Value as JsonValue;
use tp_core::ids::new_id;
use tp_core::model::{CHECKPOINT_SCHEMA_VERSION, Checkpoint, CheckpointProgress};
use tp_core::time::now_ms_i64;
use tp_store::StoreError;

impl Engine {
    /// Appends the next checkpoint for a job and records its stage on the
    /// job. Sequence numbers are strictly increasing by 1 per job with no
    /// gaps, across process restarts: the in-memory counter is only a cache,
    /// the persisted checkpoints are the source of truth. An unknown job id
    /// is a no-op.
    pub fn write_checkpoint(
        &self,
        job_id: &str,
        request: CheckpointWrite,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let mut store = self.lock_store();
        let Some(mut job) = store.get_job(job_id)? else {
            return Ok(None);
        };
        let now = now_ms_i64();
        let mut seq_cache = self.lock_seq_cache();
        let checkpoint_seq = match seq_cache.get(job_id) {
            Some(previous) => previous + 1,
            None => store.max_checkpoint_seq(job_id)? + 1,
        };
        let details = request.details.unwrap_or_default();
        let reason = details
            .get("reason")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        // Live job counters win; details-supplied totals only fill in while
        // the job record has none yet.
        let progress = CheckpointProgress {
            total: job
                .total_items
                .or_else(|| details.get("total").and_then(JsonValue::as_i64)),
            completed: job
                .processed_items
                .or_else(|| details.get("completed").and_then(JsonValue::as_i64)),
        };
        let checkpoint = Checkpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            job_id: job.id.clone(),
            checkpoint_seq,
            checkpoint_id: new_id("ckpt"),
            created_at_ms: now,
            status: job.state,
            stage: request.stage.clone(),
            timestamp_ms: request.timestamp_ms.unwrap_or(now),
            reason,
            progress,
            details,
        };
        store.append_checkpoint(&checkpoint)?;
        seq_cache.insert(job_id.to_string(), checkpoint_seq);
        drop(seq_cache);
        job.last_checkpoint = Some(request.stage);
        job.updated_at_ms = now;
        store.put_job(&job)?;
        self.snapshot_manifest(&store, &job);
        self.append_transition_log(
            &store,
            job_id,
            &format!("checkpoint #{checkpoint_seq} stage={}", checkpoint.stage),
        );
        Ok(Some(checkpoint))
    }

    pub fn list_checkpoints(&self, job_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        self.lock_store().list_checkpoints(job_id)
    }
}
