#![forbid(unsafe_code)]

use serde_json::{Map as JsonMap, Value as JsonValue};
use tp_core::model::JobState;

#[derive(Clone, Debug, Default)]
pub struct CommandRunStart {
    pub command_name: String,
    pub project_key: Option<String>,
    pub git_branch: Option<String>,
    pub git_base_branch: Option<String>,
    pub task_ids: Vec<String>,
    /// Pre-existing job to attribute the run to, if any.
    pub job_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct JobStart {
    pub job_type: String,
    pub command_run_id: Option<String>,
    pub project_key: Option<String>,
    /// Defaults to the owning run's command name, else the job type.
    pub command_name: Option<String>,
    pub payload: JsonMap<String, JsonValue>,
    pub total_items: Option<i64>,
    pub processed_items: Option<i64>,
    pub agent_id: Option<String>,
    pub agent_ids: Vec<String>,
}

/// Partial update applied by `update_job_status`. `payload` is merged key by
/// key into the job's existing payload, never swapped wholesale.
#[derive(Clone, Debug, Default)]
pub struct JobStatusUpdate {
    pub payload: Option<JsonMap<String, JsonValue>>,
    pub total_items: Option<i64>,
    pub processed_items: Option<i64>,
    pub last_checkpoint: Option<String>,
    pub error_summary: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CheckpointWrite {
    pub stage: String,
    /// Caller-supplied event time; defaults to now.
    pub timestamp_ms: Option<i64>,
    pub details: Option<JsonMap<String, JsonValue>>,
}

#[derive(Clone, Debug, Default)]
pub struct TokenUsageEntry {
    pub agent_id: Option<String>,
    pub model_name: Option<String>,
    pub job_id: Option<String>,
    pub command_run_id: Option<String>,
    pub task_run_id: Option<String>,
    pub task_id: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<i64>,
    pub metadata: JsonMap<String, JsonValue>,
}

#[derive(Clone, Debug, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub job_type: Option<String>,
    pub command_run_id: Option<String>,
}

impl JobFilter {
    pub(crate) fn matches(&self, job: &tp_core::model::Job) -> bool {
        if let Some(state) = self.state
            && job.state != state
        {
            return false;
        }
        if let Some(job_type) = self.job_type.as_deref()
            && job.job_type != job_type
        {
            return false;
        }
        if let Some(run_id) = self.command_run_id.as_deref()
            && job.command_run_id.as_deref() != Some(run_id)
        {
            return false;
        }
        true
    }
}
