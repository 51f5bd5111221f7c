#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Job state machine. `partial` is terminal and distinct from `failed`:
/// the job finished, but some selected items were skipped or unresolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Partial,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Partial
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One CLI invocation. Created at command start, mutated only by
/// completion/cancellation, immutable once terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRun {
    pub id: String,
    pub command_name: String,
    pub workspace_id: String,
    #[serde(default)]
    pub project_key: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub git_base_branch: Option<String>,
    pub started_at_ms: i64,
    #[serde(default)]
    pub completed_at_ms: Option<i64>,
    pub status: RunStatus,
    #[serde(default)]
    pub error_summary: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub sp_processed: Option<i64>,
}

/// One orchestrated unit of work, optionally owned by a CommandRun.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub state: JobState,
    #[serde(default)]
    pub command_run_id: Option<String>,
    pub command_name: String,
    pub workspace_id: String,
    #[serde(default)]
    pub project_key: Option<String>,
    /// Opaque key/value map. Merged on update, never replaced wholesale.
    #[serde(default)]
    pub payload: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub total_items: Option<i64>,
    #[serde(default)]
    pub processed_items: Option<i64>,
    /// Stage name of the most recent checkpoint.
    #[serde(default)]
    pub last_checkpoint: Option<String>,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub completed_at_ms: Option<i64>,
    #[serde(default)]
    pub error_summary: Option<String>,
    /// Derived on the first terminal transition, frozen thereafter.
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

pub const CHECKPOINT_SCHEMA_VERSION: i64 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointProgress {
    pub total: Option<i64>,
    pub completed: Option<i64>,
}

/// Append-only, sequenced progress marker on a Job. Never mutated or
/// deleted by the engine; the resume protocol's source of truth.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: i64,
    pub job_id: String,
    /// 1-based, strictly increasing per job, no gaps.
    pub checkpoint_seq: i64,
    pub checkpoint_id: String,
    pub created_at_ms: i64,
    /// Job state at write time.
    pub status: JobState,
    pub stage: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub progress: CheckpointProgress,
    #[serde(default)]
    pub details: JsonMap<String, JsonValue>,
}

/// A lease: a row exists for a task iff some task-run holds exclusive
/// rights to it. An expired row is logically dead and silently reclaimable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLock {
    pub task_id: String,
    pub task_run_id: String,
    pub job_id: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
}

impl TaskLock {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Append-only usage/cost ledger entry. Serialized with explicit nulls;
/// never updated after insert.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub workspace_id: String,
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
    pub timestamp_ms: i64,
    #[serde(default)]
    pub metadata: JsonMap<String, JsonValue>,
}
