#![forbid(unsafe_code)]

use crate::engine::Engine;
use crate::requests::TokenUsageEntry;
use std::sync::atomic::{AtomicBool, Ordering};
use tp_core::model::TokenUsageRecord;
use tp_core::time::now_ms_i64;

pub const TELEMETRY_STRICT_ENV: &str = "TASKPILOT_TELEMETRY_STRICT";
pub const NO_TELEMETRY_ENV: &str = "TASKPILOT_NO_TELEMETRY";
pub const DO_NOT_TRACK_ENV: &str = "DO_NOT_TRACK";

/// Three-tier recording policy, resolved once per process and cached on the
/// engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TelemetryTier {
    /// Record locally and forward to the exporter.
    Normal,
    /// Record locally only; remote export is skipped.
    LocalOnly,
    /// Never record, locally or remotely.
    Strict,
}

impl TelemetryTier {
    pub fn resolve_from_env() -> Self {
        if env_flag(TELEMETRY_STRICT_ENV) {
            return Self::Strict;
        }
        if env_flag(NO_TELEMETRY_ENV) || env_flag(DO_NOT_TRACK_ENV) {
            return Self::LocalOnly;
        }
        Self::Normal
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| value == "1" || value == "true")
}

/// Remote forwarding seam. The engine only hands records over; transport is
/// an external collaborator.
pub trait UsageExporter: Send + Sync {
    fn export(
        &self,
        record: &TokenUsageRecord,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

pub(crate) struct TelemetryState {
    tier: TelemetryTier,
    exporter: Option<Box<dyn UsageExporter>>,
    warned_strict: AtomicBool,
    warned_local: AtomicBool,
    warned_write: AtomicBool,
}

impl TelemetryState {
    pub(crate) fn new(tier: TelemetryTier, exporter: Option<Box<dyn UsageExporter>>) -> Self {
        Self {
            tier,
            exporter,
            warned_strict: AtomicBool::new(false),
            warned_local: AtomicBool::new(false),
            warned_write: AtomicBool::new(false),
        }
    }

    fn warn_once(flag: &AtomicBool, message: &str) {
        if !flag.swap(true, Ordering::Relaxed) {
            eprintln!("taskpilot: {message}");
        }
    }
}

impl Engine {
    pub fn telemetry_tier(&self) -> TelemetryTier {
        self.inner.telemetry.tier
    }

    /// Appends a usage record to the ledger under the active policy tier.
    /// Never blocks or fails the caller: store and exporter failures are
    /// swallowed. Returns whether the record was persisted locally.
    pub fn record_token_usage(&self, entry: TokenUsageEntry) -> bool {
        let telemetry = &self.inner.telemetry;
        match telemetry.tier {
            TelemetryTier::Strict => {
                TelemetryState::warn_once(
                    &telemetry.warned_strict,
                    "telemetry is in strict mode; usage records are dropped",
                );
                false
            }
            TelemetryTier::LocalOnly | TelemetryTier::Normal => {
                let record = self.normalize_usage(entry);
                let stored = {
                    let mut store = self.lock_store();
                    match store.append_token_usage(&record) {
                        Ok(()) => true,
                        Err(err) => {
                            TelemetryState::warn_once(
                                &telemetry.warned_write,
                                &format!("token usage write failed ({err}); records may be lost"),
                            );
                            false
                        }
                    }
                };
                if telemetry.tier == TelemetryTier::LocalOnly {
                    TelemetryState::warn_once(
                        &telemetry.warned_local,
                        "telemetry opt-out active; usage is recorded locally only",
                    );
                } else if let Some(exporter) = telemetry.exporter.as_deref()
                    && let Err(err) = exporter.export(&record)
                {
                    eprintln!("taskpilot: usage export failed ({err})");
                }
                stored
            }
        }
    }

    fn normalize_usage(&self, entry: TokenUsageEntry) -> TokenUsageRecord {
        TokenUsageRecord {
            workspace_id: self.workspace_id().as_str().to_string(),
            agent_id: entry.agent_id,
            model_name: entry.model_name,
            job_id: entry.job_id,
            command_run_id: entry.command_run_id,
            task_run_id: entry.task_run_id,
            task_id: entry.task_id,
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            total_tokens: entry
                .total_tokens
                .or_else(|| match (entry.input_tokens, entry.output_tokens) {
                    (None, None) => None,
                    (input, output) => Some(input.unwrap_or(0) + output.unwrap_or(0)),
                }),
            cost_usd: entry.cost_usd,
            duration_ms: entry.duration_ms,
            timestamp_ms: now_ms_i64(),
            metadata: entry.metadata,
        }
    }
}
