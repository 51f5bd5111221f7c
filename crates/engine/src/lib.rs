#![forbid(unsafe_code)]

mod checkpoint;
mod engine;
mod lease;
mod lifecycle;
mod requests;
mod runtime;
mod telemetry;

pub use engine::{Engine, EngineOptions};
pub use requests::{
    CheckpointWrite, CommandRunStart, JobFilter, JobStart, JobStatusUpdate, TokenUsageEntry,
};
pub use runtime::{NO_SIGNAL_HANDLERS_ENV, exit_code_for, install_signal_handlers};
pub use telemetry::{
    DO_NOT_TRACK_ENV, NO_TELEMETRY_ENV, TELEMETRY_STRICT_ENV, TelemetryTier, UsageExporter,
};
