#![forbid(unsafe_code)]

use crate::engine::{ActiveJob, Engine};
use crate::requests::JobStatusUpdate;
use std::sync::atomic::{AtomicBool, Ordering};
use tp_core::model::{JobState, RunStatus};

/// Set to `1` to skip OS signal-handler installation entirely, for embedding
/// contexts that manage their own shutdown.
pub const NO_SIGNAL_HANDLERS_ENV: &str = "TASKPILOT_NO_SIGNAL_HANDLERS";

static SIGNAL_HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

pub fn exit_code_for(signal: &str) -> i32 {
    match signal {
        "SIGINT" => 130,
        "SIGTERM" => 143,
        _ => 1,
    }
}

impl Engine {
    pub(crate) fn register_active_job(&self, job_id: &str, command_run_id: Option<String>) {
        self.lock_active()
            .insert(job_id.to_string(), ActiveJob { command_run_id });
    }

    pub(crate) fn unregister_active_job(&self, job_id: &str) {
        self.lock_active().remove(job_id);
    }

    pub fn active_job_ids(&self) -> Vec<String> {
        self.lock_active().keys().cloned().collect()
    }

    /// Graceful shutdown of this process's own active jobs. Re-entrant calls
    /// are ignored. Every sub-step is best-effort so one failure never blocks
    /// cancelling the remaining jobs: locks are released, the Job goes to
    /// `cancelled` with reason `"Cancelled by <signal>"`, and its CommandRun
    /// (if any) follows with the same reason. Returns the conventional exit
    /// code for the signal.
    pub fn shutdown(&self, signal: &str) -> i32 {
        let code = exit_code_for(signal);
        if self.inner.handling_signal.swap(true, Ordering::SeqCst) {
            return code;
        }
        let active: Vec<(String, ActiveJob)> = {
            let mut registry = self.lock_active();
            std::mem::take(&mut *registry).into_iter().collect()
        };
        let reason = format!("Cancelled by {signal}");
        for (job_id, entry) in active {
            if let Err(err) = self.release_task_locks_by_job(&job_id) {
                eprintln!("taskpilot: releasing locks for {job_id} during shutdown failed ({err})");
            }
            let update = JobStatusUpdate {
                error_summary: Some(reason.clone()),
                ..JobStatusUpdate::default()
            };
            if let Err(err) = self.update_job_status(&job_id, JobState::Cancelled, update) {
                eprintln!("taskpilot: cancelling job {job_id} during shutdown failed ({err})");
            }
            if let Some(run_id) = entry.command_run_id
                && let Err(err) = self.finish_command_run(
                    &run_id,
                    RunStatus::Cancelled,
                    Some(reason.clone()),
                    None,
                )
            {
                eprintln!("taskpilot: cancelling run {run_id} during shutdown failed ({err})");
            }
        }
        code
    }
}

/// Wires SIGINT/SIGTERM/SIGTSTP to [`Engine::shutdown`], once per process.
/// Returns whether handlers were installed in this call.
pub fn install_signal_handlers(engine: &Engine) -> bool {
    if std::env::var(NO_SIGNAL_HANDLERS_ENV).is_ok_and(|value| value == "1") {
        return false;
    }
    if SIGNAL_HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }
    install_os_hooks(engine)
}

#[cfg(unix)]
fn install_os_hooks(engine: &Engine) -> bool {
    use nix::sys::signal::{SigSet, Signal};

    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGTSTP);
    // Block the set on the installing (main) thread; threads spawned later
    // inherit the mask, so only the dedicated thread below sees the signals.
    if let Err(err) = set.thread_block() {
        eprintln!("taskpilot: could not block termination signals ({err})");
        return false;
    }
    let engine = engine.clone();
    let spawned = std::thread::Builder::new()
        .name("taskpilot-signal".to_string())
        .spawn(move || {
            loop {
                match set.wait() {
                    Ok(signal) => {
                        let code = engine.shutdown(signal.as_str());
                        std::process::exit(code);
                    }
                    Err(_) => continue,
                }
            }
        });
    spawned.is_ok()
}

#[cfg(not(unix))]
fn install_os_hooks(_engine: &Engine) -> bool {
    false
}
