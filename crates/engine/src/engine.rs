#![forbid(unsafe_code)]

use crate::telemetry::{TelemetryState, TelemetryTier, UsageExporter};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use tp_core::ids::WorkspaceId;
use tp_store::{Store, StoreMode};

/// Orchestration façade: job/command-run lifecycle, checkpoints, task
/// leases, the process-local cancellation registry and the telemetry ledger.
///
/// Cheaply cloneable; the signal thread holds a clone and drives
/// [`Engine::shutdown`] on termination signals.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) store: Mutex<Store>,
    pub(crate) workspace_id: WorkspaceId,
    /// Process-local registry of currently active jobs.
    pub(crate) active: Mutex<BTreeMap<String, ActiveJob>>,
    /// Per-job next-sequence cache; repopulated from persisted checkpoints
    /// after a restart.
    pub(crate) seq_cache: Mutex<HashMap<String, i64>>,
    pub(crate) handling_signal: AtomicBool,
    pub(crate) telemetry: TelemetryState,
}

#[derive(Clone, Debug)]
pub(crate) struct ActiveJob {
    pub(crate) command_run_id: Option<String>,
}

#[derive(Default)]
pub struct EngineOptions {
    /// Explicit tier; `None` resolves from the environment once at startup.
    pub telemetry: Option<TelemetryTier>,
    pub exporter: Option<Box<dyn UsageExporter>>,
}

impl Engine {
    pub fn new(store: Store, workspace_id: WorkspaceId, options: EngineOptions) -> Self {
        let tier = options
            .telemetry
            .unwrap_or_else(TelemetryTier::resolve_from_env);
        Self {
            inner: Arc::new(EngineInner {
                store: Mutex::new(store),
                workspace_id,
                active: Mutex::new(BTreeMap::new()),
                seq_cache: Mutex::new(HashMap::new()),
                handling_signal: AtomicBool::new(false),
                telemetry: TelemetryState::new(tier, options.exporter),
            }),
        }
    }

    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.inner.workspace_id
    }

    pub fn store_mode(&self) -> StoreMode {
        self.lock_store().mode()
    }

    pub(crate) fn lock_store(&self) -> MutexGuard<'_, Store> {
        self.inner
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn lock_active(&self) -> MutexGuard<'_, BTreeMap<String, ActiveJob>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn lock_seq_cache(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.inner
            .seq_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
