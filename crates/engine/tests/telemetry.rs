#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tp_core::ids::WorkspaceId;
use tp_core::model::TokenUsageRecord;
use tp_engine::{Engine, EngineOptions, TelemetryTier, TokenUsageEntry, UsageExporter};
use tp_store::{MirrorMode, Store, StoreOptions};

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("tp_engine_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

struct CountingExporter {
    exported: Arc<AtomicUsize>,
    fail: bool,
}

impl UsageExporter for CountingExporter {
    fn export(
        &self,
        _record: &TokenUsageRecord,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.exported.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err("export endpoint unreachable".into());
        }
        Ok(())
    }
}

fn engine_with(
    test_name: &str,
    tier: TelemetryTier,
    exporter: Option<Box<dyn UsageExporter>>,
) -> (Engine, PathBuf) {
    let dir = temp_dir(test_name);
    let store = Store::open(
        &dir,
        StoreOptions {
            mirror: MirrorMode::Auto,
        },
    )
    .expect("open store");
    let workspace = WorkspaceId::try_new("test-ws").expect("workspace id");
    let engine = Engine::new(
        store,
        workspace,
        EngineOptions {
            telemetry: Some(tier),
            exporter,
        },
    );
    (engine, dir)
}

fn entry() -> TokenUsageEntry {
    TokenUsageEntry {
        agent_id: Some("agent-1".to_string()),
        model_name: Some("gpt-qa".to_string()),
        input_tokens: Some(120),
        output_tokens: Some(30),
        ..TokenUsageEntry::default()
    }
}

#[test]
fn strict_tier_never_records() {
    let (engine, dir) = engine_with("strict_drops", TelemetryTier::Strict, None);
    assert!(!engine.record_token_usage(entry()));
    assert!(!dir.join("token_usage.json").exists());
}

#[test]
fn local_only_records_without_export() {
    let exported = Arc::new(AtomicUsize::new(0));
    let exporter = CountingExporter {
        exported: exported.clone(),
        fail: false,
    };
    let (engine, dir) = engine_with(
        "local_only",
        TelemetryTier::LocalOnly,
        Some(Box::new(exporter)),
    );

    assert!(engine.record_token_usage(entry()));
    assert_eq!(exported.load(Ordering::SeqCst), 0);

    let text = std::fs::read_to_string(dir.join("token_usage.json")).expect("ledger exists");
    let ledger: Vec<TokenUsageRecord> = serde_json::from_str(&text).expect("ledger parses");
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].workspace_id, "test-ws");
}

#[test]
fn normal_tier_records_and_forwards() {
    let exported = Arc::new(AtomicUsize::new(0));
    let exporter = CountingExporter {
        exported: exported.clone(),
        fail: false,
    };
    let (engine, _dir) = engine_with(
        "normal_forwards",
        TelemetryTier::Normal,
        Some(Box::new(exporter)),
    );

    assert!(engine.record_token_usage(entry()));
    assert!(engine.record_token_usage(entry()));
    assert_eq!(exported.load(Ordering::SeqCst), 2);
}

#[test]
fn exporter_failure_never_reaches_the_caller() {
    let exported = Arc::new(AtomicUsize::new(0));
    let exporter = CountingExporter {
        exported: exported.clone(),
        fail: true,
    };
    let (engine, dir) = engine_with(
        "exporter_failure",
        TelemetryTier::Normal,
        Some(Box::new(exporter)),
    );

    // The local append still counts as recorded.
    assert!(engine.record_token_usage(entry()));
    assert_eq!(exported.load(Ordering::SeqCst), 1);
    assert!(dir.join("token_usage.json").exists());
}

#[test]
fn total_tokens_are_derived_when_missing() {
    let (engine, dir) = engine_with("totals_derived", TelemetryTier::Normal, None);
    assert!(engine.record_token_usage(entry()));

    let text = std::fs::read_to_string(dir.join("token_usage.json")).expect("ledger exists");
    let ledger: Vec<TokenUsageRecord> = serde_json::from_str(&text).expect("ledger parses");
    assert_eq!(ledger[0].total_tokens, Some(150));
    // Absent attribution fields persist as explicit nulls.
    assert!(text.contains("\"job_id\": null"));
}
