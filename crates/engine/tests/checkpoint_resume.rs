#![forbid(unsafe_code)]

use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::path::{Path, PathBuf};
use tp_core::ids::WorkspaceId;
use tp_core::model::JobState;
use tp_engine::{
    CheckpointWrite, Engine, EngineOptions, JobStart, JobStatusUpdate, TelemetryTier,
};
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

fn open_engine(dir: &Path) -> Engine {
    let store = Store::open(
        dir,
        StoreOptions {
            mirror: MirrorMode::Auto,
        },
    )
    .expect("open store");
    let workspace = WorkspaceId::try_new("test-ws").expect("workspace id");
    Engine::new(
        store,
        workspace,
        EngineOptions {
            telemetry: Some(TelemetryTier::Normal),
            exporter: None,
        },
    )
}

fn stage(name: &str) -> CheckpointWrite {
    CheckpointWrite {
        stage: name.to_string(),
        timestamp_ms: None,
        details: None,
    }
}

#[test]
fn sequences_survive_an_engine_restart_without_gaps() {
    let dir = temp_dir("restart_no_gaps");
    let job_id;
    {
        let engine = open_engine(&dir);
        let job = engine
            .start_job(JobStart {
                job_type: "qa".to_string(),
                ..JobStart::default()
            })
            .expect("start job");
        job_id = job.id;
        for name in ["qa:prepare", "qa:run", "qa:collect"] {
            engine
                .write_checkpoint(&job_id, stage(name))
                .expect("write")
                .expect("job exists");
        }
    }

    // New process, empty sequence cache: the next number comes from the
    // persisted checkpoints alone.
    let engine = open_engine(&dir);
    let resumed = engine
        .write_checkpoint(&job_id, stage("qa:report"))
        .expect("write")
        .expect("job exists");
    assert_eq!(resumed.checkpoint_seq, 4);

    let seqs: Vec<i64> = engine
        .list_checkpoints(&job_id)
        .expect("list")
        .iter()
        .map(|c| c.checkpoint_seq)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
}

#[test]
fn checkpoint_records_stage_on_the_job() {
    let dir = temp_dir("last_checkpoint");
    let engine = open_engine(&dir);
    let job = engine
        .start_job(JobStart {
            job_type: "qa".to_string(),
            ..JobStart::default()
        })
        .expect("start job");

    engine
        .write_checkpoint(&job.id, stage("qa:prepare"))
        .expect("write");
    let job = engine.get_job(&job.id).expect("get").expect("job exists");
    assert_eq!(job.last_checkpoint.as_deref(), Some("qa:prepare"));
}

#[test]
fn progress_prefers_live_job_counters() {
    let dir = temp_dir("progress_live");
    let engine = open_engine(&dir);
    let job = engine
        .start_job(JobStart {
            job_type: "qa".to_string(),
            total_items: Some(10),
            processed_items: Some(4),
            ..JobStart::default()
        })
        .expect("start job");

    let mut details = JsonMap::new();
    details.insert("total".to_string(), json!(99));
    details.insert("completed".to_string(), json!(98));
    let checkpoint = engine
        .write_checkpoint(
            &job.id,
            CheckpointWrite {
                stage: "qa:run".to_string(),
                timestamp_ms: None,
                details: Some(details),
            },
        )
        .expect("write")
        .expect("job exists");
    assert_eq!(checkpoint.progress.total, Some(10));
    assert_eq!(checkpoint.progress.completed, Some(4));
}

#[test]
fn progress_falls_back_to_details_when_job_has_none() {
    let dir = temp_dir("progress_fallback");
    let engine = open_engine(&dir);
    let job = engine
        .start_job(JobStart {
            job_type: "qa".to_string(),
            ..JobStart::default()
        })
        .expect("start job");

    let mut details = JsonMap::new();
    details.insert("total".to_string(), json!(7));
    details.insert("completed".to_string(), json!(2));
    details.insert("reason".to_string(), json!("resume after interrupt"));
    let checkpoint = engine
        .write_checkpoint(
            &job.id,
            CheckpointWrite {
                stage: "qa:resume".to_string(),
                timestamp_ms: Some(42_000),
                details: Some(details),
            },
        )
        .expect("write")
        .expect("job exists");
    assert_eq!(checkpoint.progress.total, Some(7));
    assert_eq!(checkpoint.progress.completed, Some(2));
    assert_eq!(checkpoint.reason.as_deref(), Some("resume after interrupt"));
    assert_eq!(checkpoint.timestamp_ms, 42_000);
}

#[test]
fn checkpoint_captures_the_job_state_at_write_time() {
    let dir = temp_dir("state_at_write");
    let engine = open_engine(&dir);
    let job = engine
        .start_job(JobStart {
            job_type: "qa".to_string(),
            ..JobStart::default()
        })
        .expect("start job");

    engine
        .update_job_status(&job.id, JobState::Partial, JobStatusUpdate::default())
        .expect("update");
    let checkpoint = engine
        .write_checkpoint(&job.id, stage("qa:wrapup"))
        .expect("write")
        .expect("job exists");
    assert_eq!(checkpoint.status, JobState::Partial);
}

#[test]
fn checkpoint_for_an_unknown_job_is_a_noop() {
    let dir = temp_dir("unknown_job");
    let engine = open_engine(&dir);
    let outcome = engine
        .write_checkpoint("job_missing", stage("qa:prepare"))
        .expect("no error");
    assert!(outcome.is_none());
}

#[test]
fn checkpoint_ids_are_opaque_and_distinct() {
    let dir = temp_dir("distinct_ids");
    let engine = open_engine(&dir);
    let job = engine
        .start_job(JobStart {
            job_type: "qa".to_string(),
            ..JobStart::default()
        })
        .expect("start job");

    let first = engine
        .write_checkpoint(&job.id, stage("a"))
        .expect("write")
        .expect("job exists");
    let second = engine
        .write_checkpoint(&job.id, stage("b"))
        .expect("write")
        .expect("job exists");
    assert_ne!(first.checkpoint_id, second.checkpoint_id);
    assert!(first.checkpoint_id.starts_with("ckpt_"));
    let json_value: JsonValue = serde_json::to_value(&first).expect("serialize");
    assert_eq!(json_value["schema_version"], json!(1));
}
