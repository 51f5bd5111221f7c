#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;
use tp_core::ids::WorkspaceId;
use tp_core::model::{JobState, RunStatus};
use tp_engine::{
    CheckpointWrite, CommandRunStart, Engine, EngineOptions, JobStart, JobStatusUpdate,
    TelemetryTier,
};
use tp_store::{LockOutcome, MirrorMode, Store, StoreOptions};

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

// A full qa-tasks command: one job, one contested lease, two checkpoints,
// a partial finish. The lease survives because the job was not cancelled.
#[test]
fn qa_run_ends_partial_with_the_lease_still_held() {
    let store = Store::open(
        temp_dir("qa_partial"),
        StoreOptions {
            mirror: MirrorMode::Auto,
        },
    )
    .expect("open store");
    let engine = Engine::new(
        store,
        WorkspaceId::try_new("test-ws").expect("workspace id"),
        EngineOptions {
            telemetry: Some(TelemetryTier::Normal),
            exporter: None,
        },
    );

    let run = engine
        .start_command_run(CommandRunStart {
            command_name: "qa-tasks".to_string(),
            task_ids: vec!["T1".to_string(), "T2".to_string(), "T3".to_string()],
            ..CommandRunStart::default()
        })
        .expect("start run");

    let job = engine
        .start_job(JobStart {
            job_type: "qa".to_string(),
            command_run_id: Some(run.id.clone()),
            total_items: Some(3),
            ..JobStart::default()
        })
        .expect("start job");

    let first = engine
        .acquire_task_lock("T1", "tr-1", &job.id, Duration::from_secs(60))
        .expect("acquire");
    assert!(first.is_acquired());

    let contested = engine
        .acquire_task_lock("T1", "tr-2", &job.id, Duration::from_secs(60))
        .expect("second acquire");
    match contested {
        LockOutcome::AlreadyLocked { task_run_id, .. } => assert_eq!(task_run_id, "tr-1"),
        LockOutcome::Acquired(_) => panic!("contested lease must not be granted"),
    }

    let prepare = engine
        .write_checkpoint(
            &job.id,
            CheckpointWrite {
                stage: "qa:prepare".to_string(),
                timestamp_ms: None,
                details: None,
            },
        )
        .expect("checkpoint")
        .expect("job exists");
    assert_eq!(prepare.checkpoint_seq, 1);

    let run_stage = engine
        .write_checkpoint(
            &job.id,
            CheckpointWrite {
                stage: "qa:run".to_string(),
                timestamp_ms: None,
                details: None,
            },
        )
        .expect("checkpoint")
        .expect("job exists");
    assert_eq!(run_stage.checkpoint_seq, 2);

    engine
        .update_job_status(
            &job.id,
            JobState::Partial,
            JobStatusUpdate {
                processed_items: Some(2),
                ..JobStatusUpdate::default()
            },
        )
        .expect("update")
        .expect("job exists");

    engine
        .finish_command_run(&run.id, RunStatus::Completed, None, None)
        .expect("finish run")
        .expect("run exists");

    let job = engine.get_job(&job.id).expect("get").expect("job exists");
    assert_eq!(job.state, JobState::Partial);
    assert_eq!(job.processed_items, Some(2));
    assert_eq!(job.last_checkpoint.as_deref(), Some("qa:run"));

    let run = engine
        .get_command_run(&run.id)
        .expect("get run")
        .expect("run exists");
    assert_eq!(run.status, RunStatus::Completed);

    let checkpoints = engine.list_checkpoints(&job.id).expect("list");
    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[0].stage, "qa:prepare");
    assert_eq!(checkpoints[1].stage, "qa:run");

    // Partial is not cancelled: the lease was never released.
    let lock = engine
        .get_task_lock("T1")
        .expect("get lock")
        .expect("lease still held");
    assert_eq!(lock.task_run_id, "tr-1");
}
