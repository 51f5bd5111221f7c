#![forbid(unsafe_code)]

use std::path::PathBuf;
use tp_core::model::TaskLock;
use tp_store::{FileStore, LockOutcome, MirrorMode, Store, StoreBackend, StoreError, StoreOptions};

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("tp_store_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn open(test_name: &str, mirror: MirrorMode) -> Store {
    Store::open(temp_dir(test_name), StoreOptions { mirror }).expect("open store")
}

fn lock(task_id: &str, task_run_id: &str, job_id: &str, now_ms: i64, ttl_ms: i64) -> TaskLock {
    TaskLock {
        task_id: task_id.to_string(),
        task_run_id: task_run_id.to_string(),
        job_id: job_id.to_string(),
        acquired_at_ms: now_ms,
        expires_at_ms: now_ms + ttl_ms,
    }
}

fn both_modes() -> [MirrorMode; 2] {
    [MirrorMode::Disabled, MirrorMode::Auto]
}

#[test]
fn live_lock_rejects_second_acquire() {
    for (i, mode) in both_modes().into_iter().enumerate() {
        let mut store = open(&format!("live_rejects_{i}"), mode);
        let first = lock("T1", "tr-1", "job_a", 1_000, 60_000);
        assert!(
            store.acquire_task_lock(&first).expect("acquire").is_acquired(),
            "{mode:?}"
        );

        let second = lock("T1", "tr-2", "job_b", 2_000, 60_000);
        match store.acquire_task_lock(&second).expect("second acquire") {
            LockOutcome::AlreadyLocked {
                task_run_id,
                expires_at_ms,
            } => {
                assert_eq!(task_run_id, "tr-1");
                assert_eq!(expires_at_ms, 61_000);
            }
            LockOutcome::Acquired(_) => panic!("live lock must not be reclaimed ({mode:?})"),
        }
    }
}

#[test]
fn expired_lock_is_reclaimed_transparently() {
    for (i, mode) in both_modes().into_iter().enumerate() {
        let mut store = open(&format!("expired_reclaim_{i}"), mode);
        let first = lock("T1", "tr-1", "job_a", 1_000, 500);
        assert!(store.acquire_task_lock(&first).expect("acquire").is_acquired());

        // expires_at_ms = 1_500 has passed by the second attempt.
        let second = lock("T1", "tr-2", "job_b", 2_000, 60_000);
        let outcome = store.acquire_task_lock(&second).expect("reclaim");
        assert_eq!(outcome, LockOutcome::Acquired(second.clone()), "{mode:?}");

        let held = store.get_task_lock("T1").expect("get").expect("row exists");
        assert_eq!(held.task_run_id, "tr-2");
        assert_eq!(held.job_id, "job_b");
    }
}

#[test]
fn release_is_idempotent() {
    for (i, mode) in both_modes().into_iter().enumerate() {
        let mut store = open(&format!("release_idempotent_{i}"), mode);
        let row = lock("T1", "tr-1", "job_a", 1_000, 60_000);
        assert!(store.acquire_task_lock(&row).expect("acquire").is_acquired());

        assert!(store.release_task_lock("T1").expect("first release"));
        assert!(!store.release_task_lock("T1").expect("second release"));
        assert!(!store.release_task_lock("never-held").expect("unheld release"));
        assert!(store.get_task_lock("T1").expect("get").is_none(), "{mode:?}");
    }
}

// In file-only mode the lease map mutation itself must be exclusive across
// processes; a second store instance on the same root stands in for the
// second process here.
#[test]
fn file_lease_mutations_hold_a_cross_process_mutex() {
    let dir = temp_dir("lease_mutex");
    let mut store = FileStore::open(&dir).expect("open store");

    // Another holder of the advisory mutex keeps every mutation out instead
    // of letting it clobber the map.
    let holder = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join("task_locks.lock"))
        .expect("open mutex file");
    holder.try_lock().expect("hold mutex");

    let row = lock("T1", "tr-1", "job_a", 1_000, 60_000);
    let err = store
        .acquire_task_lock(&row)
        .expect_err("acquire must not bypass the held mutex");
    assert!(matches!(err, StoreError::Io(_)));
    assert!(store.get_task_lock("T1").expect("get").is_none());

    drop(holder);
    assert!(store.acquire_task_lock(&row).expect("acquire").is_acquired());

    let mut second = FileStore::open(&dir).expect("open second instance");
    let contested = lock("T1", "tr-2", "job_b", 2_000, 60_000);
    match second.acquire_task_lock(&contested).expect("second acquire") {
        LockOutcome::AlreadyLocked { task_run_id, .. } => assert_eq!(task_run_id, "tr-1"),
        LockOutcome::Acquired(_) => panic!("live lock must win across instances"),
    }
    let held = store.get_task_lock("T1").expect("get").expect("row exists");
    assert_eq!(held.task_run_id, "tr-1");
}

#[test]
fn bulk_release_by_job_frees_every_task() {
    for (i, mode) in both_modes().into_iter().enumerate() {
        let mut store = open(&format!("bulk_release_{i}"), mode);
        for task_id in ["T1", "T2", "T3"] {
            let row = lock(task_id, "tr-1", "job_a", 1_000, 60_000);
            assert!(store.acquire_task_lock(&row).expect("acquire").is_acquired());
        }
        let other = lock("T9", "tr-9", "job_other", 1_000, 60_000);
        assert!(store.acquire_task_lock(&other).expect("acquire").is_acquired());

        assert_eq!(store.release_task_locks_by_job("job_a").expect("bulk"), 3);

        // Previously held tasks are immediately acquirable, the other job's
        // lease is untouched.
        let again = lock("T2", "tr-2", "job_b", 2_000, 60_000);
        assert!(store.acquire_task_lock(&again).expect("reacquire").is_acquired());
        let survivor = store.get_task_lock("T9").expect("get").expect("still held");
        assert_eq!(survivor.job_id, "job_other", "{mode:?}");
    }
}
