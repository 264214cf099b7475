//! Cross-engine tests: several engines in one process attached to the same
//! region file behave like independent processes, except that they share
//! the process-wide type-identifier registry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::core::SyncConfig;
use crate::sync::{EngineState, StateSync};
use crate::ShstateError;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct AppState {
    message: String,
    count: u64,
}

// Auto-publish interval long enough to never fire during a test that only
// exercises explicit publishes.
const AUTO_PUBLISH_DISABLED_MS: u64 = 3_600_000;

fn manual_config(dir: &TempDir) -> SyncConfig {
    SyncConfig::builder()
        .data_dir(dir.path())
        .region_file_name("pair.mmap")
        .detect_interval(Duration::from_millis(10))
        .publish_interval(Duration::from_millis(AUTO_PUBLISH_DISABLED_MS))
        .build()
        .expect("test config")
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Registers a callback that counts invocations and forwards snapshots.
fn counting_callback(
    engine: &StateSync<AppState>,
) -> (Arc<AtomicUsize>, mpsc::Receiver<AppState>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let hits_in_callback = Arc::clone(&hits);
    engine.on_change(move |snapshot: AppState| {
        hits_in_callback.fetch_add(1, Ordering::SeqCst);
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(snapshot);
        }
    });
    (hits, rx)
}

#[test]
fn publish_reaches_peer_and_fires_callback_once() -> Result<(), ShstateError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = manual_config(&dir);

    let record1 = Arc::new(Mutex::new(AppState {
        message: "init".to_string(),
        count: 0,
    }));
    let mut engine1 = StateSync::with_config(Arc::clone(&record1), config.clone())?;

    let record2 = Arc::new(Mutex::new(AppState::default()));
    let mut engine2 = StateSync::with_config(Arc::clone(&record2), config)?;
    let (hits, changes) = counting_callback(&engine2);

    engine1.publish()?;

    let got = changes
        .recv_timeout(Duration::from_secs(2))
        .expect("change was not delivered");
    assert_eq!(got.message, "init");
    assert_eq!(got.count, 0);
    assert_eq!(record2.lock()?.clone(), got);

    // One publish, one delivery.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    engine1.close();
    engine2.close();
    Ok(())
}

#[test]
fn fresh_engine_attaches_to_previously_published_state() -> Result<(), ShstateError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = manual_config(&dir);

    {
        let record = Arc::new(Mutex::new(AppState {
            message: "survivor".to_string(),
            count: 7,
        }));
        let mut engine = StateSync::with_config(Arc::clone(&record), config.clone())?;
        engine.publish()?;
        engine.close();
    }

    let record = Arc::new(Mutex::new(AppState::default()));
    let _engine = StateSync::with_config(Arc::clone(&record), config)?;
    // Construction already decoded the region; no detection interval needed.
    let state = record.lock()?.clone();
    assert_eq!(state.message, "survivor");
    assert_eq!(state.count, 7);
    Ok(())
}

#[test]
fn later_writer_wins_and_versions_stay_monotonic() -> Result<(), ShstateError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = manual_config(&dir);

    let record1 = Arc::new(Mutex::new(AppState {
        message: "first".to_string(),
        count: 10,
    }));
    let engine1 = StateSync::with_config(Arc::clone(&record1), config.clone())?;
    engine1.publish()?;
    assert_eq!(engine1.version(), 1);

    // Construction seeds the second writer's record from the region; its
    // own value goes in afterwards.
    let record2 = Arc::new(Mutex::new(AppState::default()));
    let engine2 = StateSync::with_config(Arc::clone(&record2), config.clone())?;
    {
        let mut record = record2.lock()?;
        record.message = "second".to_string();
        record.count = 20;
    }
    engine2.publish()?;
    assert_eq!(engine2.version(), 2);

    // A third engine attaching late sees only the final value.
    let record3 = Arc::new(Mutex::new(AppState::default()));
    let engine3 = StateSync::with_config(Arc::clone(&record3), config)?;
    assert_eq!(engine3.version(), 2);
    assert_eq!(record3.lock()?.count, 20);

    // The first writer converges onto the second writer's value.
    assert!(wait_until(Duration::from_secs(2), || {
        record1.lock().map(|r| r.count == 20).unwrap_or(false)
    }));
    Ok(())
}

#[test]
fn own_publish_is_never_delivered_back() -> Result<(), ShstateError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = manual_config(&dir);

    let record1 = Arc::new(Mutex::new(AppState {
        message: "mine".to_string(),
        count: 99,
    }));
    let engine1 = StateSync::with_config(Arc::clone(&record1), config.clone())?;
    let (hits1, _changes1) = counting_callback(&engine1);

    engine1.publish()?;
    thread::sleep(Duration::from_millis(200));
    assert_eq!(
        hits1.load(Ordering::SeqCst),
        0,
        "engine received a callback for its own publish"
    );

    // A peer's publish does reach us.
    let record2 = Arc::new(Mutex::new(AppState::default()));
    let engine2 = StateSync::with_config(Arc::clone(&record2), config)?;
    {
        let mut record = record2.lock()?;
        record.message = "peer".to_string();
        record.count = 100;
    }
    engine2.publish()?;
    assert!(wait_until(Duration::from_secs(2), || {
        hits1.load(Ordering::SeqCst) == 1
    }));
    Ok(())
}

#[test]
fn oversized_publish_leaves_region_unchanged() -> Result<(), ShstateError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = SyncConfig::builder()
        .data_dir(dir.path())
        .region_file_name("pair.mmap")
        .region_size(128)
        .detect_interval(Duration::from_millis(10))
        .publish_interval(Duration::from_millis(AUTO_PUBLISH_DISABLED_MS))
        .build()?;

    let record1 = Arc::new(Mutex::new(AppState {
        message: "small".to_string(),
        count: 1,
    }));
    let engine1 = StateSync::with_config(Arc::clone(&record1), config.clone())?;
    engine1.publish()?;
    assert_eq!(engine1.version(), 1);

    record1.lock()?.message = "x".repeat(256);
    match engine1.publish() {
        Err(ShstateError::TooLarge { available, .. }) => assert_eq!(available, 128),
        other => panic!("expected TooLarge, got {:?}", other),
    }
    assert_eq!(engine1.version(), 1);

    // A late peer still decodes the previous payload.
    let record2 = Arc::new(Mutex::new(AppState::default()));
    let engine2 = StateSync::with_config(Arc::clone(&record2), config)?;
    assert_eq!(engine2.version(), 1);
    assert_eq!(record2.lock()?.message, "small");
    Ok(())
}

#[test]
fn rapid_mutations_coalesce_into_one_publish() -> Result<(), ShstateError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer_config = SyncConfig::builder()
        .data_dir(dir.path())
        .region_file_name("pair.mmap")
        .detect_interval(Duration::from_millis(10))
        .publish_interval(Duration::from_millis(30))
        .build()?;
    let observer_config = manual_config(&dir);

    // The observer attaches first so the writer's initial auto-publish is
    // guaranteed to arrive as a change.
    let record2 = Arc::new(Mutex::new(AppState::default()));
    let engine2 = StateSync::with_config(Arc::clone(&record2), observer_config)?;
    let (_hits, changes) = counting_callback(&engine2);

    let record1 = Arc::new(Mutex::new(AppState::default()));
    let _engine1 = StateSync::with_config(Arc::clone(&record1), writer_config)?;

    // The writer's first tick publishes the initial snapshot.
    let first = changes
        .recv_timeout(Duration::from_secs(2))
        .expect("initial snapshot not delivered");
    assert_eq!(first.count, 0);

    // Three mutations under one lock; the next tick sees only the last one.
    {
        let mut record = record1.lock()?;
        record.count = 1;
        record.count = 2;
        record.count = 3;
    }

    let mut observed = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        match changes.recv_timeout(Duration::from_millis(50)) {
            Ok(snapshot) => observed.push(snapshot.count),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if observed.contains(&3) {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    assert!(!observed.contains(&1), "intermediate value 1 leaked: {:?}", observed);
    assert!(!observed.contains(&2), "intermediate value 2 leaked: {:?}", observed);
    assert_eq!(
        observed.iter().filter(|&&count| count == 3).count(),
        1,
        "final value delivered more than once: {:?}",
        observed
    );
    Ok(())
}

#[test]
fn unchanged_record_produces_no_further_versions() -> Result<(), ShstateError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = SyncConfig::builder()
        .data_dir(dir.path())
        .region_file_name("pair.mmap")
        .detect_interval(Duration::from_millis(10))
        .publish_interval(Duration::from_millis(20))
        .build()?;

    let record = Arc::new(Mutex::new(AppState {
        message: "steady".to_string(),
        count: 5,
    }));
    let engine = StateSync::with_config(Arc::clone(&record), config)?;

    // First tick publishes the seed snapshot (digest starts empty).
    assert!(wait_until(Duration::from_secs(2), || engine.version() == 1));

    // With no mutations, every following tick is suppressed.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(engine.version(), 1);
    Ok(())
}

#[test]
fn explicit_publish_suppresses_the_next_auto_tick() -> Result<(), ShstateError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = manual_config(&dir);

    let record = Arc::new(Mutex::new(AppState {
        message: "once".to_string(),
        count: 1,
    }));
    let engine = StateSync::with_config(Arc::clone(&record), config)?;
    engine.publish()?;
    assert_eq!(engine.version(), 1);

    engine.auto_publish(Duration::from_millis(20));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(
        engine.version(),
        1,
        "auto-publish re-published an unchanged record"
    );
    Ok(())
}

#[test]
fn close_is_idempotent_and_rejects_publish() -> Result<(), ShstateError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = manual_config(&dir);

    let record = Arc::new(Mutex::new(AppState::default()));
    let mut engine = StateSync::with_config(Arc::clone(&record), config)?;
    assert_eq!(engine.state(), EngineState::Running);

    engine.close();
    assert_eq!(engine.state(), EngineState::Closed);
    engine.close();
    assert_eq!(engine.state(), EngineState::Closed);

    match engine.publish() {
        Err(ShstateError::Closed) => {}
        other => panic!("expected Closed, got {:?}", other),
    }
    Ok(())
}

#[test]
fn non_record_types_are_rejected_at_construction() {
    let dir = tempfile::tempdir().expect("tempdir");

    match StateSync::with_config(Arc::new(Mutex::new(7u64)), manual_config(&dir)) {
        Err(ShstateError::InvalidType(name)) => assert!(name.contains("u64")),
        other => panic!("expected InvalidType, got {:?}", other.map(|_| ())),
    }
    match StateSync::with_config(Arc::new(Mutex::new(vec![1u8, 2])), manual_config(&dir)) {
        Err(ShstateError::InvalidType(name)) => assert!(name.contains("Vec")),
        other => panic!("expected InvalidType, got {:?}", other.map(|_| ())),
    }
    // No region file is created for a rejected record type.
    assert!(!dir.path().join("pair.mmap").exists());
}

#[test]
fn panicking_callback_does_not_stall_dispatch() -> Result<(), ShstateError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = manual_config(&dir);

    let record1 = Arc::new(Mutex::new(AppState::default()));
    let engine1 = StateSync::with_config(Arc::clone(&record1), config.clone())?;

    let record2 = Arc::new(Mutex::new(AppState::default()));
    let engine2 = StateSync::with_config(Arc::clone(&record2), config)?;
    engine2.on_change(|_snapshot: AppState| panic!("callback bug"));
    let (hits, _changes) = counting_callback(&engine2);

    record1.lock()?.count = 1;
    engine1.publish()?;
    assert!(wait_until(Duration::from_secs(2), || {
        hits.load(Ordering::SeqCst) == 1
    }));

    record1.lock()?.count = 2;
    engine1.publish()?;
    assert!(wait_until(Duration::from_secs(2), || {
        hits.load(Ordering::SeqCst) == 2
    }));
    Ok(())
}
