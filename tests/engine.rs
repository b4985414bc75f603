//! Audio engine integration tests

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_test::{assert_pending, assert_ready_ok, task};
use voice_onboarding::config::EngineConfig;
use voice_onboarding::{
    AudioFormat, AudioQueueEngine, ChunkOutcome, EngineError, EngineState, WavBackend,
};

mod common;
use common::{ManualBackend, fast_engine_config};

const FORMAT: AudioFormat = AudioFormat::PCM_S16LE_MONO_16K;

async fn ready_engine(backend: &ManualBackend, config: &EngineConfig) -> AudioQueueEngine {
    let engine = AudioQueueEngine::spawn(Arc::new(backend.clone()), config);
    engine.initialize(FORMAT).await.unwrap();
    engine
}

async fn active(engine: &AudioQueueEngine) -> usize {
    engine.snapshot().await.unwrap().active_buffers
}

#[tokio::test]
async fn counter_tracks_buffers_and_drains_after_end_of_input() {
    let backend = ManualBackend::manual();
    let engine = ready_engine(&backend, &fast_engine_config()).await;

    for expected in 1..=3 {
        match engine.enqueue_chunk(vec![0; 512]).await.unwrap() {
            ChunkOutcome::Enqueued { active, .. } => assert_eq!(active, expected),
            ChunkOutcome::Dropped(e) => panic!("chunk dropped: {e}"),
        }
    }
    assert_eq!(backend.started(), 1);
    assert_eq!(engine.snapshot().await.unwrap().state, EngineState::Playing);

    let drained = engine.end_of_input().await.unwrap();
    let mut wait = task::spawn(drained.wait());

    assert!(backend.complete_next());
    assert!(backend.complete_next());
    assert_eq!(active(&engine).await, 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_pending!(wait.poll());

    assert!(backend.complete_next());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(wait.is_woken());
    assert_ready_ok!(wait.poll());

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.active_buffers, 0);
    assert_eq!(snapshot.completed, 3);
    assert!(!snapshot.drain_pending);
}

#[tokio::test]
async fn idle_counter_without_end_of_input_never_drains() {
    let backend = ManualBackend::manual();
    let engine = ready_engine(&backend, &fast_engine_config()).await;

    engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    backend.complete_all();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.active_buffers, 0);
    assert!(!snapshot.input_ended);
    assert!(!snapshot.drain_pending);

    // Counter already at zero: end of input drains after the grace delay
    let drained = engine.end_of_input().await.unwrap();
    timeout(Duration::from_secs(1), drained.wait())
        .await
        .expect("drain never fired")
        .unwrap();
}

#[tokio::test]
async fn buffers_reach_device_in_submission_order() {
    let backend = ManualBackend::manual();
    let engine = ready_engine(&backend, &fast_engine_config()).await;

    for len in [512, 100, 7, 512] {
        engine.enqueue_chunk(vec![1; len]).await.unwrap();
    }

    assert_eq!(backend.submitted_sizes(), vec![512, 100, 7, 512]);
}

#[tokio::test]
async fn stop_suppresses_pending_drain() {
    let backend = ManualBackend::manual();
    let engine = ready_engine(&backend, &fast_engine_config()).await;

    engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    let drained = engine.end_of_input().await.unwrap();

    engine.stop().await;
    assert_eq!(backend.stopped(), 1);
    assert_eq!(drained.wait().await, Err(EngineError::Stopped));

    // Completions from the disposed device change nothing
    let events = backend.device_events(0);
    for (slot, _) in backend.submitted() {
        events.finished(slot);
    }
    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.state, EngineState::Stopped);
    assert_eq!(snapshot.active_buffers, 0);
    assert_eq!(snapshot.completed, 0);
}

#[tokio::test]
async fn stop_during_grace_cancels_notification() {
    let backend = ManualBackend::manual();
    let config = EngineConfig {
        drain_grace: Duration::from_millis(100),
        ..EngineConfig::default()
    };
    let engine = ready_engine(&backend, &config).await;

    engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    let drained = engine.end_of_input().await.unwrap();
    backend.complete_all();
    assert!(engine.snapshot().await.unwrap().drain_pending);

    engine.stop().await;
    assert_eq!(drained.wait().await, Err(EngineError::Stopped));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let backend = ManualBackend::manual();
    let engine = ready_engine(&backend, &fast_engine_config()).await;

    engine.stop().await;
    engine.stop().await;

    assert_eq!(backend.stopped(), 1);
    assert_eq!(engine.snapshot().await.unwrap().state, EngineState::Stopped);
}

#[tokio::test]
async fn duplicate_and_stale_completions_are_ignored() {
    let backend = ManualBackend::manual();
    let engine = ready_engine(&backend, &fast_engine_config()).await;

    let ChunkOutcome::Enqueued { slot, .. } = engine.enqueue_chunk(vec![0; 512]).await.unwrap()
    else {
        panic!("chunk dropped");
    };

    let events = backend.device_events(0);
    events.finished(slot);
    events.finished(slot);
    events.finished(slot);

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.active_buffers, 0);
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.live_slots, 0);
}

#[tokio::test]
async fn events_from_previous_device_are_ignored() {
    let backend = ManualBackend::manual();
    let engine = ready_engine(&backend, &fast_engine_config()).await;
    let old_events = backend.device_events(0);

    engine.stop().await;
    engine.initialize(FORMAT).await.unwrap();
    assert_eq!(backend.opened(), 2);

    let ChunkOutcome::Enqueued { slot, .. } = engine.enqueue_chunk(vec![0; 512]).await.unwrap()
    else {
        panic!("chunk dropped");
    };

    old_events.finished(slot);
    assert_eq!(active(&engine).await, 1);

    backend.device_events(1).finished(slot);
    assert_eq!(active(&engine).await, 0);
}

#[tokio::test]
async fn exhausted_pool_drops_chunk_and_continues() {
    let backend = ManualBackend::manual();
    let config = EngineConfig {
        max_slots: 2,
        ..fast_engine_config()
    };
    let engine = ready_engine(&backend, &config).await;

    engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    engine.enqueue_chunk(vec![0; 512]).await.unwrap();

    let outcome = engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    assert!(matches!(
        outcome,
        ChunkOutcome::Dropped(EngineError::AllocationFailed(_))
    ));

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.active_buffers, 2);
    assert_eq!(snapshot.dropped, 1);

    assert!(backend.complete_next());
    let outcome = engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    assert!(matches!(outcome, ChunkOutcome::Enqueued { active: 2, .. }));
}

#[tokio::test]
async fn oversized_chunk_is_dropped() {
    let backend = ManualBackend::manual();
    let engine = ready_engine(&backend, &fast_engine_config()).await;

    let outcome = engine.enqueue_chunk(vec![0; 513]).await.unwrap();
    assert!(matches!(
        outcome,
        ChunkOutcome::Dropped(EngineError::AllocationFailed(_))
    ));
    assert!(backend.submitted().is_empty());
}

#[tokio::test]
async fn start_failure_drops_chunk_without_counting_it() {
    let backend = ManualBackend::failing_start();
    let engine = ready_engine(&backend, &fast_engine_config()).await;

    let outcome = engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    assert!(matches!(
        outcome,
        ChunkOutcome::Dropped(EngineError::DeviceStart(_))
    ));

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.active_buffers, 0);
    assert_eq!(snapshot.live_slots, 0);
    assert_eq!(snapshot.state, EngineState::Ready);
}

#[tokio::test]
async fn new_audio_cancels_scheduled_drain() {
    let backend = ManualBackend::manual();
    let config = EngineConfig {
        drain_grace: Duration::from_millis(100),
        ..EngineConfig::default()
    };
    let engine = ready_engine(&backend, &config).await;

    engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    let drained = engine.end_of_input().await.unwrap();
    let mut wait = Box::pin(drained.wait());
    backend.complete_all();

    // Late chunk arrives inside the grace window
    engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    assert!(
        timeout(Duration::from_millis(250), &mut wait).await.is_err(),
        "drained with a buffer still active"
    );

    backend.complete_all();
    timeout(Duration::from_secs(1), wait)
        .await
        .expect("drain never fired")
        .unwrap();
}

#[tokio::test]
async fn pause_holds_drain_until_resume() {
    let backend = ManualBackend::manual();
    let engine = ready_engine(&backend, &fast_engine_config()).await;

    engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    let drained = engine.end_of_input().await.unwrap();
    let mut wait = Box::pin(drained.wait());

    engine.pause().await.unwrap();
    assert_eq!(backend.paused(), 1);

    // Last buffer reports back after the pause landed
    backend.complete_all();
    assert!(
        timeout(Duration::from_millis(100), &mut wait).await.is_err(),
        "drained while paused"
    );
    let snapshot = engine.snapshot().await.unwrap();
    assert!(snapshot.paused);
    assert_eq!(snapshot.active_buffers, 0);

    engine.resume().await.unwrap();
    assert_eq!(backend.resumed(), 1);
    timeout(Duration::from_secs(1), wait)
        .await
        .expect("drain never fired after resume")
        .unwrap();
}

#[tokio::test]
async fn pause_during_grace_defers_notification() {
    let backend = ManualBackend::manual();
    let config = EngineConfig {
        drain_grace: Duration::from_millis(100),
        ..EngineConfig::default()
    };
    let engine = ready_engine(&backend, &config).await;

    engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    let drained = engine.end_of_input().await.unwrap();
    let mut wait = Box::pin(drained.wait());
    backend.complete_all();
    assert_eq!(active(&engine).await, 0);

    engine.pause().await.unwrap();
    assert!(
        timeout(Duration::from_millis(250), &mut wait).await.is_err(),
        "grace timer fired while paused"
    );

    engine.resume().await.unwrap();
    timeout(Duration::from_secs(1), wait)
        .await
        .expect("drain never fired after resume")
        .unwrap();
}

#[tokio::test]
async fn pause_and_resume_lifecycle() {
    let backend = ManualBackend::manual();
    let engine = AudioQueueEngine::spawn(Arc::new(backend.clone()), &fast_engine_config());
    assert_eq!(engine.pause().await, Err(EngineError::NotReady));
    assert_eq!(engine.resume().await, Err(EngineError::NotReady));

    engine.initialize(FORMAT).await.unwrap();

    // Not started yet: the device is paused right after its first start
    engine.pause().await.unwrap();
    engine.pause().await.unwrap();
    assert_eq!(backend.paused(), 0);
    engine.enqueue_chunk(vec![0; 512]).await.unwrap();
    assert_eq!(backend.started(), 1);
    assert_eq!(backend.paused(), 1);

    engine.resume().await.unwrap();
    engine.resume().await.unwrap();
    assert_eq!(backend.resumed(), 1);

    engine.pause().await.unwrap();
    engine.stop().await;
    assert!(!engine.snapshot().await.unwrap().paused);
}

#[tokio::test]
async fn lifecycle_errors() {
    let backend = ManualBackend::manual();
    let engine = AudioQueueEngine::spawn(Arc::new(backend.clone()), &fast_engine_config());

    assert_eq!(
        engine.enqueue_chunk(vec![0; 4]).await,
        Err(EngineError::NotReady)
    );
    assert!(matches!(
        engine.end_of_input().await,
        Err(EngineError::NotReady)
    ));

    engine.initialize(FORMAT).await.unwrap();
    assert_eq!(
        engine.initialize(FORMAT).await,
        Err(EngineError::AlreadyInitialized)
    );

    engine.stop().await;
    assert_eq!(
        engine.enqueue_chunk(vec![0; 4]).await,
        Err(EngineError::NotReady)
    );

    // Stopped engines may be initialized again
    engine.initialize(FORMAT).await.unwrap();
    assert_eq!(backend.opened(), 2);
}

#[tokio::test]
async fn dropping_every_handle_disposes_device() {
    let backend = ManualBackend::manual();
    let engine = ready_engine(&backend, &fast_engine_config()).await;
    engine.enqueue_chunk(vec![0; 512]).await.unwrap();

    drop(engine);
    for _ in 0..50 {
        if backend.stopped() == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("device was not stopped after the engine was dropped");
}

#[tokio::test]
async fn wav_backend_records_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.wav");

    let engine = AudioQueueEngine::spawn(Arc::new(WavBackend::new(&path)), &fast_engine_config());
    engine.initialize(FORMAT).await.unwrap();

    let pcm: Vec<u8> = (0_i16..512).flat_map(i16::to_le_bytes).collect();
    for chunk in pcm.chunks(512) {
        engine.enqueue_chunk(chunk.to_vec()).await.unwrap();
    }
    let drained = engine.end_of_input().await.unwrap();
    timeout(Duration::from_secs(1), drained.wait())
        .await
        .expect("drain never fired")
        .unwrap();
    engine.stop().await;

    let mut reader = hound::WavReader::open(&path).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, 16_000);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);

    let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(samples.len(), 512);
    assert_eq!(samples[..4], [0, 1, 2, 3]);
}
