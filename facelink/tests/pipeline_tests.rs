//! End-to-end pipeline tests with every stage worker running on a thread
//! of the test process, attached to real shared memory.

use facelink::backends::DeviceRegistry;
use facelink::face::LandmarkScheme;
use facelink::frame::{
    FrameRecord, IMAGE_FRAME, IMAGE_MERGED, aligned_key, landmarks_mask_key, swapped_key,
    swapped_mask_key,
};
use facelink::host::drive;
use facelink::stages::{StageKind, run_stage};
use facelink::wiring::{ManagedStage, Pipeline};
use facelink::{StageError, StageResult};
use facelink_common::config::{AppConfig, PipelineConfig, SourceConfig};
use facelink_common::tick::SystemClock;
use facelink_control::supervisor::Lifecycle;
use facelink_control::{
    ControlResult, KvStore, MessagePipe, WorkerLauncher, WorkerProcess, enabled_key,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct StageThreadLauncher {
    kind: StageKind,
}

impl WorkerLauncher for StageThreadLauncher {
    fn launch(&mut self, _stage: &str) -> ControlResult<(Box<dyn WorkerProcess>, MessagePipe)> {
        let (host, worker_end) = MessagePipe::pair()?;
        let kind = self.kind;
        let handle = std::thread::spawn(move || {
            let _ = run_stage(kind, worker_end, Duration::from_millis(1), DeviceRegistry::simulated());
        });
        Ok((Box::new(StageThread { handle: Some(handle) }), host))
    }
}

struct StageThread {
    handle: Option<JoinHandle<()>>,
}

impl WorkerProcess for StageThread {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn terminate(&mut self) {}

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn thread_launchers(kind: StageKind) -> StageResult<Box<dyn WorkerLauncher>> {
    Ok(Box::new(StageThreadLauncher { kind }))
}

fn small_config(fps: f64) -> AppConfig {
    AppConfig {
        pipeline: PipelineConfig {
            table_size: 8,
            ring_heap_size_mb: 1,
            image_heap_size_mb: 16,
            buffer_slack: 1,
            read_timeout_ms: 2,
            tick_interval_ms: 1,
            host_interval_ms: 2,
        },
        source: SourceConfig {
            width: 96,
            height: 72,
            fps,
        },
        ..AppConfig::default()
    }
}

fn build(app: &str, tag: &str, store: Arc<Mutex<KvStore>>) -> Pipeline {
    build_with(app, tag, store, small_config(60.0))
}

fn build_with(app: &str, tag: &str, store: Arc<Mutex<KvStore>>, config: AppConfig) -> Pipeline {
    let session = format!("t{}_{}_", std::process::id(), tag);
    Pipeline::build(app, &session, &config, store, thread_launchers).unwrap()
}

fn memory_store() -> Arc<Mutex<KvStore>> {
    Arc::new(Mutex::new(KvStore::in_memory()))
}

/// Pump until a preview record satisfies `pred`
fn wait_for_preview(pipeline: &mut Pipeline, what: &str, pred: impl Fn(&FrameRecord) -> bool) -> FrameRecord {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        pipeline.process_messages(Instant::now());
        if let Some(record) = pipeline.take_preview() {
            if pred(&record) {
                return record;
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}

fn shut_down(pipeline: &mut Pipeline) {
    let interrupts = AtomicUsize::new(1);
    let summary = drive(pipeline, &interrupts, &mut SystemClock, Duration::from_millis(2));
    assert!(!summary.forced);
    assert!(pipeline.all_stopped());
}

#[test]
fn test_passthrough_delivers_source_frames() {
    let mut pipeline = build("passthrough", "pass", memory_store());
    pipeline.start_enabled();

    let record = wait_for_preview(&mut pipeline, "a captured frame", |r| {
        r.images.contains_key(IMAGE_FRAME)
    });
    let frame = record.image(pipeline.heap(), IMAGE_FRAME).unwrap();
    assert_eq!((frame.width(), frame.height()), (96, 72));
    assert!(record.faces.is_empty());

    shut_down(&mut pipeline);
}

#[test]
fn test_full_app_swaps_faces() {
    let mut pipeline = build("facelink", "full", memory_store());
    pipeline.start_enabled();

    let record = wait_for_preview(&mut pipeline, "a merged frame", |r| {
        r.images.contains_key(IMAGE_MERGED) && !r.faces.is_empty()
    });
    let face = &record.faces[0];
    let landmarks = face.landmarks.as_ref().unwrap();
    assert_eq!(landmarks.scheme(), LandmarkScheme::FivePoint);
    assert_eq!(landmarks.points().len(), 5);
    // Test pattern faces look straight into the camera
    let pose = face.pose.unwrap();
    assert!(pose.roll.abs() < 1.0 && pose.yaw.abs() < 1.0);
    assert!(face.aligned.and_then(|a| a.to_frame()).is_some());
    assert!(face.rect.corners.iter().all(|&(x, y)| (0.0..=1.0).contains(&x) && (0.0..=1.0).contains(&y)));
    for key in [
        aligned_key(0),
        landmarks_mask_key(0),
        swapped_key(0),
        swapped_mask_key(0),
    ] {
        assert!(record.images.contains_key(&key), "{key} missing");
    }
    assert_eq!(record.frame_count, None);

    shut_down(&mut pipeline);
}

#[test]
fn test_reemit_resends_last_frame() {
    // One frame a second, so the resend is the newest record when the host looks
    let mut pipeline = build_with("passthrough", "reemit", memory_store(), small_config(1.0));
    pipeline.start_enabled();
    let first = wait_for_preview(&mut pipeline, "a first frame", |_| true);

    pipeline.request_reemit().unwrap();
    let again = wait_for_preview(&mut pipeline, "a reemitted frame", |r| r.is_reemitted);
    assert!(again.frame_num >= first.frame_num);
    assert_ne!(again.uid, first.uid);

    shut_down(&mut pipeline);
}

#[test]
fn test_disabled_stage_is_not_started() {
    let store = memory_store();
    store.lock().set(&enabled_key("output"), &false).unwrap();

    let mut pipeline = build("passthrough", "disabled", store);
    pipeline.start_enabled();
    let lifecycles: Vec<Lifecycle> = pipeline.stages().iter().map(|s| s.lifecycle()).collect();
    assert_eq!(lifecycles, vec![Lifecycle::Starting, Lifecycle::Stopped]);

    shut_down(&mut pipeline);
}

#[test]
fn test_second_interrupt_forces_stop() {
    let mut pipeline = build("passthrough", "force", memory_store());
    pipeline.start_enabled();

    let interrupts = AtomicUsize::new(2);
    let summary = drive(&mut pipeline, &interrupts, &mut SystemClock, Duration::from_millis(2));
    assert!(summary.forced);
    assert!(pipeline.all_stopped());
    assert!(pipeline.stages().iter().all(|s| s.last_error().is_none()));
}

#[test]
fn test_unknown_app_is_rejected() {
    let result = Pipeline::build("karaoke", "unused_", &small_config(60.0), memory_store(), thread_launchers);
    assert!(matches!(result, Err(StageError::UnknownApp(_))));
}
