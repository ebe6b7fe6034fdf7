//! End-to-end agent runs against the in-memory hub with synthetic devices.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::NamedTempFile;

use kiosk_gate::channel::{HubTransport, MemoryHub};
use kiosk_gate::config::KioskConfig;
use kiosk_gate::protocol::LifecycleEvent;
use kiosk_gate::runtime::{run_proximity, run_stillness, run_vision};
use kiosk_gate::session::CoordinatorExit;

const WAIT: Duration = Duration::from_secs(5);

fn config(json: &str) -> KioskConfig {
    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("temp config");
    file.write_all(json.as_bytes()).expect("write config");
    load(&file)
}

fn load(file: &NamedTempFile) -> KioskConfig {
    KioskConfig::load_from(Some(file.path())).expect("load config")
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn count(hub: &MemoryHub, kind: &str) -> usize {
    hub.published_events()
        .iter()
        .filter(|event| event.kind() == kind)
        .count()
}

type Runner = fn(&KioskConfig, Arc<dyn HubTransport>, Arc<AtomicBool>) -> Result<CoordinatorExit>;

struct Running {
    hub: MemoryHub,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<Result<CoordinatorExit>>,
}

impl Running {
    fn start(run: Runner, config: KioskConfig) -> Self {
        let hub = MemoryHub::new();
        let transport: Arc<dyn HubTransport> = Arc::new(hub.transport());
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || run(&config, transport, stop));
        Self {
            hub,
            shutdown,
            handle,
        }
    }

    fn stop(self) -> CoordinatorExit {
        self.shutdown.store(true, Ordering::SeqCst);
        self.handle.join().unwrap().unwrap()
    }
}

#[test]
fn proximity_triggers_once_until_session_end() {
    let agent = Running::start(
        run_proximity,
        config(
            r#"{
                "proximity": {
                    "device": "stub://80,80,40,40,40",
                    "threshold_cm": 50,
                    "hard_lock_secs": 0.3
                }
            }"#,
        ),
    );
    let hub = agent.hub.clone();

    assert!(wait_until(|| count(&hub, "lidarDistance") == 1));
    let first = hub
        .published_events()
        .into_iter()
        .find(|event| event.kind() == "lidarDistance")
        .unwrap();
    assert_eq!(first, LifecycleEvent::ProximityTrigger { distance: 40 });

    // The visitor keeps standing there: no repeat trigger.
    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(count(&hub, "lidarDistance"), 1);

    hub.send(&LifecycleEvent::GoHome).unwrap();
    assert!(wait_until(|| count(&hub, "lidarDistance") == 2));

    assert_eq!(agent.stop(), CoordinatorExit::Shutdown);
}

#[test]
fn proximity_start_event_locks_gate() {
    // Visitor shows up ~400ms in, after the hub has already started a session.
    let far = vec!["200"; 20].join(",");
    let agent = Running::start(
        run_proximity,
        config(&format!(
            r#"{{ "proximity": {{ "device": "stub://{},40,40", "hard_lock_secs": 0.1 }} }}"#,
            far
        )),
    );
    let hub = agent.hub.clone();
    hub.send(&LifecycleEvent::SessionStarted).unwrap();

    std::thread::sleep(Duration::from_millis(1000));
    assert_eq!(count(&hub, "lidarDistance"), 0);

    hub.send(&LifecycleEvent::SessionEnded).unwrap();
    assert!(wait_until(|| count(&hub, "lidarDistance") == 1));
    assert_eq!(agent.stop(), CoordinatorExit::Shutdown);
}

const STILL_CAMERA: &str = r#"
    "camera": { "command": ["stub://still"], "width": 64, "height": 48, "fps": 50 },
    "warmup_frames": 2,
    "enter_grace_ms": 0,
    "stable_ms": 200,
    "sample_interval_ms": 20
"#;

#[test]
fn stillness_reports_once_per_run() {
    let agent = Running::start(
        run_stillness,
        config(&format!(
            r#"{{ "stillness": {{ {}, "fallback_start_secs": 0 }} }}"#,
            STILL_CAMERA
        )),
    );
    let hub = agent.hub.clone();

    // Auto-start acknowledges on connect.
    assert!(wait_until(|| count(&hub, "visionReady") == 1));
    assert!(wait_until(|| count(&hub, "basketStable") == 1));
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(count(&hub, "basketStable"), 1);

    // A repeated start while scanning is acknowledged but does not restart the run.
    hub.send(&LifecycleEvent::Start).unwrap();
    assert!(wait_until(|| count(&hub, "visionReady") == 2));
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(count(&hub, "basketStable"), 1);

    hub.send_raw("garbage");
    hub.send(&LifecycleEvent::SessionEnded).unwrap();
    hub.send(&LifecycleEvent::Start).unwrap();
    assert!(wait_until(|| count(&hub, "basketStable") == 2));

    assert_eq!(agent.stop(), CoordinatorExit::Shutdown);
}

#[test]
fn stillness_fallback_start_without_hub_start() {
    let agent = Running::start(
        run_stillness,
        config(&format!(
            r#"{{
                "exit_on_stop": false,
                "stillness": {{ {}, "auto_start": false, "fallback_start_secs": 0.3 }}
            }}"#,
            STILL_CAMERA
        )),
    );
    let hub = agent.hub.clone();

    assert!(wait_until(|| hub.connects() == 1));
    assert_eq!(count(&hub, "visionReady"), 0);
    assert!(wait_until(|| count(&hub, "basketStable") == 1));

    // stopVision pauses the run without exiting.
    hub.send(&LifecycleEvent::Stop).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert!(!agent.handle.is_finished());
    assert_eq!(agent.stop(), CoordinatorExit::Shutdown);
}

#[test]
fn vision_reports_and_exits_on_stop() {
    let captures = tempfile::tempdir().unwrap();
    let agent = Running::start(
        run_vision,
        config(&format!(
            r#"{{
                "exit_on_stop": true,
                "vision": {{
                    "camera": {{ "command": ["stub://motion"], "width": 64, "height": 48, "fps": 50 }},
                    "detection_threshold": 1,
                    "save_images": true,
                    "capture_dir": "{}"
                }}
            }}"#,
            captures.path().display()
        )),
    );
    let hub = agent.hub.clone();

    assert!(wait_until(|| count(&hub, "visionReady") == 1));
    assert!(wait_until(|| count(&hub, "yoloDetection") >= 1));
    let detection = hub
        .published_events()
        .into_iter()
        .find_map(|event| match event {
            LifecycleEvent::Detection(detection) => Some(detection),
            _ => None,
        })
        .unwrap();
    assert_eq!(detection.label, "motion");
    assert_eq!(detection.counts.get("motion"), Some(&1));
    let img_path = detection.img_path.expect("capture path");
    assert!(img_path.ends_with(".jpg"));
    assert!(wait_until(|| std::path::Path::new(&img_path).exists()));

    hub.send(&LifecycleEvent::Stop).unwrap();
    assert!(wait_until(|| agent.handle.is_finished()));
    let exit = agent.handle.join().unwrap().unwrap();
    assert_eq!(exit, CoordinatorExit::StopRequested);
}

#[test]
fn vision_detections_only_while_scanning() {
    let agent = Running::start(
        run_vision,
        config(
            r#"{
                "vision": {
                    "camera": { "command": ["stub://motion"], "width": 64, "height": 48, "fps": 50 },
                    "auto_start": false,
                    "save_images": false
                }
            }"#,
        ),
    );
    let hub = agent.hub.clone();

    assert!(wait_until(|| hub.connects() == 1));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(count(&hub, "yoloDetection"), 0);

    hub.send(&LifecycleEvent::SessionStarted).unwrap();
    assert!(wait_until(|| count(&hub, "visionReady") == 1));
    assert!(wait_until(|| count(&hub, "yoloDetection") >= 1));

    assert_eq!(agent.stop(), CoordinatorExit::Shutdown);
}
