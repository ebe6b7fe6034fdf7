use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use kiosk_gate::config::KioskConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "KIOSK_CONFIG",
        "KIOSK_HUB_ADDR",
        "KIOSK_HUB_PREFIX",
        "KIOSK_ALLOW_REMOTE",
        "KIOSK_CAMERA_CMD",
        "KIOSK_CAPTURE_DIR",
        "LIDAR_PORT",
        "LIDAR_BAUD",
        "LIDAR_THRESH_CM",
        "LIDAR_ACTIVE_LOCK",
        "LIDAR_AWAY_REARM",
        "LIDAR_OFFLINE_FALLBACK",
        "DIFF_THRESHOLD",
        "STABLE_MS",
        "WARMUP_FRAMES",
        "ENTER_GRACE_MS",
        "CONF_THRESHOLD",
        "IOU_THRESHOLD",
        "DETECTION_THRESHOLD",
        "HB_PERIOD_S",
    ] {
        std::env::remove_var(key);
    }
}

fn temp_config(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, body.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".json",
        r#"{
            "ring_depth": 4,
            "exit_on_stop": false,
            "hub": { "addr": "mqtt://localhost:1884", "topic_prefix": "shop/kiosk1" },
            "proximity": { "threshold_cm": 60, "hard_lock_secs": 10 },
            "stillness": {
                "camera": { "command": ["stub://still"], "width": 160, "height": 120 },
                "stable_ms": 1500,
                "use_roi": false
            },
            "vision": { "detection_threshold": 3, "save_images": false }
        }"#,
    );

    std::env::set_var("KIOSK_CONFIG", file.path());
    std::env::set_var("LIDAR_THRESH_CM", "45");
    std::env::set_var("STABLE_MS", "900");
    std::env::set_var("HB_PERIOD_S", "2.5");

    let cfg = KioskConfig::load().expect("load config");

    assert_eq!(cfg.ring_depth, 4);
    assert!(!cfg.exit_on_stop);
    assert_eq!(cfg.hub.addr, "mqtt://localhost:1884");
    assert_eq!(cfg.hub.topic_prefix, "shop/kiosk1");
    assert_eq!(cfg.proximity.threshold_cm, 45);
    assert_eq!(cfg.proximity.hard_lock, Duration::from_secs(10));
    assert_eq!(cfg.stillness.camera.command, vec!["stub://still"]);
    assert_eq!(cfg.stillness.camera.width, 160);
    assert_eq!(cfg.stillness.stable, Duration::from_millis(900));
    assert_eq!(cfg.stillness.roi_ratio, None);
    assert_eq!(cfg.vision.detection_threshold, 3);
    assert!(!cfg.vision.capture.enabled);
    assert_eq!(cfg.heartbeat.period, Duration::from_millis(2500));

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".toml",
        r#"
ring_depth = 2

[hub]
addr = "127.0.0.1:1883"
client_id = "kiosk-7-vision"

[vision]
backend = "stub"
conf_threshold = 0.3
capture_dir = "/var/lib/kiosk/captures"

[heartbeat]
publish = true
"#,
    );

    let cfg = KioskConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.ring_depth, 2);
    assert_eq!(cfg.hub.client_id.as_deref(), Some("kiosk-7-vision"));
    assert_eq!(cfg.vision.conf_threshold, 0.3);
    assert_eq!(
        cfg.vision.capture.dir,
        PathBuf::from("/var/lib/kiosk/captures")
    );
    assert!(cfg.heartbeat.publish);

    clear_env();
}

#[test]
fn camera_command_env_applies_to_both_cameras() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("KIOSK_CAMERA_CMD", "stub://motion");
    std::env::set_var("KIOSK_CAPTURE_DIR", "/tmp/caps");
    std::env::set_var("LIDAR_PORT", "stub://80,40");
    std::env::set_var("LIDAR_OFFLINE_FALLBACK", "0");

    let cfg = KioskConfig::load_from(None).expect("load env config");
    assert_eq!(cfg.stillness.camera.command, vec!["stub://motion"]);
    assert_eq!(cfg.vision.camera.command, vec!["stub://motion"]);
    assert_eq!(cfg.vision.capture.dir, PathBuf::from("/tmp/caps"));
    assert_eq!(cfg.proximity.device, PathBuf::from("stub://80,40"));
    assert!(!cfg.proximity.offline_fallback);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CONF_THRESHOLD", "1.5");
    assert!(KioskConfig::load_from(None).is_err());
    clear_env();

    std::env::set_var("LIDAR_BAUD", "fast");
    assert!(KioskConfig::load_from(None).is_err());
    clear_env();

    let zero_ring = temp_config(".json", r#"{ "ring_depth": 0 }"#);
    assert!(KioskConfig::load_from(Some(zero_ring.path())).is_err());

    let odd_camera = temp_config(".json", r#"{ "vision": { "camera": { "width": 641 } } }"#);
    assert!(KioskConfig::load_from(Some(odd_camera.path())).is_err());

    let broken = temp_config(".json", "{ not json");
    assert!(KioskConfig::load_from(Some(broken.path())).is_err());

    clear_env();
}
