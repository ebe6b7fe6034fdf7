use std::collections::BTreeMap;

use serde_json::{json, Value};

use kiosk_gate::protocol::{DetectionEvent, HeartbeatEvent, LifecycleEvent};
use kiosk_gate::session::SessionPhase;

fn wire(event: &LifecycleEvent) -> Value {
    serde_json::from_str(&event.to_json().expect("serialize")).expect("valid json")
}

#[test]
fn outbound_messages_match_hub_format() {
    assert_eq!(
        wire(&LifecycleEvent::ProximityTrigger { distance: 42 }),
        json!({ "type": "lidarDistance", "distance": 42 })
    );
    assert_eq!(
        wire(&LifecycleEvent::StillnessStable {
            ts: "2026-05-01T10:00:00.000Z".to_string()
        }),
        json!({ "type": "basketStable", "ts": "2026-05-01T10:00:00.000Z" })
    );

    let mut counts = BTreeMap::new();
    counts.insert("apple".to_string(), 2);
    counts.insert("banana".to_string(), 1);
    let detection = LifecycleEvent::Detection(DetectionEvent {
        label: "apple".to_string(),
        conf: 0.912,
        counts,
        img_path: Some("kiosk_captures/20260501/100000_000_apple_cnt2_conf0.91.jpg".to_string()),
        ts: "2026-05-01T10:00:00.000Z".to_string(),
    });
    assert_eq!(
        wire(&detection),
        json!({
            "type": "yoloDetection",
            "class": "apple",
            "conf": 0.912,
            "counts": { "apple": 2, "banana": 1 },
            "imgPath": "kiosk_captures/20260501/100000_000_apple_cnt2_conf0.91.jpg",
            "ts": "2026-05-01T10:00:00.000Z"
        })
    );
}

#[test]
fn outbound_messages_parse_back() {
    let ts = "2026-05-01T10:00:00.000Z".to_string();
    let mut counts = BTreeMap::new();
    counts.insert("cup".to_string(), 2);
    counts.insert("plate".to_string(), 1);
    let detection = DetectionEvent {
        label: "cup".to_string(),
        conf: 0.457,
        counts,
        img_path: Some("kiosk_captures/20260501/100000_000_cup_cnt2_conf0.46.jpg".to_string()),
        ts: ts.clone(),
    };
    let detection_without_capture = DetectionEvent {
        img_path: None,
        ..detection.clone()
    };

    let outbound = [
        LifecycleEvent::VisionReady { ts: ts.clone() },
        LifecycleEvent::ProximityTrigger { distance: 37 },
        LifecycleEvent::StillnessStable { ts: ts.clone() },
        LifecycleEvent::Detection(detection),
        LifecycleEvent::Detection(detection_without_capture),
        LifecycleEvent::Heartbeat(HeartbeatEvent {
            phase: SessionPhase::Scanning,
            queue_len: 3,
            ready: true,
            had_detection: true,
        }),
    ];
    for event in outbound {
        let text = event.to_json().unwrap();
        assert_eq!(LifecycleEvent::parse(&text), Some(event), "{}", text);
    }
}

#[test]
fn detection_without_capture_omits_img_path() {
    let event = LifecycleEvent::Detection(DetectionEvent {
        label: "cup".to_string(),
        conf: 0.5,
        counts: BTreeMap::from([("cup".to_string(), 1)]),
        img_path: None,
        ts: "2026-05-01T10:00:00.000Z".to_string(),
    });
    assert!(wire(&event).get("imgPath").is_none());
}

#[test]
fn inbound_lifecycle_classes() {
    let cases = [
        (r#"{"type":"startVision"}"#, true, false),
        (r#"{"type":"sessionStarted","sessionId":"abc"}"#, true, false),
        (r#"{"action":"sessionEnded"}"#, false, true),
        (r#"{"type":"goHome"}"#, false, true),
        (r#"{"type":"stopVision"}"#, false, false),
    ];
    for (raw, start, end) in cases {
        let event = LifecycleEvent::parse(raw).expect(raw);
        assert_eq!(event.is_start_class(), start, "{}", raw);
        assert_eq!(event.is_end_class(), end, "{}", raw);
    }
}
