//! Hub wire protocol.
//!
//! Every message is a flat JSON object discriminated by `type`. The hub also
//! mirrors the kind into `action` on some messages, so inbound parsing reads
//! `type` first and falls back to `action`.
//!
//! Inbound (hub -> agent): `startVision`, `sessionStarted`, `stopVision`,
//! `sessionEnded`, `goHome`.
//! Outbound (agent -> hub): `visionReady`, `lidarDistance`, `basketStable`,
//! `yoloDetection`, `heartbeat`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::session::SessionPhase;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    #[serde(rename = "startVision")]
    Start,
    /// Mid-sequence stop; not a session end.
    #[serde(rename = "stopVision")]
    Stop,
    #[serde(rename = "sessionStarted")]
    SessionStarted,
    #[serde(rename = "sessionEnded")]
    SessionEnded,
    #[serde(rename = "goHome")]
    GoHome,
    #[serde(rename = "visionReady")]
    VisionReady { ts: String },
    #[serde(rename = "lidarDistance")]
    ProximityTrigger { distance: u32 },
    #[serde(rename = "basketStable")]
    StillnessStable { ts: String },
    #[serde(rename = "yoloDetection")]
    Detection(DetectionEvent),
    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatEvent),
    /// Well-formed message of a kind this agent does not handle.
    #[serde(skip)]
    Unknown(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    /// Representative label.
    #[serde(rename = "class")]
    pub label: String,
    pub conf: f64,
    pub counts: BTreeMap<String, u32>,
    #[serde(rename = "imgPath", default, skip_serializing_if = "Option::is_none")]
    pub img_path: Option<String>,
    pub ts: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub phase: SessionPhase,
    #[serde(rename = "queueLen")]
    pub queue_len: usize,
    pub ready: bool,
    #[serde(rename = "hadDetection")]
    pub had_detection: bool,
}

impl LifecycleEvent {
    /// Parse an inbound message.
    ///
    /// Returns `None` for anything malformed: not JSON, not an object, no
    /// string kind, or a known kind with a bad payload. A well-formed message
    /// of an unrecognized kind becomes `Unknown`.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let mut object = match value {
            Value::Object(object) => object,
            _ => return None,
        };
        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .or_else(|| object.get("action").and_then(Value::as_str))?
            .to_string();

        match kind.as_str() {
            "startVision" => Some(Self::Start),
            "stopVision" => Some(Self::Stop),
            "sessionStarted" => Some(Self::SessionStarted),
            "sessionEnded" => Some(Self::SessionEnded),
            "goHome" => Some(Self::GoHome),
            "visionReady" | "lidarDistance" | "basketStable" | "yoloDetection" | "heartbeat" => {
                object.insert("type".to_string(), Value::String(kind));
                serde_json::from_value(Value::Object(object)).ok()
            }
            _ => Some(Self::Unknown(kind)),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        if let Self::Unknown(kind) = self {
            return Err(anyhow!("refusing to serialize unknown event kind '{}'", kind));
        }
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of this event.
    pub fn kind(&self) -> &str {
        match self {
            Self::Start => "startVision",
            Self::Stop => "stopVision",
            Self::SessionStarted => "sessionStarted",
            Self::SessionEnded => "sessionEnded",
            Self::GoHome => "goHome",
            Self::VisionReady { .. } => "visionReady",
            Self::ProximityTrigger { .. } => "lidarDistance",
            Self::StillnessStable { .. } => "basketStable",
            Self::Detection(_) => "yoloDetection",
            Self::Heartbeat(_) => "heartbeat",
            Self::Unknown(kind) => kind,
        }
    }

    pub fn is_start_class(&self) -> bool {
        matches!(self, Self::Start | Self::SessionStarted)
    }

    pub fn is_end_class(&self) -> bool {
        matches!(self, Self::SessionEnded | Self::GoHome)
    }

    pub fn vision_ready(at: DateTime<Utc>) -> Self {
        Self::VisionReady {
            ts: wire_timestamp(at),
        }
    }

    pub fn stillness_stable(at: DateTime<Utc>) -> Self {
        Self::StillnessStable {
            ts: wire_timestamp(at),
        }
    }
}

/// RFC 3339, UTC, millisecond precision.
pub fn wire_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    wire_timestamp(Utc::now())
}
