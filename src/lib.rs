//! Kiosk activation gating.
//!
//! Three independent agents decide when an unattended kiosk should wake up
//! and what it is looking at:
//!
//! - `proximity_agent`: a TF-Luna distance sensor fires one trigger per
//!   visitor (`lidarDistance`).
//! - `stillness_agent`: a camera watches the basket and reports once the
//!   scene has settled (`basketStable`).
//! - `vision_agent`: a camera plus classifier reports stable object
//!   signatures (`yoloDetection`).
//!
//! All three talk to a central hub over one persistent channel and share the
//! same session protocol: the hub starts and ends runs, the agents only report.
//!
//! # Module Structure
//!
//! - `frame`: frames and the drop-oldest `FrameRingBuffer`
//! - `ingest`: raw-video producer process and synthetic camera
//! - `stillness`, `stabilizer`, `proximity`: the three debounce algorithms
//! - `detect`: classifier seam and backends
//! - `sensor`: TF-Luna serial decoding
//! - `protocol`, `session`, `channel`: hub messages, phase coordination, transport
//! - `runtime`: per-agent thread wiring used by the binaries

pub mod capture;
pub mod channel;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod protocol;
pub mod proximity;
pub mod retry;
pub mod runtime;
pub mod sensor;
pub mod session;
pub mod stabilizer;
pub mod stillness;
pub mod ui;

pub use channel::{ChannelHandle, EventChannel, HubTransport, MemoryHub, MemoryTransport};
pub use config::KioskConfig;
pub use detect::{Classifier, Detection, DetectionSet, DetectionSignature};
pub use frame::{Frame, FrameRingBuffer, PixelLayout};
pub use protocol::{DetectionEvent, HeartbeatEvent, LifecycleEvent};
pub use proximity::{ProximityGate, ProximityParams};
pub use session::{
    AgentInput, AgentStatus, CoordinatorExit, CoordinatorOptions, Directive, GateCommand,
    LocalEvent, SessionCoordinator, SessionPhase,
};
pub use stabilizer::{DetectionStabilizer, StabilizerParams, StableDetection};
pub use stillness::{StillnessDetector, StillnessParams, StillnessState};
