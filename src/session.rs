//! Session coordination.
//!
//! `SessionCoordinator` owns the single authoritative `SessionPhase` for an
//! agent. It never performs I/O itself: every input returns a list of
//! `Directive`s (publish to the hub, command the local components, exit), and
//! `run_coordinator` is the actor loop that feeds it and carries them out.
//!
//! Phase changes only on inbound lifecycle events (or the self-start paths
//! configured in `CoordinatorOptions`). Local component events are forwarded
//! to the hub without changing phase.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use crate::channel::ChannelHandle;
use crate::protocol::{DetectionEvent, HeartbeatEvent, LifecycleEvent};

const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Waiting,
    Scanning,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Waiting => write!(f, "waiting"),
            SessionPhase::Scanning => write!(f, "scanning"),
        }
    }
}

/// Commands broadcast to the component threads. Each component acts on the
/// ones it cares about and ignores the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateCommand {
    /// Waiting -> Scanning: begin a fresh detection run.
    Activate,
    /// Scanning -> Waiting: stop detecting.
    Deactivate,
    /// Start-class event from the hub: lock the proximity gate.
    SessionStart,
    /// End-class event from the hub: clear transient state and re-arm.
    SessionEnd,
    /// The hub has been heard from.
    HubContact,
}

/// Events raised by the local components.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalEvent {
    ProximityTrigger { distance_cm: u32 },
    StillnessStable { at: DateTime<Utc> },
    Detection(DetectionEvent),
}

#[derive(Clone, Debug, PartialEq)]
pub enum HubEvent {
    Connected,
    Disconnected,
    Message(LifecycleEvent),
}

/// Everything the coordinator actor consumes.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentInput {
    Hub(HubEvent),
    Local(LocalEvent),
    Shutdown,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Directive {
    Publish(LifecycleEvent),
    Command(GateCommand),
    Exit,
}

/// Live numbers for the heartbeat line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AgentStatus {
    pub queue_len: usize,
    pub ready: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatorOptions {
    /// Reply `visionReady` on connect (with auto-start) and on Start-class events.
    pub acknowledge_start: bool,
    /// Enter Scanning as soon as the hub connection comes up.
    pub auto_start: bool,
    /// Exit the agent on `stopVision`.
    pub exit_on_stop: bool,
    /// Self-start a run when no Start-class event arrives within this window
    /// after connecting or after a session end.
    pub fallback_start: Option<Duration>,
    pub heartbeat_period: Duration,
    pub publish_heartbeat: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            acknowledge_start: false,
            auto_start: false,
            exit_on_stop: false,
            fallback_start: None,
            heartbeat_period: Duration::from_secs(1),
            publish_heartbeat: false,
        }
    }
}

pub struct SessionCoordinator {
    options: CoordinatorOptions,
    phase: SessionPhase,
    connected: bool,
    had_detection: bool,
    fallback_deadline: Option<Instant>,
    next_heartbeat: Option<Instant>,
}

impl SessionCoordinator {
    pub fn new(options: CoordinatorOptions) -> Self {
        Self {
            options,
            phase: SessionPhase::Waiting,
            connected: false,
            had_detection: false,
            fallback_deadline: None,
            next_heartbeat: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn on_connected(&mut self, now: Instant) -> Vec<Directive> {
        self.connected = true;
        let mut out = Vec::new();
        if self.options.auto_start {
            if self.phase == SessionPhase::Waiting {
                log::info!("session: hub connected, auto-starting");
                self.enter_scanning(&mut out);
            }
            if self.options.acknowledge_start {
                out.push(Directive::Publish(LifecycleEvent::vision_ready(Utc::now())));
            }
        }
        if self.phase == SessionPhase::Waiting {
            self.arm_fallback(now);
        }
        out
    }

    pub fn on_disconnected(&mut self) -> Vec<Directive> {
        self.connected = false;
        Vec::new()
    }

    pub fn on_inbound(&mut self, event: LifecycleEvent, now: Instant) -> Vec<Directive> {
        let mut out = vec![Directive::Command(GateCommand::HubContact)];
        match event {
            LifecycleEvent::Start | LifecycleEvent::SessionStarted => {
                self.fallback_deadline = None;
                out.push(Directive::Command(GateCommand::SessionStart));
                if self.phase == SessionPhase::Waiting {
                    log::info!("session: {} received, scanning", event.kind());
                    self.enter_scanning(&mut out);
                } else {
                    log::info!("session: {} while scanning, acknowledging only", event.kind());
                }
                if self.options.acknowledge_start {
                    out.push(Directive::Publish(LifecycleEvent::vision_ready(Utc::now())));
                }
            }
            LifecycleEvent::Stop => {
                if self.phase == SessionPhase::Scanning {
                    log::info!("session: stopVision, back to waiting");
                    self.phase = SessionPhase::Waiting;
                    out.push(Directive::Command(GateCommand::Deactivate));
                } else {
                    log::info!("session: stopVision ignored (not scanning)");
                }
                if self.options.exit_on_stop {
                    out.push(Directive::Exit);
                }
            }
            LifecycleEvent::SessionEnded | LifecycleEvent::GoHome => {
                log::info!("session: {} received, waiting for next visitor", event.kind());
                if self.phase == SessionPhase::Scanning {
                    self.phase = SessionPhase::Waiting;
                    out.push(Directive::Command(GateCommand::Deactivate));
                }
                out.push(Directive::Command(GateCommand::SessionEnd));
                self.had_detection = false;
                self.arm_fallback(now);
            }
            LifecycleEvent::Unknown(kind) => {
                log::debug!("session: ignoring hub message '{}'", kind);
            }
            other => {
                log::debug!("session: ignoring inbound {}", other.kind());
            }
        }
        out
    }

    pub fn on_local(&mut self, event: LocalEvent) -> Vec<Directive> {
        match event {
            LocalEvent::ProximityTrigger { distance_cm } => {
                vec![Directive::Publish(LifecycleEvent::ProximityTrigger {
                    distance: distance_cm,
                })]
            }
            LocalEvent::StillnessStable { at } => {
                if self.phase != SessionPhase::Scanning {
                    log::debug!("session: dropping stillness result raised after stop");
                    return Vec::new();
                }
                log::info!("session: basket stable");
                vec![Directive::Publish(LifecycleEvent::stillness_stable(at))]
            }
            LocalEvent::Detection(detection) => {
                if self.phase != SessionPhase::Scanning {
                    log::debug!("session: dropping detection raised after stop");
                    return Vec::new();
                }
                log::info!(
                    "session: detection {} conf={:.3} counts={:?}",
                    detection.label,
                    detection.conf,
                    detection.counts
                );
                self.had_detection = true;
                vec![Directive::Publish(LifecycleEvent::Detection(detection))]
            }
        }
    }

    /// Timers: fallback self-start and heartbeat.
    pub fn on_tick(&mut self, now: Instant, status: AgentStatus) -> Vec<Directive> {
        let mut out = Vec::new();

        if let Some(deadline) = self.fallback_deadline {
            if now >= deadline {
                self.fallback_deadline = None;
                if self.phase == SessionPhase::Waiting {
                    log::info!("session: no start from hub within fallback window, self-starting");
                    self.enter_scanning(&mut out);
                }
            }
        }

        let due = *self.next_heartbeat.get_or_insert(now);
        if now >= due {
            let period = self.options.heartbeat_period;
            let next = due + period;
            self.next_heartbeat = Some(if next <= now { now + period } else { next });
            log::info!(
                "heartbeat phase={} queue_len={} ready={} had_detection={}",
                self.phase,
                status.queue_len,
                status.ready,
                self.had_detection
            );
            if self.options.publish_heartbeat {
                out.push(Directive::Publish(LifecycleEvent::Heartbeat(HeartbeatEvent {
                    phase: self.phase,
                    queue_len: status.queue_len,
                    ready: status.ready,
                    had_detection: self.had_detection,
                })));
            }
        }
        out
    }

    /// Earliest instant a timer in `on_tick` needs to run.
    pub fn next_deadline(&self, now: Instant) -> Instant {
        let heartbeat = self.next_heartbeat.unwrap_or(now);
        match self.fallback_deadline {
            Some(fallback) => fallback.min(heartbeat),
            None => heartbeat,
        }
    }

    fn enter_scanning(&mut self, out: &mut Vec<Directive>) {
        self.phase = SessionPhase::Scanning;
        self.fallback_deadline = None;
        out.push(Directive::Command(GateCommand::Activate));
    }

    fn arm_fallback(&mut self, now: Instant) {
        if let Some(window) = self.options.fallback_start {
            self.fallback_deadline = Some(now + window);
        }
    }
}

/// Why the coordinator loop returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorExit {
    Shutdown,
    StopRequested,
}

/// Actor loop: feed inputs and timers to the coordinator and carry out its
/// directives. Commands go to every component channel; a closed channel is
/// skipped.
pub fn run_coordinator(
    mut coordinator: SessionCoordinator,
    inputs: Receiver<AgentInput>,
    outbound: ChannelHandle,
    commands: Vec<Sender<GateCommand>>,
    status: impl Fn() -> AgentStatus,
    shutdown: &AtomicBool,
) -> Result<CoordinatorExit> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(CoordinatorExit::Shutdown);
        }
        let now = Instant::now();
        let wait = coordinator
            .next_deadline(now)
            .saturating_duration_since(now)
            .min(IDLE_POLL);

        let mut directives = match inputs.recv_timeout(wait) {
            Ok(AgentInput::Hub(HubEvent::Connected)) => coordinator.on_connected(Instant::now()),
            Ok(AgentInput::Hub(HubEvent::Disconnected)) => coordinator.on_disconnected(),
            Ok(AgentInput::Hub(HubEvent::Message(event))) => {
                coordinator.on_inbound(event, Instant::now())
            }
            Ok(AgentInput::Local(event)) => coordinator.on_local(event),
            Ok(AgentInput::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                return Ok(CoordinatorExit::Shutdown)
            }
            Err(RecvTimeoutError::Timeout) => Vec::new(),
        };
        directives.extend(coordinator.on_tick(Instant::now(), status()));

        for directive in directives {
            match directive {
                Directive::Publish(event) => {
                    if let Err(e) = outbound.publish(&event) {
                        log::warn!("failed to publish {}: {:#}", event.kind(), e);
                    }
                }
                Directive::Command(command) => {
                    for tx in &commands {
                        let _ = tx.send(command);
                    }
                }
                Directive::Exit => {
                    log::info!("session: stop-and-exit requested");
                    return Ok(CoordinatorExit::StopRequested);
                }
            }
        }
    }
}
