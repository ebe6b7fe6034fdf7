//! Proximity trigger gate.
//!
//! Turns a stream of distance samples into at most one trigger per armed
//! cycle. After a trigger the gate is locked: nothing fires again until the
//! hub ends the session, and never within `hard_lock` of the previous
//! trigger. When the hub has never been heard from, a degraded offline
//! fallback re-arms after the visitor has been away for `away_rearm`.

use std::time::{Duration, Instant};

use crate::config::ProximitySettings;

#[derive(Clone, Debug, PartialEq)]
pub struct ProximityParams {
    pub threshold_cm: u32,
    pub hard_lock: Duration,
    pub away_rearm: Duration,
    pub offline_fallback: bool,
}

impl From<&ProximitySettings> for ProximityParams {
    fn from(settings: &ProximitySettings) -> Self {
        Self {
            threshold_cm: settings.threshold_cm,
            hard_lock: settings.hard_lock,
            away_rearm: settings.away_rearm,
            offline_fallback: settings.offline_fallback,
        }
    }
}

/// Snapshot of the gate; `active` and `armed` are never both true.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateState {
    pub armed: bool,
    pub active: bool,
    pub first_hit: Option<Instant>,
    pub last_far: Option<Instant>,
    pub server_seen: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProximityTrigger {
    pub distance_cm: u32,
    pub at: Instant,
}

pub struct ProximityGate {
    params: ProximityParams,
    state: GateState,
    last_trigger: Option<Instant>,
}

impl ProximityGate {
    pub fn new(params: ProximityParams) -> Self {
        Self {
            params,
            state: GateState {
                armed: true,
                active: false,
                first_hit: None,
                last_far: None,
                server_seen: false,
            },
            last_trigger: None,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state.armed
    }

    pub fn on_sample(&mut self, distance_cm: u32, now: Instant) -> Option<ProximityTrigger> {
        let near = distance_cm <= self.params.threshold_cm;

        if self.state.armed {
            if near && !self.in_hard_lock(now) {
                self.state.armed = false;
                self.state.active = true;
                self.state.first_hit = Some(now);
                self.state.last_far = None;
                self.last_trigger = Some(now);
                log::info!("proximity: visitor at {}cm, triggering", distance_cm);
                return Some(ProximityTrigger {
                    distance_cm,
                    at: now,
                });
            }
            return None;
        }

        if self.params.offline_fallback && !self.state.server_seen {
            if near {
                self.state.last_far = None;
            } else {
                let since = *self.state.last_far.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.params.away_rearm {
                    log::info!("proximity: hub never seen, visitor away; re-arming (offline fallback)");
                    self.rearm();
                }
            }
        }
        None
    }

    /// Any well-formed hub message; disables the offline fallback for good.
    pub fn on_hub_contact(&mut self) {
        self.state.server_seen = true;
    }

    /// Start-class event: lock without triggering.
    pub fn on_session_start(&mut self, now: Instant) {
        self.state.server_seen = true;
        self.state.armed = false;
        self.state.active = true;
        self.state.first_hit.get_or_insert(now);
        self.state.last_far = None;
    }

    /// End-class event: clear the cycle and re-arm.
    pub fn on_session_end(&mut self) {
        self.state.server_seen = true;
        self.rearm();
    }

    fn rearm(&mut self) {
        self.state.armed = true;
        self.state.active = false;
        self.state.first_hit = None;
        self.state.last_far = None;
    }

    fn in_hard_lock(&self, now: Instant) -> bool {
        self.last_trigger
            .is_some_and(|at| now.saturating_duration_since(at) < self.params.hard_lock)
    }
}
