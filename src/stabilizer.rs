//! Detection signature stabilization.
//!
//! Classifier output flickers from frame to frame. A detection is only
//! reported once the same label/count signature has been seen on
//! `detection_threshold` consecutive non-empty ticks, and a signature is
//! reported at most once until a different one has been reported.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::VisionSettings;
use crate::detect::{Detection, DetectionSet, DetectionSignature};
use crate::protocol::DetectionEvent;

#[derive(Clone, Debug, PartialEq)]
pub struct StabilizerParams {
    pub confidence_floor: f32,
    pub detection_threshold: u32,
    pub stale_gap: Duration,
}

impl From<&VisionSettings> for StabilizerParams {
    fn from(settings: &VisionSettings) -> Self {
        Self {
            confidence_floor: settings.conf_threshold,
            detection_threshold: settings.detection_threshold,
            stale_gap: settings.stale_gap,
        }
    }
}

/// A signature that just became stable.
#[derive(Clone, Debug, PartialEq)]
pub struct StableDetection {
    pub label: String,
    pub confidence: f32,
    pub count: u32,
    pub counts: BTreeMap<String, u32>,
    pub signature: DetectionSignature,
}

impl StableDetection {
    pub fn to_event(&self, img_path: Option<String>, ts: String) -> DetectionEvent {
        DetectionEvent {
            label: self.label.clone(),
            conf: (self.confidence as f64 * 1000.0).round() / 1000.0,
            counts: self.counts.clone(),
            img_path,
            ts,
        }
    }
}

pub struct DetectionStabilizer {
    params: StabilizerParams,
    last_signature: Option<DetectionSignature>,
    streak: u32,
    last_sent: Option<DetectionSignature>,
    last_tick_at: Option<Instant>,
}

impl DetectionStabilizer {
    pub fn new(params: StabilizerParams) -> Self {
        Self {
            params,
            last_signature: None,
            streak: 0,
            last_sent: None,
            last_tick_at: None,
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn last_sent(&self) -> Option<&DetectionSignature> {
        self.last_sent.as_ref()
    }

    /// Forget everything, including the last reported signature.
    pub fn reset(&mut self) {
        self.last_signature = None;
        self.streak = 0;
        self.last_sent = None;
        self.last_tick_at = None;
    }

    /// Feed one tick of classifier output.
    pub fn tick(&mut self, detections: &[Detection], now: Instant) -> Option<StableDetection> {
        let set = DetectionSet::from_detections(detections, self.params.confidence_floor);
        if set.is_empty() {
            self.last_signature = None;
            self.streak = 0;
            return None;
        }

        let signature = set.signature();
        if let Some(last) = self.last_tick_at {
            if now.saturating_duration_since(last) > self.params.stale_gap {
                self.last_signature = None;
                self.streak = 0;
            }
        }
        self.last_tick_at = Some(now);

        if self.last_signature.as_ref() == Some(&signature) {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.last_signature = Some(signature.clone());
            self.streak = 1;
        }
        log::debug!("stabilizer: {} streak={}", signature, self.streak);

        if self.streak < self.params.detection_threshold {
            return None;
        }
        if self.last_sent.as_ref() == Some(&signature) {
            return None;
        }

        let (label, stats) = set.representative()?;
        let stable = StableDetection {
            label: label.to_string(),
            confidence: stats.max_confidence,
            count: stats.count,
            counts: set.counts(),
            signature: signature.clone(),
        };
        self.last_sent = Some(signature);
        Some(stable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stabilizer(threshold: u32) -> DetectionStabilizer {
        DetectionStabilizer::new(StabilizerParams {
            confidence_floor: 0.15,
            detection_threshold: threshold,
            stale_gap: Duration::from_millis(1200),
        })
    }

    fn cat() -> Vec<Detection> {
        vec![Detection::new("cat", 0.8)]
    }

    fn at(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn third_identical_tick_emits_once() {
        let t0 = Instant::now();
        let mut stab = stabilizer(3);
        assert!(stab.tick(&cat(), at(t0, 0)).is_none());
        assert!(stab.tick(&cat(), at(t0, 100)).is_none());
        let event = stab.tick(&cat(), at(t0, 200)).expect("stable on third tick");
        assert_eq!(event.label, "cat");
        assert_eq!(event.counts.get("cat"), Some(&1));
        assert!(stab.tick(&cat(), at(t0, 300)).is_none());
        for i in 4..50 {
            assert!(stab.tick(&cat(), at(t0, i * 100)).is_none());
        }
    }

    #[test]
    fn empty_tick_breaks_streak_but_not_dedup() {
        let t0 = Instant::now();
        let mut stab = stabilizer(2);
        stab.tick(&cat(), at(t0, 0));
        assert!(stab.tick(&[], at(t0, 50)).is_none());
        assert_eq!(stab.streak(), 0);
        assert!(stab.tick(&cat(), at(t0, 100)).is_none());
        assert!(stab.tick(&cat(), at(t0, 150)).is_some());
        // Object leaves and comes back with the same signature: still deduplicated.
        stab.tick(&[], at(t0, 200));
        stab.tick(&cat(), at(t0, 250));
        assert!(stab.tick(&cat(), at(t0, 300)).is_none());
    }

    #[test]
    fn stale_gap_restarts_streak() {
        let t0 = Instant::now();
        let mut stab = stabilizer(2);
        stab.tick(&cat(), at(t0, 0));
        assert!(stab.tick(&cat(), at(t0, 1300)).is_none());
        assert_eq!(stab.streak(), 1);
        assert!(stab.tick(&cat(), at(t0, 1400)).is_some());
    }

    #[test]
    fn new_signature_emits_again_and_old_one_can_return() {
        let t0 = Instant::now();
        let mut stab = stabilizer(1);
        assert!(stab.tick(&cat(), at(t0, 0)).is_some());
        let two_cats = vec![Detection::new("cat", 0.7), Detection::new("cat", 0.9)];
        let event = stab.tick(&two_cats, at(t0, 50)).expect("count changed");
        assert_eq!(event.count, 2);
        assert_eq!(event.confidence, 0.9);
        assert!(stab.tick(&cat(), at(t0, 100)).is_some());
    }

    #[test]
    fn low_confidence_only_counts_as_empty() {
        let t0 = Instant::now();
        let mut stab = stabilizer(1);
        assert!(stab.tick(&[Detection::new("cat", 0.1)], t0).is_none());
        assert_eq!(stab.streak(), 0);
    }

    #[test]
    fn reset_allows_same_signature_again() {
        let t0 = Instant::now();
        let mut stab = stabilizer(1);
        assert!(stab.tick(&cat(), t0).is_some());
        stab.reset();
        assert!(stab.tick(&cat(), at(t0, 10)).is_some());
    }

    #[test]
    fn event_confidence_is_rounded() {
        let t0 = Instant::now();
        let mut stab = stabilizer(1);
        let stable = stab.tick(&[Detection::new("cup", 0.456789)], t0).unwrap();
        let event = stable.to_event(None, "ts".to_string());
        assert_eq!(event.conf, 0.457);
        assert_eq!(event.label, "cup");
    }
}
