//! Basket stillness detection.
//!
//! Each sampled frame is reduced to a small luma plane (decimate, crop to the
//! central region of interest, 3x3 box blur) and compared with the previous
//! plane by mean absolute difference. Once the difference has stayed at or
//! under the threshold for the stable window, the detector emits once and
//! stays quiet until it is activated again.
//!
//! ```text
//!   Idle --activate--> Warming --n frames--> Unstable <--diff > thr-- CandidateStable
//!                                               |                          |
//!                                               +------diff <= thr-------->+--held >= stable--> Emitted
//! ```

use std::time::{Duration, Instant};

use crate::config::StillnessSettings;
use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq)]
pub struct StillnessParams {
    pub downscale: u32,
    pub roi_ratio: Option<f64>,
    pub blur: bool,
    pub warmup_frames: u32,
    pub enter_grace: Duration,
    pub stable: Duration,
    pub diff_threshold: f64,
    pub stale_gap: Duration,
}

impl From<&StillnessSettings> for StillnessParams {
    fn from(settings: &StillnessSettings) -> Self {
        Self {
            downscale: settings.downscale,
            roi_ratio: settings.roi_ratio,
            blur: settings.blur,
            warmup_frames: settings.warmup_frames,
            enter_grace: settings.enter_grace,
            stable: settings.stable,
            diff_threshold: settings.diff_threshold,
            stale_gap: settings.stale_gap,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StillnessState {
    Idle,
    Warming { seen: u32 },
    Unstable,
    CandidateStable { since: Instant },
    Emitted,
}

/// Inter-frame difference at one sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionSample {
    pub diff: f64,
    pub at: Instant,
    pub in_grace: bool,
}

/// What one `observe` call did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Observation {
    /// Not activated, or already emitted.
    Ignored,
    Warming { seen: u32 },
    /// First frame after a fresh start; nothing to compare against.
    Primed,
    Motion(MotionSample),
    /// The stable window completed on this sample.
    Stable(MotionSample),
}

/// Reduced luma plane used for differencing.
#[derive(Clone, Debug, PartialEq)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

pub struct StillnessDetector {
    params: StillnessParams,
    state: StillnessState,
    entered_at: Option<Instant>,
    prev: Option<Plane>,
    last_sample_at: Option<Instant>,
}

impl StillnessDetector {
    pub fn new(params: StillnessParams) -> Self {
        Self {
            params,
            state: StillnessState::Idle,
            entered_at: None,
            prev: None,
            last_sample_at: None,
        }
    }

    pub fn state(&self) -> StillnessState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, StillnessState::Idle | StillnessState::Emitted)
    }

    pub fn has_emitted(&self) -> bool {
        self.state == StillnessState::Emitted
    }

    /// Start a new detection run (warmup and grace included).
    pub fn activate(&mut self, now: Instant) {
        self.state = StillnessState::Warming { seen: 0 };
        self.entered_at = Some(now);
        self.prev = None;
        self.last_sample_at = None;
    }

    pub fn deactivate(&mut self) {
        self.state = StillnessState::Idle;
        self.entered_at = None;
        self.prev = None;
        self.last_sample_at = None;
    }

    pub fn observe(&mut self, frame: &Frame, now: Instant) -> Observation {
        if !self.is_active() {
            return Observation::Ignored;
        }
        let plane = prepare_plane(frame.luma(), frame.width as usize, frame.height as usize, &self.params);
        self.observe_plane(plane, now)
    }

    pub fn observe_plane(&mut self, plane: Plane, now: Instant) -> Observation {
        if !self.is_active() {
            return Observation::Ignored;
        }

        if let Some(last) = self.last_sample_at {
            if now.saturating_duration_since(last) > self.params.stale_gap {
                log::debug!("stillness: sample gap exceeded stale bound, restarting comparison");
                self.prev = None;
                if matches!(self.state, StillnessState::CandidateStable { .. }) {
                    self.state = StillnessState::Unstable;
                }
            }
        }
        self.last_sample_at = Some(now);

        if let StillnessState::Warming { seen } = self.state {
            if seen < self.params.warmup_frames {
                let seen = seen + 1;
                self.prev = Some(plane);
                self.state = if seen >= self.params.warmup_frames {
                    StillnessState::Unstable
                } else {
                    StillnessState::Warming { seen }
                };
                return Observation::Warming { seen };
            }
            self.state = StillnessState::Unstable;
        }

        let Some(prev) = self.prev.replace(plane) else {
            return Observation::Primed;
        };
        let Some(diff) = self
            .prev
            .as_ref()
            .and_then(|current| mean_abs_diff(current, &prev))
        else {
            return Observation::Primed;
        };

        let in_grace = self
            .entered_at
            .is_some_and(|entered| now.saturating_duration_since(entered) < self.params.enter_grace);
        let sample = MotionSample {
            diff,
            at: now,
            in_grace,
        };

        if in_grace || diff > self.params.diff_threshold {
            if matches!(self.state, StillnessState::CandidateStable { .. }) {
                log::debug!("stillness: candidate reset (diff {:.1})", diff);
            }
            self.state = StillnessState::Unstable;
            return Observation::Motion(sample);
        }

        match self.state {
            StillnessState::CandidateStable { since } => {
                if now.saturating_duration_since(since) >= self.params.stable {
                    self.state = StillnessState::Emitted;
                    Observation::Stable(sample)
                } else {
                    Observation::Motion(sample)
                }
            }
            _ => {
                log::debug!("stillness: candidate start (diff {:.1})", diff);
                self.state = StillnessState::CandidateStable { since: now };
                if self.params.stable.is_zero() {
                    self.state = StillnessState::Emitted;
                    return Observation::Stable(sample);
                }
                Observation::Motion(sample)
            }
        }
    }
}

/// Decimate, crop and blur a luma plane.
pub fn prepare_plane(luma: &[u8], width: usize, height: usize, params: &StillnessParams) -> Plane {
    let step = params.downscale.max(1) as usize;
    let dw = width.div_ceil(step);
    let dh = height.div_ceil(step);
    let mut data = Vec::with_capacity(dw * dh);
    for y in (0..height).step_by(step) {
        let row = &luma[y * width..(y + 1) * width];
        data.extend(row.iter().step_by(step).map(|&v| v as f32));
    }
    let mut plane = Plane {
        width: dw,
        height: dh,
        data,
    };

    if let Some(ratio) = params.roi_ratio {
        plane = crop_center(&plane, ratio);
    }
    if params.blur && plane.width >= 3 && plane.height >= 3 {
        plane = box_blur3(&plane);
    }
    plane
}

fn crop_center(plane: &Plane, ratio: f64) -> Plane {
    let rx = (plane.width as f64 * (1.0 - ratio) / 2.0) as usize;
    let ry = (plane.height as f64 * (1.0 - ratio) / 2.0) as usize;
    let width = plane.width.saturating_sub(2 * rx);
    let height = plane.height.saturating_sub(2 * ry);
    let mut data = Vec::with_capacity(width * height);
    for y in ry..ry + height {
        let start = y * plane.width + rx;
        data.extend_from_slice(&plane.data[start..start + width]);
    }
    Plane {
        width,
        height,
        data,
    }
}

/// 3x3 mean over the valid window (output shrinks by two in each dimension).
fn box_blur3(plane: &Plane) -> Plane {
    let width = plane.width - 2;
    let height = plane.height - 2;
    let mut data = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0f32;
            for dy in 0..3 {
                let row = (y + dy) * plane.width + x;
                sum += plane.data[row] + plane.data[row + 1] + plane.data[row + 2];
            }
            data.push(sum / 9.0);
        }
    }
    Plane {
        width,
        height,
        data,
    }
}

/// Mean absolute difference, or `None` when the planes are not comparable.
pub fn mean_abs_diff(a: &Plane, b: &Plane) -> Option<f64> {
    if a.width != b.width || a.height != b.height || a.data.is_empty() {
        return None;
    }
    let total: f64 = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(x, y)| (x - y).abs() as f64)
        .sum();
    Some(total / a.data.len() as f64)
}
