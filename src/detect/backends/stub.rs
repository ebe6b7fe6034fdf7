use anyhow::Result;
use std::collections::VecDeque;

use crate::detect::backend::Classifier;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub classifier.
///
/// Scripted mode replays fixed per-tick outputs (the last entry repeats once
/// the script runs out). Otherwise it reports a single `motion` box whenever
/// the frame's luma signature changed since the previous call.
pub struct StubBackend {
    script: Option<VecDeque<Vec<Detection>>>,
    last: Vec<Detection>,
    last_signature: Option<u64>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            script: None,
            last: Vec::new(),
            last_signature: None,
        }
    }

    pub fn scripted(ticks: Vec<Vec<Detection>>) -> Self {
        Self {
            script: Some(ticks.into()),
            last: Vec::new(),
            last_signature: None,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        if let Some(script) = self.script.as_mut() {
            if let Some(next) = script.pop_front() {
                self.last = next;
            }
            return Ok(self.last.clone());
        }

        // Coarse signature: sum of luma in 16-level buckets, so sensor noise
        // does not count as a change.
        let signature = frame
            .luma()
            .iter()
            .fold(0u64, |acc, &v| acc.wrapping_add((v >> 4) as u64));
        let changed = self
            .last_signature
            .is_some_and(|previous| previous != signature);
        self.last_signature = Some(signature);

        if changed {
            Ok(vec![Detection::new("motion", 0.85)])
        } else {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn frame(value: u8) -> Frame {
        Frame::from_luma(vec![value; 64], 8, 8, 0, Instant::now()).unwrap()
    }

    #[test]
    fn script_replays_then_repeats_last() {
        let mut stub = StubBackend::scripted(vec![
            vec![],
            vec![Detection::new("cat", 0.9)],
        ]);
        assert!(stub.classify(&frame(0)).unwrap().is_empty());
        assert_eq!(stub.classify(&frame(0)).unwrap()[0].label, "cat");
        assert_eq!(stub.classify(&frame(0)).unwrap()[0].label, "cat");
    }

    #[test]
    fn unscripted_reports_scene_changes() {
        let mut stub = StubBackend::new();
        assert!(stub.classify(&frame(10)).unwrap().is_empty());
        assert!(stub.classify(&frame(11)).unwrap().is_empty());
        assert_eq!(stub.classify(&frame(200)).unwrap()[0].label, "motion");
    }
}
