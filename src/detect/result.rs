use std::collections::BTreeMap;

/// Axis-aligned box in normalized (0..1) frame coordinates, top-left origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamp into the unit square.
    pub fn clamped(&self) -> BoundingBox {
        let x = self.x.clamp(0.0, 1.0);
        let y = self.y.clamp(0.0, 1.0);
        BoundingBox {
            x,
            y,
            w: (self.x + self.w).clamp(0.0, 1.0) - x,
            h: (self.y + self.h).clamp(0.0, 1.0) - y,
        }
    }
}

/// One labeled box from the classifier.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox: None,
        }
    }

    pub fn with_box(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LabelStats {
    pub count: u32,
    pub max_confidence: f32,
}

/// Per-label count and max confidence for one tick, after the confidence floor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionSet {
    labels: BTreeMap<String, LabelStats>,
}

impl DetectionSet {
    pub fn from_detections(detections: &[Detection], confidence_floor: f32) -> Self {
        let mut labels: BTreeMap<String, LabelStats> = BTreeMap::new();
        for det in detections {
            if det.confidence.is_nan() || det.confidence < confidence_floor {
                continue;
            }
            let stats = labels.entry(det.label.clone()).or_insert(LabelStats {
                count: 0,
                max_confidence: 0.0,
            });
            stats.count += 1;
            stats.max_confidence = stats.max_confidence.max(det.confidence);
        }
        Self { labels }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&LabelStats> {
        self.labels.get(label)
    }

    pub fn signature(&self) -> DetectionSignature {
        DetectionSignature(
            self.labels
                .iter()
                .map(|(label, stats)| (label.clone(), stats.count))
                .collect(),
        )
    }

    pub fn counts(&self) -> BTreeMap<String, u32> {
        self.labels
            .iter()
            .map(|(label, stats)| (label.clone(), stats.count))
            .collect()
    }

    /// Label with the highest count; ties go to the higher max confidence.
    pub fn representative(&self) -> Option<(&str, LabelStats)> {
        let mut best: Option<(&str, LabelStats)> = None;
        for (label, stats) in &self.labels {
            let better = match best {
                None => true,
                Some((_, current)) => {
                    stats.count > current.count
                        || (stats.count == current.count
                            && stats.max_confidence > current.max_confidence)
                }
            };
            if better {
                best = Some((label.as_str(), *stats));
            }
        }
        best
    }
}

/// Label-sorted `(label, count)` pairs; equality key across ticks.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DetectionSignature(pub Vec<(String, u32)>);

impl std::fmt::Display for DetectionSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(label, count)| format!("{}x{}", label, count))
            .collect();
        write!(f, "[{}]", parts.join(","))
    }
}

/// Class-aware greedy non-maximum suppression.
///
/// Boxes without geometry are never suppressed.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = candidate.bbox.is_some_and(|bbox| {
            kept.iter().any(|existing| {
                existing.label == candidate.label
                    && existing
                        .bbox
                        .is_some_and(|other| other.iou(&bbox) > iou_threshold)
            })
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
