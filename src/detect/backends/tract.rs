#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::Classifier;
use crate::detect::result::{non_max_suppression, BoundingBox, Detection};
use crate::frame::Frame;

/// YOLO-style ONNX detector run through tract.
///
/// Expects a single `[1, 3, S, S]` float input and a `[1, 4 + classes, anchors]`
/// output whose first four rows are centre-x, centre-y, width and height in
/// input pixels. Frames are resized to `S x S` before inference.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    labels: Vec<String>,
    min_confidence: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            labels: Vec::new(),
            min_confidence: 0.25,
            iou_threshold: 0.6,
        })
    }

    /// Per-box score needed before NMS.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.min_confidence = threshold;
        self
    }

    pub fn with_iou(mut self, iou_threshold: f32) -> Self {
        self.iou_threshold = iou_threshold;
        self
    }

    /// Class names, one per line, in model class order.
    pub fn with_labels_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read labels file {}", path.display()))?;
        self.labels = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(self)
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let rgb = RgbImage::from_raw(frame.width, frame.height, frame.to_rgb())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
        let resized = image::imageops::resize(
            &rgb,
            self.input_size,
            self.input_size,
            FilterType::Triangle,
        );
        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn label_for(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{}", class_id))
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output was not [1, 4 + classes, anchors]")?;
        let rows = view.shape()[1];
        let anchors = view.shape()[2];
        if rows <= 4 {
            return Err(anyhow!("model output has no class rows ({} rows)", rows));
        }
        let side = self.input_size as f32;

        let mut detections = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (4..rows)
                .map(|row| (row - 4, view[[0, row, anchor]]))
                .fold((0, f32::NEG_INFINITY), |best, item| {
                    if item.1 > best.1 {
                        item
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < self.min_confidence {
                continue;
            }
            let cx = view[[0, 0, anchor]] / side;
            let cy = view[[0, 1, anchor]] / side;
            let w = view[[0, 2, anchor]] / side;
            let h = view[[0, 3, anchor]] / side;
            let bbox = BoundingBox {
                x: cx - w / 2.0,
                y: cy - h / 2.0,
                w,
                h,
            }
            .clamped();
            detections.push(Detection::new(self.label_for(class_id), score).with_box(bbox));
        }
        Ok(non_max_suppression(detections, self.iou_threshold))
    }
}

impl Classifier for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn classify(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs)
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size as usize;
        let blank = tract_ndarray::Array4::<f32>::zeros((1, 3, side, side)).into_tensor();
        self.model
            .run(tvec!(blank.into()))
            .context("ONNX warm-up inference failed")?;
        Ok(())
    }
}
