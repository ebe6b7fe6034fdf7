pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

use anyhow::{anyhow, Result};

use crate::config::VisionSettings;
use crate::detect::backend::Classifier;

/// Build the classifier named in the vision settings.
pub fn build_classifier(settings: &VisionSettings) -> Result<Box<dyn Classifier>> {
    match settings.backend.as_str() {
        "stub" => Ok(Box::new(StubBackend::new())),
        "tract" => build_tract(settings),
        other => Err(anyhow!("unknown classifier backend '{}'", other)),
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract(settings: &VisionSettings) -> Result<Box<dyn Classifier>> {
    let model_path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract backend requires vision.model_path"))?;
    let mut backend = TractBackend::new(model_path, settings.input_size)?
        .with_threshold(settings.primary_conf)
        .with_iou(settings.iou_threshold);
    if let Some(labels) = settings.labels_path.as_ref() {
        backend = backend.with_labels_file(labels)?;
    }
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_settings: &VisionSettings) -> Result<Box<dyn Classifier>> {
    Err(anyhow!("the tract backend requires the backend-tract feature"))
}
