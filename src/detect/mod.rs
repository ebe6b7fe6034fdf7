mod backend;
mod backends;
mod result;

pub use backend::Classifier;
pub use backends::{build_classifier, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{
    non_max_suppression, BoundingBox, Detection, DetectionSet, DetectionSignature, LabelStats,
};
