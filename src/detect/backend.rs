use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Object classifier seam.
///
/// The vision loop only needs labeled boxes with confidences; how they are
/// produced (scripted stub, ONNX model) stays behind this trait. Backends may
/// keep state between calls but must not retain the frame.
pub trait Classifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run the classifier on one frame.
    fn classify(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook (model load, first inference).
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
