use anyhow::Result;
use image::RgbImage;

use crate::detect::result::{Detection, TextReading, Track};

/// Object detector seam.
///
/// Implementations treat the frame as read-only and return boxes in the
/// frame's own pixel coordinates. Detections below `confidence_threshold`
/// must not be returned.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, image: &RgbImage, confidence_threshold: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Text recognizer seam for cropped plate regions.
///
/// An empty result means nothing legible was found; it is not an error.
pub trait TextRecognizer: Send {
    fn name(&self) -> &'static str;

    fn recognize(&mut self, region: &RgbImage) -> Result<Vec<TextReading>>;
}

/// Multi-object tracker seam.
///
/// Track ids must stay stable for the same physical object across calls and
/// are never handed to a different object within one tracker's lifetime.
pub trait ObjectTracker: Send {
    fn name(&self) -> &'static str;

    fn track(&mut self, image: &RgbImage) -> Result<Vec<Track>>;
}
