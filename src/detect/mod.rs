mod backend;
pub mod backends;
mod result;
pub mod tracker;

pub use backend::{DetectorBackend, ObjectTracker, TextRecognizer};
pub use backends::{
    BrightnessBackend, CyclingRecognizer, HttpRecognizer, NullRecognizer, ScriptedDetector,
    ScriptedTracker,
};
pub use result::{BoundingBox, Detection, TextReading, Track};
pub use tracker::IouTracker;
