pub mod cpu;
pub mod http;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use cpu::BrightnessBackend;
pub use http::HttpRecognizer;
pub use stub::{CyclingRecognizer, NullRecognizer, ScriptedDetector, ScriptedTracker};

#[cfg(feature = "backend-tract")]
pub use tract::TractYoloBackend;
