//! Per-stream decision policies.
//!
//! - `cooldown`: When to run plate recognition and which readings to publish.
//! - `roi`: Which tracked bags to count.

pub mod cooldown;
pub mod roi;

pub use cooldown::{PlateDecision, PlateDeduplicator, DEFAULT_COOLDOWN};
pub use roi::{BagCounter, RegionOfInterest, DEFAULT_ROI};
