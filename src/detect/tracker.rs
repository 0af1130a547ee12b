//! IoU multi-object tracker.
//!
//! Wraps any `DetectorBackend` and associates its boxes across frames by
//! greedy best-IoU matching. Tracks survive `max_age` frames without a
//! match; ids increase monotonically and are never reused.

use std::collections::BTreeMap;

use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::{DetectorBackend, ObjectTracker};
use crate::detect::result::{BoundingBox, Detection, Track};

pub const DEFAULT_MAX_AGE: u32 = 10;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;

#[derive(Debug, Clone)]
struct Tracklet {
    bbox: BoundingBox,
    misses: u32,
}

pub struct IouTracker {
    detector: Box<dyn DetectorBackend>,
    confidence_threshold: f32,
    iou_threshold: f32,
    max_age: u32,
    next_track_id: u64,
    tracklets: BTreeMap<u64, Tracklet>,
}

impl IouTracker {
    pub fn new(detector: Box<dyn DetectorBackend>, confidence_threshold: f32) -> Self {
        Self {
            detector,
            confidence_threshold,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_age: DEFAULT_MAX_AGE,
            next_track_id: 1,
            tracklets: BTreeMap::new(),
        }
    }

    pub fn with_iou_threshold(mut self, iou_threshold: f32) -> Self {
        self.iou_threshold = iou_threshold;
        self
    }

    pub fn with_max_age(mut self, max_age: u32) -> Self {
        self.max_age = max_age;
        self
    }

    /// Associate one frame's detections with the live tracklets.
    ///
    /// Returns the tracks matched or created this frame, in detection order.
    pub fn update(&mut self, detections: Vec<Detection>) -> Vec<Track> {
        let mut pairs: Vec<(f32, usize, u64)> = Vec::new();
        for (det_idx, detection) in detections.iter().enumerate() {
            for (id, tracklet) in &self.tracklets {
                let iou = detection.bbox.iou(&tracklet.bbox);
                if iou >= self.iou_threshold {
                    pairs.push((iou, det_idx, *id));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut assigned: Vec<Option<u64>> = vec![None; detections.len()];
        let mut matched_ids = Vec::new();
        for (_, det_idx, id) in pairs {
            if assigned[det_idx].is_some() || matched_ids.contains(&id) {
                continue;
            }
            assigned[det_idx] = Some(id);
            matched_ids.push(id);
        }

        for (id, tracklet) in self.tracklets.iter_mut() {
            if !matched_ids.contains(id) {
                tracklet.misses += 1;
            }
        }
        let max_age = self.max_age;
        self.tracklets.retain(|_, t| t.misses <= max_age);

        let mut tracks = Vec::with_capacity(detections.len());
        for (detection, slot) in detections.into_iter().zip(assigned) {
            let id = match slot {
                Some(id) => id,
                None => {
                    let id = self.next_track_id;
                    self.next_track_id += 1;
                    id
                }
            };
            self.tracklets.insert(
                id,
                Tracklet {
                    bbox: detection.bbox,
                    misses: 0,
                },
            );
            tracks.push(Track {
                id,
                bbox: detection.bbox,
                confidence: detection.confidence,
            });
        }
        tracks
    }

    pub fn live_tracks(&self) -> usize {
        self.tracklets.len()
    }
}

impl ObjectTracker for IouTracker {
    fn name(&self) -> &'static str {
        "iou"
    }

    fn track(&mut self, image: &RgbImage) -> Result<Vec<Track>> {
        let detections = self.detector.detect(image, self.confidence_threshold)?;
        Ok(self.update(detections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::ScriptedDetector;

    fn det(x: f32, y: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x, y, x + 20.0, y + 20.0),
            confidence: 0.9,
        }
    }

    fn tracker() -> IouTracker {
        IouTracker::new(Box::new(ScriptedDetector::new(vec![])), 0.25)
    }

    #[test]
    fn keeps_id_for_overlapping_boxes() {
        let mut tracker = tracker();
        let first = tracker.update(vec![det(0.0, 0.0)]);
        let second = tracker.update(vec![det(4.0, 0.0)]);
        assert_eq!(first[0].id, 1);
        assert_eq!(second[0].id, 1);
    }

    #[test]
    fn never_reuses_ids_after_expiry() {
        let mut tracker = tracker().with_max_age(1);
        let first = tracker.update(vec![det(0.0, 0.0)]);
        tracker.update(vec![]);
        tracker.update(vec![]);
        assert_eq!(tracker.live_tracks(), 0);
        let again = tracker.update(vec![det(0.0, 0.0)]);
        assert_ne!(first[0].id, again[0].id);
        assert_eq!(again[0].id, 2);
    }

    #[test]
    fn separate_objects_get_separate_ids() {
        let mut tracker = tracker();
        let tracks = tracker.update(vec![det(0.0, 0.0), det(100.0, 100.0)]);
        assert_eq!(tracks.len(), 2);
        assert_ne!(tracks[0].id, tracks[1].id);
        let next = tracker.update(vec![det(102.0, 100.0), det(2.0, 0.0)]);
        assert_eq!(next[0].id, tracks[1].id);
        assert_eq!(next[1].id, tracks[0].id);
    }

    #[test]
    fn track_runs_wrapped_detector() {
        let detector = ScriptedDetector::new(vec![vec![det(0.0, 0.0)], vec![det(3.0, 3.0)]]);
        let mut tracker = IouTracker::new(Box::new(detector), 0.25);
        let image = RgbImage::new(64, 64);
        let a = tracker.track(&image).unwrap();
        let b = tracker.track(&image).unwrap();
        assert_eq!(a[0].id, b[0].id);
    }
}
