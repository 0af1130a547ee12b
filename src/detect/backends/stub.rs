use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::{DetectorBackend, ObjectTracker, TextRecognizer};
use crate::detect::result::{Detection, TextReading, Track};

/// Detector that replays a fixed script, one entry per call.
///
/// Once the script runs out it returns nothing, unless built with
/// `constant`.
pub struct ScriptedDetector {
    script: VecDeque<Vec<Detection>>,
    last: Vec<Detection>,
    repeat_last: bool,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Vec<Detection>>) -> Self {
        Self {
            script: script.into(),
            last: Vec::new(),
            repeat_last: false,
        }
    }

    /// Always return the same detections.
    pub fn constant(detections: Vec<Detection>) -> Self {
        Self {
            script: VecDeque::new(),
            last: detections,
            repeat_last: true,
        }
    }
}

impl DetectorBackend for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _image: &RgbImage, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let entry = match self.script.pop_front() {
            Some(entry) => {
                self.last = entry.clone();
                entry
            }
            None if self.repeat_last => self.last.clone(),
            None => Vec::new(),
        };
        Ok(entry
            .into_iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .collect())
    }
}

/// Tracker that replays a fixed script of track lists.
pub struct ScriptedTracker {
    script: VecDeque<Vec<Track>>,
}

impl ScriptedTracker {
    pub fn new(script: Vec<Vec<Track>>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl ObjectTracker for ScriptedTracker {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn track(&mut self, _image: &RgbImage) -> Result<Vec<Track>> {
        Ok(self.script.pop_front().unwrap_or_default())
    }
}

/// Recognizer that hands out configured texts in rotation.
///
/// The call counter is shared so tests can observe how often recognition ran
/// after the recognizer has moved into a stage.
pub struct CyclingRecognizer {
    readings: Vec<TextReading>,
    next: usize,
    calls: Arc<AtomicUsize>,
}

impl CyclingRecognizer {
    pub fn new<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            readings: texts
                .into_iter()
                .map(|text| TextReading::new(text, 0.9))
                .collect(),
            next: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl TextRecognizer for CyclingRecognizer {
    fn name(&self) -> &'static str {
        "cycling"
    }

    fn recognize(&mut self, _region: &RgbImage) -> Result<Vec<TextReading>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.readings.is_empty() {
            return Ok(Vec::new());
        }
        let reading = self.readings[self.next % self.readings.len()].clone();
        self.next = self.next.wrapping_add(1);
        Ok(vec![reading])
    }
}

/// Recognizer that never reads anything.
#[derive(Default)]
pub struct NullRecognizer;

impl TextRecognizer for NullRecognizer {
    fn name(&self) -> &'static str {
        "null"
    }

    fn recognize(&mut self, _region: &RgbImage) -> Result<Vec<TextReading>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    fn det(confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(0.0, 0.0, 4.0, 4.0),
            confidence,
        }
    }

    #[test]
    fn scripted_detector_filters_by_threshold() {
        let mut backend = ScriptedDetector::new(vec![vec![det(0.3), det(0.8)], vec![]]);
        let image = RgbImage::new(8, 8);
        let first = backend.detect(&image, 0.4).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].confidence, 0.8);
        assert!(backend.detect(&image, 0.4).unwrap().is_empty());
        assert!(backend.detect(&image, 0.4).unwrap().is_empty());
    }

    #[test]
    fn constant_detector_repeats() {
        let mut backend = ScriptedDetector::constant(vec![det(0.9)]);
        let image = RgbImage::new(8, 8);
        for _ in 0..3 {
            assert_eq!(backend.detect(&image, 0.4).unwrap().len(), 1);
        }
    }

    #[test]
    fn cycling_recognizer_rotates_and_counts() {
        let mut recognizer = CyclingRecognizer::new(["A", "B"]);
        let calls = recognizer.call_counter();
        let image = RgbImage::new(4, 4);
        let texts: Vec<String> = (0..3)
            .map(|_| recognizer.recognize(&image).unwrap()[0].text.clone())
            .collect();
        assert_eq!(texts, vec!["A", "B", "A"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
