use anyhow::{Context, Result};
use image::{imageops, RgbImage};

use super::{FrameStage, Tick};
use crate::annotate::{Annotator, BOX_COLOR, PLATE_TEXT_COLOR};
use crate::detect::{DetectorBackend, TextRecognizer};
use crate::frame::Frame;
use crate::policy::{PlateDecision, PlateDeduplicator};
use crate::writer::EventSink;
use crate::StoreEvent;

pub const DEFAULT_PLATE_CONFIDENCE: f32 = 0.4;
pub const DEFAULT_RESIZE_RATIO: f32 = 0.7;

const UNKNOWN_LABEL: &str = "Unknown";
const LABEL_SIZE: f32 = 24.0;

#[derive(Clone, Debug)]
pub struct PlateSettings {
    pub confidence: f32,
    /// Scale applied to every frame before detection. 1.0 keeps the source size.
    pub resize_ratio: f32,
    /// Turn portrait frames 90 degrees counter-clockwise.
    pub rotate_portrait: bool,
}

impl Default for PlateSettings {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_PLATE_CONFIDENCE,
            resize_ratio: DEFAULT_RESIZE_RATIO,
            rotate_portrait: true,
        }
    }
}

/// Plate stream stage: detect plates, read them under a cooldown, publish new ones.
pub struct PlateStage {
    detector: Box<dyn DetectorBackend>,
    recognizer: Box<dyn TextRecognizer>,
    dedup: PlateDeduplicator,
    settings: PlateSettings,
    annotator: Annotator,
}

impl PlateStage {
    pub fn new(
        detector: Box<dyn DetectorBackend>,
        recognizer: Box<dyn TextRecognizer>,
        dedup: PlateDeduplicator,
        settings: PlateSettings,
        annotator: Annotator,
    ) -> Self {
        Self {
            detector,
            recognizer,
            dedup,
            settings,
            annotator,
        }
    }

    pub fn last_plate(&self) -> Option<&str> {
        self.dedup.last_plate()
    }

    fn preprocess(&self, image: &RgbImage) -> RgbImage {
        let ratio = self.settings.resize_ratio;
        let mut working = if (ratio - 1.0).abs() > f32::EPSILON && ratio > 0.0 {
            let width = ((image.width() as f32 * ratio) as u32).max(1);
            let height = ((image.height() as f32 * ratio) as u32).max(1);
            imageops::resize(image, width, height, imageops::FilterType::Triangle)
        } else {
            image.clone()
        };
        if self.settings.rotate_portrait && working.height() > working.width() {
            working = imageops::rotate270(&working);
        }
        working
    }
}

impl FrameStage for PlateStage {
    fn name(&self) -> &'static str {
        "plate"
    }

    fn process(&mut self, frame: Frame, tick: &Tick, sink: &dyn EventSink) -> Result<Frame> {
        let working = frame.with_image(self.preprocess(frame.image()));
        let detections = self
            .detector
            .detect(working.image(), self.settings.confidence)
            .with_context(|| format!("{} plate detection", self.detector.name()))?;

        let mut annotated = working.image().clone();
        for detection in &detections {
            let Some(crop) = working.crop(&detection.bbox) else {
                continue;
            };

            let mut label = UNKNOWN_LABEL.to_string();
            if self.dedup.recognition_due(tick.instant) {
                let readings = self
                    .recognizer
                    .recognize(&crop)
                    .with_context(|| format!("{} plate recognition", self.recognizer.name()))?;
                match self.dedup.observe(&readings, tick.instant) {
                    PlateDecision::NewPlate(text) => {
                        log::info!("license plate detected: {}", text);
                        sink.emit(StoreEvent::PlateRecognized {
                            plate: text.clone(),
                            at: tick.wall,
                        });
                        label = text;
                    }
                    PlateDecision::Repeat(text) => label = text,
                    PlateDecision::Unrecognized => {}
                }
            }

            self.annotator
                .draw_box(&mut annotated, &detection.bbox, BOX_COLOR);
            let anchor = (
                detection.bbox.x1 as i32,
                (detection.bbox.y1 as i32 - LABEL_SIZE as i32 - 4).max(0),
            );
            self.annotator
                .draw_label(&mut annotated, anchor, LABEL_SIZE, &label, PLATE_TEXT_COLOR);
        }

        Ok(working.with_image(annotated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, CyclingRecognizer, Detection, ScriptedDetector};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<StoreEvent>>,
    }

    impl EventSink for Recorder {
        fn emit(&self, event: StoreEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn plate_detection() -> Detection {
        Detection {
            bbox: BoundingBox::new(10.0, 10.0, 60.0, 30.0),
            confidence: 0.9,
        }
    }

    fn stage(texts: &[&str]) -> (PlateStage, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        let recognizer = CyclingRecognizer::new(texts.iter().copied());
        let calls = recognizer.call_counter();
        let stage = PlateStage::new(
            Box::new(ScriptedDetector::constant(vec![plate_detection()])),
            Box::new(recognizer),
            PlateDeduplicator::new(Duration::from_millis(1500)),
            PlateSettings {
                resize_ratio: 1.0,
                ..PlateSettings::default()
            },
            Annotator::new(),
        );
        (stage, calls)
    }

    fn tick_at(base: Instant, ms: u64) -> Tick {
        Tick {
            instant: base + Duration::from_millis(ms),
            wall: chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn cooldown_limits_recognition_and_dedups() {
        let (mut stage, calls) = stage(&["51A-123.45", "51A-123.45", "29B-999.99"]);
        let sink = Recorder::default();
        let base = Instant::now();
        let frame = Frame::new(RgbImage::new(100, 80), 1);
        for ms in [0, 500, 1000, 1600, 3200] {
            stage.process(frame.clone(), &tick_at(base, ms), &sink).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let plates: Vec<String> = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|event| match event {
                StoreEvent::PlateRecognized { plate, .. } => plate.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(plates, vec!["51A-123.45", "29B-999.99"]);
        assert_eq!(stage.last_plate(), Some("29B-999.99"));
    }

    #[test]
    fn preprocess_resizes_and_rotates_portrait() {
        let stage = PlateStage::new(
            Box::new(ScriptedDetector::new(vec![])),
            Box::new(CyclingRecognizer::new(Vec::<String>::new())),
            PlateDeduplicator::new(Duration::from_millis(1500)),
            PlateSettings::default(),
            Annotator::new(),
        );
        let landscape = stage.preprocess(&RgbImage::new(200, 100));
        assert_eq!(landscape.dimensions(), (140, 70));
        let portrait = stage.preprocess(&RgbImage::new(100, 200));
        assert_eq!(portrait.dimensions(), (140, 70));
    }

    #[test]
    fn no_detection_no_recognition() {
        let recognizer = CyclingRecognizer::new(["X"]);
        let calls = recognizer.call_counter();
        let mut stage = PlateStage::new(
            Box::new(ScriptedDetector::new(vec![])),
            Box::new(recognizer),
            PlateDeduplicator::new(Duration::from_millis(1500)),
            PlateSettings::default(),
            Annotator::new(),
        );
        let sink = Recorder::default();
        let out = stage
            .process(Frame::new(RgbImage::new(100, 80), 9), &Tick::now(), &sink)
            .unwrap();
        assert_eq!(out.sequence(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(sink.events.lock().unwrap().is_empty());
    }
}
