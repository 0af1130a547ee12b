use anyhow::{Context, Result};

use super::{FrameStage, Tick};
use crate::annotate::{
    Annotator, BOX_COLOR, COUNT_TEXT_COLOR, ROI_EDGE_COLOR, ROI_FILL_COLOR, ROI_KEEP_ALPHA,
};
use crate::detect::ObjectTracker;
use crate::frame::Frame;
use crate::policy::BagCounter;
use crate::writer::EventSink;
use crate::StoreEvent;

pub const DEFAULT_BAG_CONFIDENCE: f32 = 0.25;

const COUNT_ANCHOR: (i32, i32) = (50, 30);
const COUNT_SIZE: f32 = 36.0;

/// Bag stream stage: track bags and count each identity once inside the ROI.
pub struct BagStage {
    tracker: Box<dyn ObjectTracker>,
    counter: BagCounter,
    annotator: Annotator,
}

impl BagStage {
    pub fn new(tracker: Box<dyn ObjectTracker>, counter: BagCounter, annotator: Annotator) -> Self {
        Self {
            tracker,
            counter,
            annotator,
        }
    }

    pub fn total(&self) -> u64 {
        self.counter.total()
    }
}

impl FrameStage for BagStage {
    fn name(&self) -> &'static str {
        "bags"
    }

    fn process(&mut self, frame: Frame, tick: &Tick, sink: &dyn EventSink) -> Result<Frame> {
        let tracks = self
            .tracker
            .track(frame.image())
            .with_context(|| format!("{} bag tracking", self.tracker.name()))?;

        let mut annotated = frame.image().clone();
        for track in &tracks {
            self.annotator.draw_box(&mut annotated, &track.bbox, BOX_COLOR);
        }
        let roi = self.counter.roi().points();
        self.annotator
            .tint_polygon(&mut annotated, roi, ROI_FILL_COLOR, ROI_KEEP_ALPHA);
        self.annotator
            .outline_polygon(&mut annotated, roi, ROI_EDGE_COLOR);
        for track in &tracks {
            self.annotator
                .draw_dot(&mut annotated, track.bbox.centroid(), BOX_COLOR);
        }

        for total in self.counter.observe(&tracks) {
            log::info!("bags counted: {}", total);
            sink.emit(StoreEvent::BagCounted {
                total,
                at: tick.wall,
            });
        }

        let label = format!("Count: {}", self.counter.total());
        self.annotator
            .draw_label(&mut annotated, COUNT_ANCHOR, COUNT_SIZE, &label, COUNT_TEXT_COLOR);
        Ok(frame.with_image(annotated))
    }
}
