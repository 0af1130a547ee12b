#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};

const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based YOLOv8 detector.
///
/// Loads a local ONNX export with a square `input_size` input and decodes the
/// `[1, 4 + classes, anchors]` output. Every class counts as a hit; deployments
/// use single-class models (plates, bags).
pub struct TractYoloBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>,
    input_size: u32,
}

impl TractYoloBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, input_size })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let size = self.input_size;
        let resized = imageops::resize(image, size, size, imageops::FilterType::Triangle);
        tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        )
        .into_tensor()
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("expected a rank-3 YOLO output")?;
        let (_, rows, anchors) = view.dim();
        if rows < 5 {
            return Err(anyhow!("YOLO output has {} rows, need at least 5", rows));
        }

        let sx = image.width() as f32 / self.input_size as f32;
        let sy = image.height() as f32 / self.input_size as f32;
        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let score = (4..rows)
                .map(|row| view[[0, row, anchor]])
                .fold(f32::NEG_INFINITY, f32::max);
            if !score.is_finite() || score < confidence_threshold {
                continue;
            }
            let (cx, cy) = (view[[0, 0, anchor]], view[[0, 1, anchor]]);
            let (w, h) = (view[[0, 2, anchor]], view[[0, 3, anchor]]);
            let bbox = BoundingBox::new(
                (cx - w / 2.0) * sx,
                (cy - h / 2.0) * sy,
                (cx + w / 2.0) * sx,
                (cy + h / 2.0) * sy,
            );
            if let Some(bbox) = bbox.clamp_to(image.width(), image.height()) {
                candidates.push(Detection {
                    bbox,
                    confidence: score,
                });
            }
        }
        Ok(non_max_suppression(candidates, NMS_IOU_THRESHOLD))
    }
}

impl DetectorBackend for TractYoloBackend {
    fn name(&self) -> &'static str {
        "tract-yolo"
    }

    fn detect(&mut self, image: &RgbImage, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, image, confidence_threshold)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        self.detect(&blank, 1.0).map(|_| ())
    }
}

/// Greedy NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        if kept
            .iter()
            .all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_keeps_best_of_overlapping_boxes() {
        let a = Detection {
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            confidence: 0.6,
        };
        let b = Detection {
            bbox: BoundingBox::new(1.0, 1.0, 11.0, 11.0),
            confidence: 0.9,
        };
        let c = Detection {
            bbox: BoundingBox::new(50.0, 50.0, 60.0, 60.0),
            confidence: 0.5,
        };
        let kept = non_max_suppression(vec![a, b.clone(), c.clone()], 0.45);
        assert_eq!(kept, vec![b, c]);
    }
}
