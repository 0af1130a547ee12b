use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};

const DEFAULT_LUMA_THRESHOLD: u8 = 200;
const DEFAULT_MIN_PIXELS: u32 = 64;

/// CPU backend that boxes every pixel brighter than a luma threshold.
///
/// Good enough for bright plates or white bags on a dark belt and for the
/// synthetic `stub://` scenes. Returns at most one detection per frame.
pub struct BrightnessBackend {
    luma_threshold: u8,
    min_pixels: u32,
}

impl Default for BrightnessBackend {
    fn default() -> Self {
        Self {
            luma_threshold: DEFAULT_LUMA_THRESHOLD,
            min_pixels: DEFAULT_MIN_PIXELS,
        }
    }
}

impl BrightnessBackend {
    pub fn new(luma_threshold: u8, min_pixels: u32) -> Self {
        Self {
            luma_threshold,
            min_pixels,
        }
    }
}

impl DetectorBackend for BrightnessBackend {
    fn name(&self) -> &'static str {
        "brightness"
    }

    fn detect(&mut self, image: &RgbImage, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let (mut x1, mut y1, mut x2, mut y2) = (u32::MAX, u32::MAX, 0u32, 0u32);
        let mut bright = 0u32;
        for (x, y, pixel) in image.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let luma = (r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000;
            if luma >= self.luma_threshold as u32 {
                bright += 1;
                x1 = x1.min(x);
                y1 = y1.min(y);
                x2 = x2.max(x);
                y2 = y2.max(y);
            }
        }
        if bright < self.min_pixels.max(1) {
            return Ok(Vec::new());
        }

        let bbox = BoundingBox::new(x1 as f32, y1 as f32, (x2 + 1) as f32, (y2 + 1) as f32);
        let confidence = (bright as f32 / bbox.area().max(1.0)).min(1.0);
        if confidence < confidence_threshold {
            return Ok(Vec::new());
        }
        Ok(vec![Detection { bbox, confidence }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn brightness_backend_boxes_bright_block() {
        let mut image = RgbImage::new(40, 30);
        for y in 10..20 {
            for x in 5..15 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let mut backend = BrightnessBackend::default();
        let detections = backend.detect(&image, 0.25).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(
            detections[0].bbox,
            BoundingBox::new(5.0, 10.0, 15.0, 20.0)
        );
        assert!((detections[0].confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn brightness_backend_ignores_dark_frames() {
        let image = RgbImage::from_pixel(40, 30, Rgb([20, 20, 20]));
        let mut backend = BrightnessBackend::default();
        assert!(backend.detect(&image, 0.0).unwrap().is_empty());
    }
}
