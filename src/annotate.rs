//! Frame annotation helpers shared by the stream stages.
//!
//! Labels use DejaVu Sans Mono, embedded in the binary, unless a font file is
//! configured.

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_polygon_mut,
    draw_text_mut,
};
use imageproc::point::Point;
use imageproc::rect::Rect;
use std::path::Path;

use crate::detect::BoundingBox;

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const PLATE_TEXT_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
pub const ROI_FILL_COLOR: Rgb<u8> = Rgb([128, 0, 128]);
pub const ROI_EDGE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const COUNT_TEXT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Share of the original pixel kept under the ROI tint.
pub const ROI_KEEP_ALPHA: f32 = 0.8;

static DEFAULT_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

#[derive(Clone)]
pub struct Annotator {
    font: Option<FontArc>,
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}

impl Annotator {
    /// Annotator using the embedded font.
    pub fn new() -> Self {
        let font = FontArc::try_from_slice(DEFAULT_FONT)
            .map_err(|e| log::warn!("embedded font unusable, labels disabled: {}", e))
            .ok();
        Self { font }
    }

    /// Annotator that draws shapes only.
    pub fn without_labels() -> Self {
        Self { font: None }
    }

    pub fn with_font_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontArc::try_from_vec(bytes)
            .map_err(|_| anyhow!("{} is not a usable TrueType/OpenType font", path.display()))?;
        Ok(Self { font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn draw_box(&self, image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
        let Some(bbox) = bbox.clamp_to(image.width(), image.height()) else {
            return;
        };
        let (w, h) = (bbox.width() as u32, bbox.height() as u32);
        for inset in 0..2u32 {
            if w <= inset * 2 || h <= inset * 2 {
                break;
            }
            let rect = Rect::at(bbox.x1 as i32 + inset as i32, bbox.y1 as i32 + inset as i32)
                .of_size(w - inset * 2, h - inset * 2);
            draw_hollow_rect_mut(image, rect, color);
        }
    }

    pub fn draw_label(
        &self,
        image: &mut RgbImage,
        (x, y): (i32, i32),
        size: f32,
        text: &str,
        color: Rgb<u8>,
    ) {
        if let Some(font) = &self.font {
            draw_text_mut(image, color, x, y, PxScale::from(size), font, text);
        }
    }

    pub fn draw_dot(&self, image: &mut RgbImage, center: (i32, i32), color: Rgb<u8>) {
        draw_filled_circle_mut(image, center, 4, color);
    }

    /// Blend `color` into the polygon's interior, keeping `keep_alpha` of the original.
    pub fn tint_polygon(
        &self,
        image: &mut RgbImage,
        points: &[(i32, i32)],
        color: Rgb<u8>,
        keep_alpha: f32,
    ) {
        let Some(mask) = polygon_mask(image.width(), image.height(), points) else {
            return;
        };
        let keep = keep_alpha.clamp(0.0, 1.0);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            if mask.get_pixel(x, y)[0] == 0 {
                continue;
            }
            for channel in 0..3 {
                let blended = pixel[channel] as f32 * keep + color[channel] as f32 * (1.0 - keep);
                pixel[channel] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    pub fn outline_polygon(&self, image: &mut RgbImage, points: &[(i32, i32)], color: Rgb<u8>) {
        let n = points.len();
        for i in 0..n {
            let (ax, ay) = points[i];
            let (bx, by) = points[(i + 1) % n];
            for offset in [0.0f32, 1.0] {
                draw_line_segment_mut(
                    image,
                    (ax as f32 + offset, ay as f32),
                    (bx as f32 + offset, by as f32),
                    color,
                );
            }
        }
    }
}

fn polygon_mask(width: u32, height: u32, points: &[(i32, i32)]) -> Option<GrayImage> {
    let mut polygon: Vec<Point<i32>> = points.iter().map(|&(x, y)| Point::new(x, y)).collect();
    while polygon.len() > 1 && polygon.first() == polygon.last() {
        polygon.pop();
    }
    if polygon.len() < 3 {
        return None;
    }
    let mut mask = GrayImage::new(width, height);
    draw_polygon_mut(&mut mask, &polygon, Luma([255u8]));
    Some(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tint_only_touches_polygon_interior() {
        let mut image = RgbImage::from_pixel(20, 20, Rgb([100, 100, 100]));
        let annotator = Annotator::new();
        annotator.tint_polygon(
            &mut image,
            &[(5, 5), (15, 5), (15, 15), (5, 15)],
            ROI_FILL_COLOR,
            ROI_KEEP_ALPHA,
        );
        assert_eq!(image.get_pixel(10, 10), &Rgb([106, 80, 106]));
        assert_eq!(image.get_pixel(1, 1), &Rgb([100, 100, 100]));
    }

    #[test]
    fn draw_box_ignores_offscreen_boxes() {
        let mut image = RgbImage::new(10, 10);
        let annotator = Annotator::new();
        annotator.draw_box(&mut image, &BoundingBox::new(50.0, 50.0, 60.0, 60.0), BOX_COLOR);
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
        annotator.draw_box(&mut image, &BoundingBox::new(2.0, 2.0, 8.0, 8.0), BOX_COLOR);
        assert_eq!(image.get_pixel(2, 2), &BOX_COLOR);
        assert_eq!(image.get_pixel(5, 5), &Rgb([0, 0, 0]));
    }

    #[test]
    fn default_annotator_draws_labels() {
        let mut image = RgbImage::new(120, 40);
        let annotator = Annotator::new();
        assert!(annotator.has_font());
        annotator.draw_label(&mut image, (2, 2), 24.0, "Count: 1", COUNT_TEXT_COLOR);
        assert!(image.pixels().any(|p| p.0 != [0, 0, 0]));
    }

    #[test]
    fn labels_skipped_without_font() {
        let mut image = RgbImage::new(120, 40);
        let annotator = Annotator::without_labels();
        assert!(!annotator.has_font());
        annotator.draw_label(&mut image, (2, 2), 24.0, "Count: 1", COUNT_TEXT_COLOR);
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn missing_font_file_is_an_error() {
        assert!(Annotator::with_font_file(Path::new("/nonexistent/font.ttf")).is_err());
    }
}
