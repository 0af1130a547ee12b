/// Axis-aligned box in pixel coordinates of the frame it was produced on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Integer centroid, truncated the same way pixel indices are.
    pub fn centroid(&self) -> (i32, i32) {
        (
            ((self.x1 + self.x2) / 2.0) as i32,
            ((self.y1 + self.y2) / 2.0) as i32,
        )
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamp to a `width` x `height` raster. Returns `None` when nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let (w, h) = (width as f32, height as f32);
        let clamped = BoundingBox {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        };
        if clamped.width() < 1.0 || clamped.height() < 1.0 {
            None
        } else {
            Some(clamped)
        }
    }

    pub fn scale(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x1: self.x1 * factor,
            y1: self.y1 * factor,
            x2: self.x2 * factor,
            y2: self.y2 * factor,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// One OCR result for a cropped region.
#[derive(Clone, Debug, PartialEq)]
pub struct TextReading {
    pub text: String,
    pub confidence: f32,
}

impl TextReading {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Tracked object. `id` is stable across frames and never reused by a tracker.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: u64,
    pub bbox: BoundingBox,
    pub confidence: f32,
}
