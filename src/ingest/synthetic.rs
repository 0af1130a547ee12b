//! Synthetic scenes behind `stub://` paths.
//!
//! `stub://name?frames=N&width=W&height=H&pattern=bags|plate&period=P&error_after=E`
//!
//! - `bags`: a white 60 px block crosses the frame left to right at 72 % of
//!   the height, once every `period` frames. At the default 960x720 the block
//!   passes through the default counting region.
//! - `plate`: a bright plate-sized rectangle drifts slowly near the centre.
//! - `error_after`: reads fail once that many frames have been produced.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use url::Url;

use crate::frame::Frame;

const DEFAULT_FRAMES: u64 = 60;
const DEFAULT_WIDTH: u32 = 960;
const DEFAULT_HEIGHT: u32 = 720;
const BAG_SIZE: u32 = 60;
const PLATE_WIDTH: u32 = 160;
const PLATE_HEIGHT: u32 = 50;
const BACKGROUND: Rgb<u8> = Rgb([30, 30, 30]);
const FOREGROUND: Rgb<u8> = Rgb([250, 250, 250]);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenePattern {
    Bags,
    Plate,
}

#[derive(Clone, Debug)]
pub(crate) struct SceneParams {
    pub name: String,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub pattern: ScenePattern,
    pub period: u64,
    pub error_after: Option<u64>,
}

impl SceneParams {
    pub(crate) fn parse(path: &str) -> Result<Self> {
        let url = Url::parse(path).with_context(|| format!("parse stub path '{}'", path))?;
        if url.scheme() != "stub" {
            return Err(anyhow!("not a stub:// path: {}", path));
        }
        let mut scene = SceneParams {
            name: url.host_str().unwrap_or("stub").to_string(),
            frames: DEFAULT_FRAMES,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            pattern: ScenePattern::Bags,
            period: 0,
            error_after: None,
        };
        for (key, value) in url.query_pairs() {
            match &*key {
                "frames" => scene.frames = parse_num(&key, &value)?,
                "width" => scene.width = parse_num(&key, &value)?,
                "height" => scene.height = parse_num(&key, &value)?,
                "period" => scene.period = parse_num(&key, &value)?,
                "error_after" => scene.error_after = Some(parse_num(&key, &value)?),
                "pattern" => {
                    scene.pattern = match &*value {
                        "bags" => ScenePattern::Bags,
                        "plate" => ScenePattern::Plate,
                        other => return Err(anyhow!("unknown stub pattern '{}'", other)),
                    }
                }
                other => log::warn!("stub path {}: ignoring unknown parameter '{}'", path, other),
            }
        }
        if scene.width < BAG_SIZE || scene.height < BAG_SIZE {
            return Err(anyhow!(
                "stub frames must be at least {}x{}",
                BAG_SIZE,
                BAG_SIZE
            ));
        }
        if scene.period == 0 {
            scene.period = scene.frames.max(1);
        }
        Ok(scene)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub parameter '{}' must be a number, got '{}'", key, value))
}

pub(crate) struct SyntheticSource {
    scene: SceneParams,
    produced: u64,
}

impl SyntheticSource {
    pub(crate) fn new(scene: SceneParams) -> Self {
        Self { scene, produced: 0 }
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(limit) = self.scene.error_after {
            if self.produced >= limit {
                return Err(anyhow!("{}: simulated read failure", self.scene.name));
            }
        }
        if self.produced >= self.scene.frames {
            return Ok(None);
        }
        let index = self.produced;
        self.produced += 1;
        let image = match self.scene.pattern {
            ScenePattern::Bags => self.render_bags(index),
            ScenePattern::Plate => self.render_plate(index),
        };
        Ok(Some(Frame::new(image, self.produced)))
    }

    pub(crate) fn produced(&self) -> u64 {
        self.produced
    }

    fn render_bags(&self, index: u64) -> RgbImage {
        let SceneParams {
            width,
            height,
            period,
            ..
        } = self.scene;
        let mut image = RgbImage::from_pixel(width, height, BACKGROUND);
        let phase = index % period;
        let travel = (width + BAG_SIZE) as u64;
        let left = (phase * travel / period) as i64 - BAG_SIZE as i64;
        let top = (height as f32 * 0.72) as i64 - (BAG_SIZE / 2) as i64;
        fill_rect(&mut image, left, top, BAG_SIZE, BAG_SIZE);
        image
    }

    fn render_plate(&self, index: u64) -> RgbImage {
        let SceneParams { width, height, .. } = self.scene;
        let mut image = RgbImage::from_pixel(width, height, BACKGROUND);
        let drift = (index % 20) as i64;
        let left = (width / 2) as i64 - (PLATE_WIDTH / 2) as i64 + drift;
        let top = (height as f32 * 0.6) as i64;
        fill_rect(&mut image, left, top, PLATE_WIDTH, PLATE_HEIGHT);
        image
    }
}

fn fill_rect(image: &mut RgbImage, left: i64, top: i64, w: u32, h: u32) {
    let (width, height) = (image.width() as i64, image.height() as i64);
    for y in top.max(0)..(top + h as i64).min(height) {
        for x in left.max(0)..(left + w as i64).min(width) {
            image.put_pixel(x as u32, y as u32, FOREGROUND);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults_and_overrides() {
        let scene = SceneParams::parse("stub://belt").unwrap();
        assert_eq!(scene.name, "belt");
        assert_eq!((scene.frames, scene.width, scene.height), (60, 960, 720));
        assert_eq!(scene.pattern, ScenePattern::Bags);
        assert_eq!(scene.period, 60);

        let scene =
            SceneParams::parse("stub://gate?frames=5&width=320&height=240&pattern=plate").unwrap();
        assert_eq!((scene.frames, scene.width, scene.height), (5, 320, 240));
        assert_eq!(scene.pattern, ScenePattern::Plate);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(SceneParams::parse("stub://x?frames=abc").is_err());
        assert!(SceneParams::parse("stub://x?pattern=cars").is_err());
        assert!(SceneParams::parse("stub://x?width=10").is_err());
    }

    #[test]
    fn produces_numbered_frames_then_ends() {
        let scene = SceneParams::parse("stub://x?frames=3&width=120&height=90").unwrap();
        let mut source = SyntheticSource::new(scene);
        let seqs: Vec<u64> = std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|f| f.sequence())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn error_after_fails_reads() {
        let scene = SceneParams::parse("stub://x?frames=10&error_after=2").unwrap();
        let mut source = SyntheticSource::new(scene);
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().is_err());
    }

    #[test]
    fn bag_block_sits_at_lower_band() {
        let scene = SceneParams::parse("stub://x?frames=60").unwrap();
        let mut source = SyntheticSource::new(scene);
        let frame = (0..30)
            .filter_map(|_| source.next_frame().unwrap())
            .last()
            .unwrap();
        assert_eq!(frame.image().get_pixel(479, 518), &FOREGROUND);
        assert_eq!(frame.image().get_pixel(479, 100), &BACKGROUND);
    }
}
