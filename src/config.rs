use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::display::{DEFAULT_POLL_TIMEOUT, DEFAULT_STOP_KEY, DEFAULT_TARGET_HEIGHT};
use crate::pipeline::{DEFAULT_BAG_CONFIDENCE, DEFAULT_PLATE_CONFIDENCE, DEFAULT_RESIZE_RATIO};
use crate::policy::{DEFAULT_COOLDOWN, DEFAULT_ROI};
use crate::writer::DEFAULT_POLL_INTERVAL;

const DEFAULT_PLATE_SOURCE: &str = "stub://plate_cam?pattern=plate&frames=300";
const DEFAULT_BAG_SOURCE: &str = "stub://bag_cam?pattern=bags&frames=300&period=60";
const DEFAULT_TARGET_FPS: u32 = 15;
const DEFAULT_DEMO_PLATES: [&str; 2] = ["51A-123.45", "29B-999.99"];
const DEFAULT_LUMA_THRESHOLD: u8 = 200;
const DEFAULT_MIN_PIXELS: u32 = 64;
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_RECOGNIZER_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_TRACK_IOU: f32 = 0.3;
const DEFAULT_TRACK_MAX_AGE: u32 = 10;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DRAIN_MS: u64 = 2_000;
const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 1_000;
const DEFAULT_JOIN_MS: u64 = 5_000;

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    plate: Option<PlateConfigFile>,
    bags: Option<BagConfigFile>,
    store: Option<StoreConfigFile>,
    writer: Option<WriterConfigFile>,
    display: Option<DisplayConfigFile>,
    shutdown: Option<ShutdownConfigFile>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct PlateConfigFile {
    source: Option<String>,
    target_fps: Option<u32>,
    confidence: Option<f32>,
    resize_ratio: Option<f32>,
    rotate_portrait: Option<bool>,
    cooldown_ms: Option<u64>,
    pattern: Option<String>,
    detector: Option<DetectorConfigFile>,
    recognizer: Option<RecognizerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BagConfigFile {
    source: Option<String>,
    target_fps: Option<u32>,
    confidence: Option<f32>,
    roi: Option<Vec<[i32; 2]>>,
    iou_threshold: Option<f32>,
    max_age: Option<u32>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    kind: Option<String>,
    luma_threshold: Option<u8>,
    min_pixels: Option<u32>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognizerConfigFile {
    kind: Option<String>,
    texts: Option<Vec<String>>,
    endpoint: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    kind: Option<String>,
    url: Option<String>,
    auth: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct WriterConfigFile {
    poll_ms: Option<u64>,
    drain_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    target_height: Option<u32>,
    poll_ms: Option<u64>,
    stop_key: Option<char>,
    snapshot_path: Option<PathBuf>,
    snapshot_interval_ms: Option<u64>,
    headless: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ShutdownConfigFile {
    join_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub plate: PlateStreamSettings,
    pub bags: BagStreamSettings,
    pub store: StoreSettings,
    pub writer: WriterSettings,
    pub display: DisplayConfig,
    pub shutdown_join: Duration,
    /// TrueType font for overlay labels. Without one, the embedded DejaVu Sans Mono is used.
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PlateStreamSettings {
    pub source: String,
    pub target_fps: u32,
    pub confidence: f32,
    pub resize_ratio: f32,
    pub rotate_portrait: bool,
    pub cooldown: Duration,
    /// Readings that do not match are treated as unrecognized.
    pub pattern: Option<String>,
    pub detector: DetectorSettings,
    pub recognizer: RecognizerSettings,
}

#[derive(Debug, Clone)]
pub struct BagStreamSettings {
    pub source: String,
    pub target_fps: u32,
    pub confidence: f32,
    pub roi: Vec<(i32, i32)>,
    pub iou_threshold: f32,
    pub max_age: u32,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorSettings {
    Brightness { luma_threshold: u8, min_pixels: u32 },
    Tract { model_path: PathBuf, input_size: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerSettings {
    /// Fixed texts returned in rotation. Used for demos and stub sources.
    Cycling(Vec<String>),
    Http { endpoint: String, timeout: Duration },
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Firebase,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub kind: StoreKind,
    pub url: Option<String>,
    pub auth: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DisplayConfig {
    pub target_height: u32,
    pub poll_timeout: Duration,
    pub stop_key: char,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
    /// Skip the stop-key reader and render into a null sink unless a
    /// snapshot path is set.
    pub headless: bool,
}

impl TrackerConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ICE_TRACKER_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit config file (or defaults), then apply `ICE_*`
    /// environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TrackerConfigFile) -> Result<Self> {
        let plate_file = file.plate.unwrap_or_default();
        let plate = PlateStreamSettings {
            source: plate_file
                .source
                .unwrap_or_else(|| DEFAULT_PLATE_SOURCE.to_string()),
            target_fps: plate_file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            confidence: plate_file.confidence.unwrap_or(DEFAULT_PLATE_CONFIDENCE),
            resize_ratio: plate_file.resize_ratio.unwrap_or(DEFAULT_RESIZE_RATIO),
            rotate_portrait: plate_file.rotate_portrait.unwrap_or(true),
            cooldown: plate_file
                .cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_COOLDOWN),
            pattern: plate_file.pattern.filter(|p| !p.trim().is_empty()),
            detector: detector_from_file(plate_file.detector.unwrap_or_default())?,
            recognizer: recognizer_from_file(plate_file.recognizer.unwrap_or_default())?,
        };

        let bag_file = file.bags.unwrap_or_default();
        let bags = BagStreamSettings {
            source: bag_file
                .source
                .unwrap_or_else(|| DEFAULT_BAG_SOURCE.to_string()),
            target_fps: bag_file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            confidence: bag_file.confidence.unwrap_or(DEFAULT_BAG_CONFIDENCE),
            roi: bag_file
                .roi
                .unwrap_or_else(|| DEFAULT_ROI.to_vec())
                .into_iter()
                .map(|[x, y]| (x, y))
                .collect(),
            iou_threshold: bag_file.iou_threshold.unwrap_or(DEFAULT_TRACK_IOU),
            max_age: bag_file.max_age.unwrap_or(DEFAULT_TRACK_MAX_AGE),
            detector: detector_from_file(bag_file.detector.unwrap_or_default())?,
        };

        let store_file = file.store.unwrap_or_default();
        let store = StoreSettings {
            kind: match store_file.kind.as_deref() {
                None => {
                    if store_file.url.is_some() {
                        StoreKind::Firebase
                    } else {
                        StoreKind::Memory
                    }
                }
                Some(kind) => parse_store_kind(kind)?,
            },
            url: store_file.url,
            auth: store_file.auth,
            timeout: Duration::from_millis(
                store_file.timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
            ),
        };

        let writer_file = file.writer.unwrap_or_default();
        let writer = WriterSettings {
            poll_interval: writer_file
                .poll_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            drain_timeout: Duration::from_millis(writer_file.drain_ms.unwrap_or(DEFAULT_DRAIN_MS)),
        };

        let display_file = file.display.unwrap_or_default();
        let display = DisplayConfig {
            target_height: display_file.target_height.unwrap_or(DEFAULT_TARGET_HEIGHT),
            poll_timeout: display_file
                .poll_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_TIMEOUT),
            stop_key: display_file.stop_key.unwrap_or(DEFAULT_STOP_KEY),
            snapshot_path: display_file.snapshot_path,
            snapshot_interval: Duration::from_millis(
                display_file
                    .snapshot_interval_ms
                    .unwrap_or(DEFAULT_SNAPSHOT_INTERVAL_MS),
            ),
            headless: display_file.headless.unwrap_or(false),
        };

        let shutdown_join = Duration::from_millis(
            file.shutdown
                .and_then(|shutdown| shutdown.join_ms)
                .unwrap_or(DEFAULT_JOIN_MS),
        );

        Ok(Self {
            plate,
            bags,
            store,
            writer,
            display,
            shutdown_join,
            font_path: file.font_path,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("ICE_PLATE_SOURCE") {
            if !source.trim().is_empty() {
                self.plate.source = source;
            }
        }
        if let Ok(source) = std::env::var("ICE_BAG_SOURCE") {
            if !source.trim().is_empty() {
                self.bags.source = source;
            }
        }
        if let Ok(url) = std::env::var("ICE_STORE_URL") {
            if !url.trim().is_empty() {
                self.store.url = Some(url);
                self.store.kind = StoreKind::Firebase;
            }
        }
        if let Ok(auth) = std::env::var("ICE_STORE_AUTH") {
            if !auth.trim().is_empty() {
                self.store.auth = Some(auth);
            }
        }
        if let Ok(cooldown) = std::env::var("ICE_COOLDOWN_MS") {
            let ms: u64 = cooldown
                .trim()
                .parse()
                .map_err(|_| anyhow!("ICE_COOLDOWN_MS must be an integer number of milliseconds"))?;
            self.plate.cooldown = Duration::from_millis(ms);
        }
        if let Ok(path) = std::env::var("ICE_SNAPSHOT_PATH") {
            if !path.trim().is_empty() {
                self.display.snapshot_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(headless) = std::env::var("ICE_HEADLESS") {
            self.display.headless = parse_bool("ICE_HEADLESS", &headless)?;
        }
        if let Ok(texts) = std::env::var("ICE_PLATE_TEXTS") {
            let parsed = split_csv(&texts);
            if !parsed.is_empty() {
                self.plate.recognizer = RecognizerSettings::Cycling(parsed);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.plate.source.trim().is_empty() || self.bags.source.trim().is_empty() {
            return Err(anyhow!("both plate and bag sources must be set"));
        }
        for (name, confidence) in [
            ("plate", self.plate.confidence),
            ("bags", self.bags.confidence),
        ] {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(anyhow!("{} confidence must be within 0..=1", name));
            }
        }
        if self.plate.resize_ratio.is_nan() || self.plate.resize_ratio <= 0.0 {
            return Err(anyhow!("plate resize_ratio must be greater than zero"));
        }
        if let Some(pattern) = &self.plate.pattern {
            Regex::new(pattern).map_err(|e| anyhow!("invalid plate pattern: {}", e))?;
        }
        if self.bags.roi.len() < 3 {
            return Err(anyhow!(
                "bag roi needs at least 3 points, got {}",
                self.bags.roi.len()
            ));
        }
        if !(0.0..=1.0).contains(&self.bags.iou_threshold) {
            return Err(anyhow!("bag iou_threshold must be within 0..=1"));
        }
        if self.store.kind == StoreKind::Firebase && self.store.url.is_none() {
            return Err(anyhow!("firebase store requires a url"));
        }
        if let RecognizerSettings::Http { endpoint, .. } = &self.plate.recognizer {
            if endpoint.trim().is_empty() {
                return Err(anyhow!("http recognizer requires an endpoint"));
            }
        }
        if self.display.target_height == 0 {
            return Err(anyhow!("display target_height must be greater than zero"));
        }
        if self.writer.poll_interval.is_zero() {
            return Err(anyhow!("writer poll_ms must be greater than zero"));
        }
        self.store.auth = self.store.auth.take().filter(|a| !a.trim().is_empty());
        Ok(())
    }
}

fn detector_from_file(file: DetectorConfigFile) -> Result<DetectorSettings> {
    match file.kind.as_deref().unwrap_or("brightness") {
        "brightness" => Ok(DetectorSettings::Brightness {
            luma_threshold: file.luma_threshold.unwrap_or(DEFAULT_LUMA_THRESHOLD),
            min_pixels: file.min_pixels.unwrap_or(DEFAULT_MIN_PIXELS),
        }),
        "tract" => Ok(DetectorSettings::Tract {
            model_path: file
                .model_path
                .ok_or_else(|| anyhow!("tract detector requires model_path"))?,
            input_size: file.input_size.unwrap_or(DEFAULT_MODEL_INPUT),
        }),
        other => Err(anyhow!(
            "unknown detector kind '{}'; expected brightness or tract",
            other
        )),
    }
}

fn recognizer_from_file(file: RecognizerConfigFile) -> Result<RecognizerSettings> {
    match file.kind.as_deref().unwrap_or("cycling") {
        "cycling" => Ok(RecognizerSettings::Cycling(file.texts.unwrap_or_else(|| {
            DEFAULT_DEMO_PLATES.iter().map(|t| t.to_string()).collect()
        }))),
        "http" => Ok(RecognizerSettings::Http {
            endpoint: file
                .endpoint
                .ok_or_else(|| anyhow!("http recognizer requires an endpoint"))?,
            timeout: Duration::from_millis(
                file.timeout_ms.unwrap_or(DEFAULT_RECOGNIZER_TIMEOUT_MS),
            ),
        }),
        "none" => Ok(RecognizerSettings::None),
        other => Err(anyhow!(
            "unknown recognizer kind '{}'; expected cycling, http or none",
            other
        )),
    }
}

fn parse_store_kind(kind: &str) -> Result<StoreKind> {
    match kind {
        "memory" => Ok(StoreKind::Memory),
        "firebase" => Ok(StoreKind::Firebase),
        other => Err(anyhow!(
            "unknown store kind '{}'; expected memory or firebase",
            other
        )),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(anyhow!("{} must be a boolean (true/false)", name)),
    }
}

fn read_config_file(path: &Path) -> Result<TrackerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
