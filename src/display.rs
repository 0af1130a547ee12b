//! Display/compositor loop.
//!
//! Polls the plate and bag relays on its own cadence, keeps the last frame of
//! each, and renders `[plate | bags]` side by side at a common height once
//! both streams have produced something. A stalled stream never blocks the
//! display; its last frame is shown again.

use anyhow::{anyhow, Context, Result};
use image::{imageops, ImageFormat, RgbImage};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::frame::{FrameRelay, RelayView};
use crate::StopSignal;

pub const DEFAULT_TARGET_HEIGHT: u32 = 480;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_STOP_KEY: char = 'q';
pub const WINDOW_TITLE: &str = "Smart Ice Tracker";

// ----------------------------------------------------------------------------
// Sinks
// ----------------------------------------------------------------------------

/// Destination for composited frames.
pub trait FrameSink: Send {
    fn name(&self) -> &'static str;

    fn render(&mut self, composite: &RgbImage) -> Result<()>;
}

/// Writes the latest composite to a JPEG file, at most once per `interval`.
///
/// The file is replaced atomically so readers never see a partial image.
pub struct SnapshotSink {
    path: PathBuf,
    interval: Duration,
    last_write: Option<Instant>,
    written: u64,
}

impl SnapshotSink {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            last_write: None,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for SnapshotSink {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn render(&mut self, composite: &RgbImage) -> Result<()> {
        if self
            .last_write
            .is_some_and(|last| last.elapsed() < self.interval)
        {
            return Ok(());
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        composite
            .save_with_format(&tmp, ImageFormat::Jpeg)
            .with_context(|| format!("write snapshot {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("publish snapshot {}", self.path.display()))?;
        self.last_write = Some(Instant::now());
        self.written += 1;
        Ok(())
    }
}

/// Discards composites, counting them.
#[derive(Default)]
pub struct NullSink {
    rendered: Arc<AtomicU64>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.rendered)
    }
}

impl FrameSink for NullSink {
    fn name(&self) -> &'static str {
        "null"
    }

    fn render(&mut self, _composite: &RgbImage) -> Result<()> {
        self.rendered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Keys
// ----------------------------------------------------------------------------

pub trait KeySource: Send {
    /// Most recent key press, if any. Never blocks.
    fn poll_key(&mut self) -> Option<char>;
}

/// Keys typed on stdin, one line at a time (first character counts).
pub struct StdinKeys {
    rx: Receiver<char>,
}

impl StdinKeys {
    pub fn spawn() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("stdin-keys".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else {
                        break;
                    };
                    if let Some(key) = line.trim().chars().next() {
                        if tx.send(key).is_err() {
                            break;
                        }
                    }
                }
            })
            .map_err(|e| anyhow!("failed to spawn stdin reader: {}", e))?;
        Ok(Self { rx })
    }
}

impl KeySource for StdinKeys {
    fn poll_key(&mut self) -> Option<char> {
        self.rx.try_recv().ok()
    }
}

/// Key source for headless runs.
#[derive(Default)]
pub struct NoKeys;

impl KeySource for NoKeys {
    fn poll_key(&mut self) -> Option<char> {
        None
    }
}

/// Keys fed from another thread through a channel.
pub struct ChannelKeys {
    rx: Receiver<char>,
}

impl ChannelKeys {
    pub fn pair() -> (mpsc::Sender<char>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }
}

impl KeySource for ChannelKeys {
    fn poll_key(&mut self) -> Option<char> {
        self.rx.try_recv().ok()
    }
}

// ----------------------------------------------------------------------------
// Composition
// ----------------------------------------------------------------------------

/// Resize both frames to `target_height`, keeping aspect ratio, and join them
/// horizontally with `left` first.
pub fn compose_side_by_side(left: &RgbImage, right: &RgbImage, target_height: u32) -> RgbImage {
    let left = fit_height(left, target_height);
    let right = fit_height(right, target_height);
    let mut out = RgbImage::new(left.width() + right.width(), target_height);
    imageops::replace(&mut out, &left, 0, 0);
    imageops::replace(&mut out, &right, left.width() as i64, 0);
    out
}

fn fit_height(image: &RgbImage, target_height: u32) -> RgbImage {
    if image.height() == target_height {
        return image.clone();
    }
    let width = ((image.width() as u64 * target_height as u64) / image.height().max(1) as u64)
        .max(1) as u32;
    imageops::resize(image, width, target_height, imageops::FilterType::Triangle)
}

// ----------------------------------------------------------------------------
// DisplayLoop
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct DisplaySettings {
    pub target_height: u32,
    pub poll_timeout: Duration,
    pub stop_key: char,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            target_height: DEFAULT_TARGET_HEIGHT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            stop_key: DEFAULT_STOP_KEY,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisplayReport {
    pub ticks: u64,
    pub rendered: u64,
    pub render_errors: u64,
    pub stopped_by_key: bool,
}

pub struct DisplayLoop {
    plate: RelayView,
    bags: RelayView,
    sink: Box<dyn FrameSink>,
    keys: Box<dyn KeySource>,
    stop: StopSignal,
    settings: DisplaySettings,
}

pub struct DisplayHandle {
    thread: JoinHandle<DisplayReport>,
}

impl DisplayLoop {
    pub fn new(
        plate: Arc<FrameRelay>,
        bags: Arc<FrameRelay>,
        sink: Box<dyn FrameSink>,
        keys: Box<dyn KeySource>,
        stop: StopSignal,
        settings: DisplaySettings,
    ) -> Self {
        Self {
            plate: RelayView::new(plate),
            bags: RelayView::new(bags),
            sink,
            keys,
            stop,
            settings,
        }
    }

    pub fn spawn(self) -> Result<DisplayHandle> {
        let thread = thread::Builder::new()
            .name("display".to_string())
            .spawn(move || self.run())
            .map_err(|e| anyhow!("failed to spawn display loop: {}", e))?;
        Ok(DisplayHandle { thread })
    }

    pub fn run(mut self) -> DisplayReport {
        let mut report = DisplayReport::default();
        log::info!(
            "{}: rendering to {} sink, press '{}' to stop",
            WINDOW_TITLE,
            self.sink.name(),
            self.settings.stop_key
        );
        while !self.stop.is_set() {
            report.ticks += 1;
            let timeout = self.settings.poll_timeout;
            let plate = self.plate.poll(timeout).cloned();
            let bags = self.bags.poll(timeout).cloned();

            if let (Some(plate), Some(bags)) = (plate, bags) {
                let composite =
                    compose_side_by_side(plate.image(), bags.image(), self.settings.target_height);
                match self.sink.render(&composite) {
                    Ok(()) => report.rendered += 1,
                    Err(e) => {
                        report.render_errors += 1;
                        log::warn!("display: render failed: {:#}", e);
                    }
                }
            }

            if let Some(key) = self.keys.poll_key() {
                if key == self.settings.stop_key {
                    log::info!("display: stop key pressed");
                    self.stop.trigger();
                    report.stopped_by_key = true;
                }
            }
        }
        log::info!(
            "display: closed after {} ticks, {} frames rendered",
            report.ticks,
            report.rendered
        );
        report
    }
}

impl DisplayHandle {
    pub fn join_timeout(self, timeout: Duration) -> Option<DisplayReport> {
        crate::join_bounded(self.thread, timeout).into_report("display", timeout)
    }
}
