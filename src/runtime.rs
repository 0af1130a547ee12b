//! Process wiring: build the parts from config, launch every thread, and
//! shut them down within bounded time.
//!
//! Thread layout: one per stream loop, one write worker, one display loop.
//! The caller's thread only waits on the stop signal.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::annotate::Annotator;
use crate::config::{DetectorSettings, RecognizerSettings, StoreKind, StoreSettings, TrackerConfig};
use crate::detect::{
    BrightnessBackend, CyclingRecognizer, DetectorBackend, HttpRecognizer, IouTracker,
    NullRecognizer, TextRecognizer,
};
use crate::display::{
    DisplayHandle, DisplayLoop, DisplayReport, DisplaySettings, FrameSink, KeySource, NoKeys,
    NullSink, SnapshotSink, StdinKeys,
};
use crate::frame::{FrameRelay, RelayStats};
use crate::ingest::{FileConfig, FileSource, VideoSource};
use crate::pipeline::{
    BagStage, FrameStage, LoopHandle, LoopReport, PlateSettings, PlateStage, StreamLoop,
};
use crate::policy::{BagCounter, PlateDeduplicator, RegionOfInterest};
use crate::storage::{EventStore, InMemoryEventStore};
use crate::transport::{FirebaseConfig, FirebaseStore};
use crate::writer::{EventSink, WriteQueue, WriteWorker, WriteWorkerHandle, WriterStats};
use crate::StopSignal;

const WAIT_TICK: Duration = Duration::from_millis(50);

/// Everything `Runtime::launch` needs, already constructed.
pub struct RuntimeParts {
    pub plate_source: Box<dyn VideoSource>,
    pub plate_stage: Box<dyn FrameStage>,
    pub bag_source: Box<dyn VideoSource>,
    pub bag_stage: Box<dyn FrameStage>,
    pub store: Arc<dyn EventStore>,
    pub sink: Box<dyn FrameSink>,
    pub keys: Box<dyn KeySource>,
    pub writer_poll: Duration,
    pub display: DisplaySettings,
}

impl RuntimeParts {
    pub fn from_config(cfg: &TrackerConfig) -> Result<Self> {
        let annotator = match &cfg.font_path {
            Some(path) => Annotator::with_font_file(path)?,
            None => Annotator::new(),
        };

        let plate_source = FileSource::new(
            FileConfig::new(cfg.plate.source.clone()).with_fps(cfg.plate.target_fps),
        )
        .context("plate source")?;
        let mut dedup = PlateDeduplicator::new(cfg.plate.cooldown);
        if let Some(pattern) = &cfg.plate.pattern {
            dedup = dedup.with_pattern(
                Regex::new(pattern).map_err(|e| anyhow!("invalid plate pattern: {}", e))?,
            );
        }
        let plate_stage = PlateStage::new(
            build_detector(&cfg.plate.detector).context("plate detector")?,
            build_recognizer(&cfg.plate.recognizer)?,
            dedup,
            PlateSettings {
                confidence: cfg.plate.confidence,
                resize_ratio: cfg.plate.resize_ratio,
                rotate_portrait: cfg.plate.rotate_portrait,
            },
            annotator.clone(),
        );

        let bag_source = FileSource::new(
            FileConfig::new(cfg.bags.source.clone()).with_fps(cfg.bags.target_fps),
        )
        .context("bag source")?;
        let tracker = IouTracker::new(
            build_detector(&cfg.bags.detector).context("bag detector")?,
            cfg.bags.confidence,
        )
        .with_iou_threshold(cfg.bags.iou_threshold)
        .with_max_age(cfg.bags.max_age);
        let counter = BagCounter::new(RegionOfInterest::new(cfg.bags.roi.clone())?);
        let bag_stage = BagStage::new(Box::new(tracker), counter, annotator);

        let sink: Box<dyn FrameSink> = match &cfg.display.snapshot_path {
            Some(path) => Box::new(SnapshotSink::new(path.clone(), cfg.display.snapshot_interval)),
            None => Box::new(NullSink::new()),
        };
        let keys: Box<dyn KeySource> = if cfg.display.headless {
            Box::new(NoKeys)
        } else {
            Box::new(StdinKeys::spawn()?)
        };

        Ok(Self {
            plate_source: Box::new(plate_source),
            plate_stage: Box::new(plate_stage),
            bag_source: Box::new(bag_source),
            bag_stage: Box::new(bag_stage),
            store: build_store(&cfg.store)?,
            sink,
            keys,
            writer_poll: cfg.writer.poll_interval,
            display: DisplaySettings {
                target_height: cfg.display.target_height,
                poll_timeout: cfg.display.poll_timeout,
                stop_key: cfg.display.stop_key,
            },
        })
    }
}

pub fn build_detector(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    match settings {
        DetectorSettings::Brightness {
            luma_threshold,
            min_pixels,
        } => Ok(Box::new(BrightnessBackend::new(*luma_threshold, *min_pixels))),
        #[cfg(feature = "backend-tract")]
        DetectorSettings::Tract {
            model_path,
            input_size,
        } => Ok(Box::new(crate::detect::backends::TractYoloBackend::new(
            model_path,
            *input_size,
        )?)),
        #[cfg(not(feature = "backend-tract"))]
        DetectorSettings::Tract { model_path, .. } => Err(anyhow!(
            "model {} needs the backend-tract feature",
            model_path.display()
        )),
    }
}

pub fn build_recognizer(settings: &RecognizerSettings) -> Result<Box<dyn TextRecognizer>> {
    Ok(match settings {
        RecognizerSettings::Cycling(texts) => Box::new(CyclingRecognizer::new(texts.clone())),
        RecognizerSettings::Http { endpoint, timeout } => {
            Box::new(HttpRecognizer::new(endpoint, *timeout)?)
        }
        RecognizerSettings::None => Box::new(NullRecognizer),
    })
}

pub fn build_store(settings: &StoreSettings) -> Result<Arc<dyn EventStore>> {
    match settings.kind {
        StoreKind::Memory => {
            log::warn!("using in-memory event store; records are lost on exit");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
        StoreKind::Firebase => {
            let url = settings
                .url
                .clone()
                .ok_or_else(|| anyhow!("firebase store requires a url"))?;
            let mut config = FirebaseConfig::new(url);
            config.auth = settings.auth.clone();
            config.timeout = settings.timeout;
            Ok(Arc::new(FirebaseStore::new(config)?))
        }
    }
}

// ----------------------------------------------------------------------------
// Runtime
// ----------------------------------------------------------------------------

pub struct Runtime;

pub struct RuntimeHandle {
    stop: StopSignal,
    queue: WriteQueue,
    writer: WriteWorkerHandle,
    plate: LoopHandle,
    bags: LoopHandle,
    display: DisplayHandle,
    plate_relay: Arc<FrameRelay>,
    bags_relay: Arc<FrameRelay>,
}

/// What each thread reported at shutdown. `None` means it overran its join
/// bound and was abandoned.
#[derive(Clone, Debug)]
pub struct ShutdownReport {
    pub plate: Option<LoopReport>,
    pub bags: Option<LoopReport>,
    pub display: Option<DisplayReport>,
    pub writer: WriterStats,
    pub plate_relay: RelayStats,
    pub bags_relay: RelayStats,
}

impl ShutdownReport {
    pub fn all_joined(&self) -> bool {
        self.plate.is_some() && self.bags.is_some() && self.display.is_some()
    }
}

impl Runtime {
    /// Start the write worker, both stream loops and the display loop.
    ///
    /// If any thread fails to start, `stop` is triggered so the ones already
    /// running wind down.
    pub fn launch(parts: RuntimeParts, stop: StopSignal) -> Result<RuntimeHandle> {
        let RuntimeParts {
            plate_source,
            plate_stage,
            bag_source,
            bag_stage,
            store,
            sink,
            keys,
            writer_poll,
            display,
        } = parts;

        let plate_relay = Arc::new(FrameRelay::new("plate"));
        let bags_relay = Arc::new(FrameRelay::new("bags"));
        let (queue, writer) = WriteWorker::spawn(store, writer_poll)?;
        let events: Arc<dyn EventSink> = Arc::new(queue.clone());

        let plate = StreamLoop::new(
            "plate",
            plate_source,
            plate_stage,
            Arc::clone(&plate_relay),
            Arc::clone(&events),
            stop.clone(),
        )
        .spawn();
        let plate = stop_on_err(&stop, plate)?;

        let bags = StreamLoop::new(
            "bags",
            bag_source,
            bag_stage,
            Arc::clone(&bags_relay),
            events,
            stop.clone(),
        )
        .spawn();
        let bags = stop_on_err(&stop, bags)?;

        let display = DisplayLoop::new(
            Arc::clone(&plate_relay),
            Arc::clone(&bags_relay),
            sink,
            keys,
            stop.clone(),
            display,
        )
        .spawn();
        let display = stop_on_err(&stop, display)?;

        log::info!("runtime started: plate, bags, display and write worker running");
        Ok(RuntimeHandle {
            stop,
            queue,
            writer,
            plate,
            bags,
            display,
            plate_relay,
            bags_relay,
        })
    }
}

fn stop_on_err<T>(stop: &StopSignal, result: Result<T>) -> Result<T> {
    if result.is_err() {
        stop.trigger();
    }
    result
}

impl RuntimeHandle {
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Producer side of the write queue, for injecting events.
    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    pub fn writer_stats(&self) -> WriterStats {
        self.writer.stats()
    }

    /// True once both stream loops have exited.
    pub fn streams_finished(&self) -> bool {
        self.plate.is_finished() && self.bags.is_finished()
    }

    /// Block until the stop signal is set.
    pub fn wait_for_stop(&self) {
        while !self.stop.is_set() {
            thread::sleep(WAIT_TICK);
        }
    }

    /// Like `wait_for_stop`, but give up after `timeout`. Returns whether the
    /// signal was set.
    pub fn wait_for_stop_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.stop.is_set() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_TICK);
        }
        true
    }

    /// Set the stop signal, join each loop for at most `join_timeout`, then
    /// let the write worker drain for at most `drain_timeout`.
    ///
    /// One overrunning loop does not shorten the others' bounds.
    pub fn shutdown(self, join_timeout: Duration, drain_timeout: Duration) -> ShutdownReport {
        self.stop.trigger();
        let plate = self.plate.join_timeout(join_timeout);
        let bags = self.bags.join_timeout(join_timeout);
        let display = self.display.join_timeout(join_timeout);
        let writer = self.writer.stop(drain_timeout);

        let report = ShutdownReport {
            plate,
            bags,
            display,
            writer,
            plate_relay: self.plate_relay.stats(),
            bags_relay: self.bags_relay.stats(),
        };
        log::info!(
            "shutdown: joined={} writes ok={} failed={} pending={}",
            report.all_joined(),
            report.writer.writes_ok,
            report.writer.writes_failed,
            report.writer.enqueued.saturating_sub(report.writer.processed)
        );
        report
    }
}
