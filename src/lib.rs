//! Ice Tracker
//!
//! Coordination layer for a two-camera ice plant: one camera reads vehicle
//! license plates, the other counts ice bags crossing a region of interest.
//!
//! # Architecture
//!
//! Each camera is driven by its own stream loop on a dedicated OS thread.
//! Loops never block on each other or on the network:
//!
//! 1. **Frame relays**: single-slot, latest-wins handoff from a loop to the display.
//! 2. **Write worker**: unbounded FIFO drained by one thread that owns all store writes.
//! 3. **Stop signal**: one monotone flag checked by every loop on every iteration.
//!
//! # Module Structure
//!
//! - `frame`: Frames and the single-slot `FrameRelay`
//! - `ingest`: Video sources (synthetic `stub://`, local files via FFmpeg)
//! - `detect`: Detector, recognizer and tracker seams plus bundled backends
//! - `policy`: Plate cooldown/dedup and ROI bag counting
//! - `pipeline`: Generic stream loop and the plate/bag stages
//! - `writer`: Background write worker and plate ledger
//! - `storage` / `transport`: Event store trait, in-memory and Firebase stores
//! - `display`: Side-by-side compositor, sinks and stop key handling
//! - `history`: Dashboard queries over stored plate records
//! - `runtime`: Wiring, launch and bounded shutdown
//! - Core types: StopSignal, StoreEvent, PlateRecord, store paths

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub mod annotate;
pub mod config;
pub mod detect;
pub mod display;
pub mod frame;
pub mod history;
pub mod ingest;
pub mod pipeline;
pub mod policy;
pub mod runtime;
pub mod storage;
pub mod transport;
pub mod writer;

pub use config::TrackerConfig;
pub use detect::{
    BoundingBox, Detection, DetectorBackend, ObjectTracker, TextReading, TextRecognizer, Track,
};
pub use display::{DisplayLoop, FrameSink, KeySource, NullSink, SnapshotSink};
pub use frame::{Frame, FrameRelay, RelayView};
pub use ingest::{FileConfig, FileSource, VideoSource};
pub use pipeline::{BagStage, FrameStage, LoopExit, LoopReport, PlateStage, StreamLoop};
pub use policy::{BagCounter, PlateDecision, PlateDeduplicator, RegionOfInterest};
pub use runtime::{Runtime, RuntimeHandle, RuntimeParts};
pub use storage::{EventStore, InMemoryEventStore, Subscription};
pub use writer::{EventSink, WriteQueue, WriteWorker, WriteWorkerHandle, WriterStats};

/// Root of the per-day plate records.
pub const PLATES_ROOT: &str = "license_plates";

/// Running bag total, overwritten wholesale on every count.
pub const TOTAL_COUNT_PATH: &str = "total_count";

/// Date layout used in store paths (`YYYY-MM-DD`).
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Time-of-day layout stored in plate records (`HH:MM:SS`).
pub const TIME_FORMAT: &str = "%H:%M:%S";

// ----------------------------------------------------------------------------
// StopSignal
// ----------------------------------------------------------------------------

/// Process-wide cooperative stop flag.
///
/// Monotone: once set it stays set. Every clone observes the same flag.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns true only for the call that flipped it.
    pub fn trigger(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Store events and records
// ----------------------------------------------------------------------------

/// Item carried by the write queue from the stream loops to the write worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// A plate reading that differs from the previous one on this stream.
    PlateRecognized { plate: String, at: NaiveDateTime },
    /// A bag identity entered the ROI; `total` is the running count after it.
    BagCounted { total: u64, at: NaiveDateTime },
}

impl StoreEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreEvent::PlateRecognized { .. } => "plate_recognized",
            StoreEvent::BagCounted { .. } => "bag_counted",
        }
    }
}

/// Stored value under `license_plates/{date}/plate:{key}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateRecord {
    pub plate: String,
    pub bag: u64,
    pub timestamp: String,
}

impl PlateRecord {
    pub fn new(plate: impl Into<String>, at: NaiveDateTime) -> Self {
        Self {
            plate: plate.into(),
            bag: 0,
            timestamp: format_time(at),
        }
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn format_time(at: NaiveDateTime) -> String {
    at.format(TIME_FORMAT).to_string()
}

/// `license_plates/{YYYY-MM-DD}`
pub fn plate_day_path(date: NaiveDate) -> String {
    format!("{}/{}", PLATES_ROOT, format_date(date))
}

/// `license_plates/{YYYY-MM-DD}/plate:{key}`
pub fn plate_path(date: NaiveDate, plate: &str) -> String {
    format!("{}/plate:{}", plate_day_path(date), plate_key(plate))
}

/// How a bounded join ended.
#[derive(Debug)]
pub(crate) enum JoinOutcome<T> {
    Finished(T),
    Panicked,
    /// Still running at the deadline; the thread is detached and abandoned.
    Overran,
}

impl<T> JoinOutcome<T> {
    /// Log anything but a clean finish under `what`, keeping the value if any.
    pub(crate) fn into_report(self, what: &str, timeout: Duration) -> Option<T> {
        match self {
            JoinOutcome::Finished(value) => Some(value),
            JoinOutcome::Panicked => {
                log::error!("{}: thread panicked", what);
                None
            }
            JoinOutcome::Overran => {
                log::warn!(
                    "{}: did not finish within {} ms; abandoning",
                    what,
                    timeout.as_millis()
                );
                None
            }
        }
    }
}

/// Join `handle` if its thread finishes within `timeout`.
pub(crate) fn join_bounded<T>(handle: JoinHandle<T>, timeout: Duration) -> JoinOutcome<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return JoinOutcome::Overran;
        }
        thread::sleep(Duration::from_millis(10));
    }
    match handle.join() {
        Ok(value) => JoinOutcome::Finished(value),
        Err(_) => JoinOutcome::Panicked,
    }
}
