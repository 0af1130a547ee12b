//! Stream processing loops.
//!
//! A `StreamLoop` drives one `VideoSource` through one `FrameStage`:
//!
//! ```text
//! Opening -> Reading -> (Processing -> Emitting)* -> Closed
//! ```
//!
//! - Open failure closes this loop only.
//! - A stage error or panic drops that frame; the loop keeps reading.
//! - Annotated frames go to the stream's `FrameRelay` without waiting.
//! - The source is released on every exit path, including unwinding.

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDateTime};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::frame::{Frame, FrameRelay};
use crate::ingest::VideoSource;
use crate::writer::EventSink;
use crate::StopSignal;

mod bags;
mod plate;

pub use bags::{BagStage, DEFAULT_BAG_CONFIDENCE};
pub use plate::{PlateSettings, PlateStage, DEFAULT_PLATE_CONFIDENCE, DEFAULT_RESIZE_RATIO};

/// Clock readings taken once per frame.
#[derive(Clone, Copy, Debug)]
pub struct Tick {
    /// Monotonic time, for cooldowns.
    pub instant: Instant,
    /// Local wall-clock time, for stored timestamps.
    pub wall: NaiveDateTime,
}

impl Tick {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Local::now().naive_local(),
        }
    }
}

/// Per-stream frame transformation.
pub trait FrameStage: Send {
    fn name(&self) -> &'static str;

    /// Analyse one frame, emit any store events, and return the annotated frame.
    fn process(&mut self, frame: Frame, tick: &Tick, sink: &dyn EventSink) -> Result<Frame>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Opening,
    Reading,
    Processing,
    Emitting,
    Closed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Opening => "OPENING",
            LoopState::Reading => "READING",
            LoopState::Processing => "PROCESSING",
            LoopState::Emitting => "EMITTING",
            LoopState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopExit {
    EndOfStream,
    Stopped,
    OpenFailed(String),
    ReadFailed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopReport {
    pub name: String,
    pub frames_read: u64,
    pub frames_emitted: u64,
    pub frames_dropped: u64,
    pub exit: LoopExit,
}

// ----------------------------------------------------------------------------
// StreamLoop
// ----------------------------------------------------------------------------

pub struct StreamLoop {
    name: String,
    source: Box<dyn VideoSource>,
    stage: Box<dyn FrameStage>,
    relay: Arc<FrameRelay>,
    sink: Arc<dyn EventSink>,
    stop: StopSignal,
}

/// Releases the source when the loop ends, however it ends.
struct SourceGuard {
    source: Box<dyn VideoSource>,
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.source.release();
    }
}

impl StreamLoop {
    pub fn new(
        name: impl Into<String>,
        source: Box<dyn VideoSource>,
        stage: Box<dyn FrameStage>,
        relay: Arc<FrameRelay>,
        sink: Arc<dyn EventSink>,
        stop: StopSignal,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            stage,
            relay,
            sink,
            stop,
        }
    }

    /// Run on a dedicated, named OS thread.
    pub fn spawn(self) -> Result<LoopHandle> {
        let name = self.name.clone();
        let thread = thread::Builder::new()
            .name(format!("{}-loop", name))
            .spawn(move || self.run())
            .map_err(|e| anyhow!("failed to spawn {} loop: {}", name, e))?;
        Ok(LoopHandle { name, thread })
    }

    /// Run to completion on the calling thread.
    pub fn run(self) -> LoopReport {
        let StreamLoop {
            name,
            source,
            mut stage,
            relay,
            sink,
            stop,
        } = self;
        let mut report = LoopReport {
            name: name.clone(),
            frames_read: 0,
            frames_emitted: 0,
            frames_dropped: 0,
            exit: LoopExit::Stopped,
        };
        let mut state = LoopState::Opening;
        log::debug!("{}: {}", name, state);

        let mut guard = SourceGuard { source };
        if let Err(e) = guard.source.open() {
            log::error!(
                "{}: cannot open {}: {:#}",
                name,
                guard.source.describe(),
                e
            );
            report.exit = LoopExit::OpenFailed(format!("{:#}", e));
            transition(&name, &mut state, LoopState::Closed);
            return report;
        }
        log::info!(
            "{}: streaming from {} through {}",
            name,
            guard.source.describe(),
            stage.name()
        );

        loop {
            transition(&name, &mut state, LoopState::Reading);
            if stop.is_set() {
                report.exit = LoopExit::Stopped;
                break;
            }
            let frame = match guard.source.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    report.exit = LoopExit::EndOfStream;
                    break;
                }
                Err(e) => {
                    log::warn!("{}: read failed: {:#}", name, e);
                    report.exit = LoopExit::ReadFailed(format!("{:#}", e));
                    break;
                }
            };
            report.frames_read += 1;

            transition(&name, &mut state, LoopState::Processing);
            let tick = Tick::now();
            let sequence = frame.sequence();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                stage.process(frame, &tick, sink.as_ref())
            }));
            match outcome {
                Ok(Ok(annotated)) => {
                    transition(&name, &mut state, LoopState::Emitting);
                    relay.put(annotated);
                    report.frames_emitted += 1;
                }
                Ok(Err(e)) => {
                    report.frames_dropped += 1;
                    log::warn!("{}: dropping frame {}: {:#}", name, sequence, e);
                }
                Err(_) => {
                    report.frames_dropped += 1;
                    log::error!("{}: stage panicked on frame {}; dropping it", name, sequence);
                }
            }
        }

        transition(&name, &mut state, LoopState::Closed);
        drop(guard);
        log::info!(
            "{}: closed ({:?}) read={} emitted={} dropped={}",
            name,
            report.exit,
            report.frames_read,
            report.frames_emitted,
            report.frames_dropped
        );
        report
    }
}

fn transition(name: &str, state: &mut LoopState, next: LoopState) {
    if *state != next {
        log::debug!("{}: {} -> {}", name, state, next);
        *state = next;
    }
}

// ----------------------------------------------------------------------------
// LoopHandle
// ----------------------------------------------------------------------------

pub struct LoopHandle {
    name: String,
    thread: JoinHandle<LoopReport>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait at most `timeout`. `None` means the loop panicked or was abandoned.
    pub fn join_timeout(self, timeout: Duration) -> Option<LoopReport> {
        crate::join_bounded(self.thread, timeout).into_report(&self.name, timeout)
    }
}
