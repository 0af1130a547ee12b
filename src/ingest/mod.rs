//! Video sources.
//!
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Synthetic `stub://` scenes for tests and dry runs
//!
//! A source is opened once, read until it reports end of stream, and released
//! exactly once. Sources number their frames from 1 in arrival order.

use anyhow::Result;

use crate::frame::Frame;

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
mod synthetic;

pub use file::{FileConfig, FileSource};
pub use synthetic::ScenePattern;

/// Frame producer driven by a stream loop.
pub trait VideoSource: Send {
    /// Human-readable origin, for logs.
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<()>;

    /// Next frame, `Ok(None)` at end of stream.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Free decoder resources. Safe to call more than once.
    fn release(&mut self);
}
