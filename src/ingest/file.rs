//! Local file video source.
//!
//! `FileSource` reads frames from a local video file or a synthetic
//! `stub://` scene. Remote URLs are rejected; network cameras are expected
//! to be recorded or proxied to a local path first.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::synthetic::{SceneParams, SyntheticSource};
use super::VideoSource;
use crate::frame::Frame;

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local file path (e.g., "/var/lib/ice-tracker/belt.mp4") or `stub://...`.
    pub path: String,
    /// Pace reads to this rate. 0 reads as fast as the decoder allows.
    pub target_fps: u32,
}

impl FileConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target_fps: 0,
        }
    }

    pub fn with_fps(mut self, target_fps: u32) -> Self {
        self.target_fps = target_fps;
        self
    }
}

/// Local file frame source.
pub struct FileSource {
    config: FileConfig,
    backend: Option<FileBackend>,
    frames_read: u64,
    last_frame_at: Option<Instant>,
}

enum FileBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths or stub:// (got '{}')",
                config.path
            ));
        }
        Ok(Self {
            config,
            backend: None,
            frames_read: 0,
            last_frame_at: None,
        })
    }

    pub fn stats(&self) -> FileStats {
        FileStats {
            frames_read: self.frames_read,
            path: self.config.path.clone(),
        }
    }

    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / self.config.target_fps as f64);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }
}

impl VideoSource for FileSource {
    fn describe(&self) -> String {
        self.config.path.clone()
    }

    fn open(&mut self) -> Result<()> {
        if self.config.path.starts_with("stub://") {
            let scene = SceneParams::parse(&self.config.path)?;
            log::info!(
                "FileSource: opened {} (synthetic, {} frames {}x{})",
                self.config.path,
                scene.frames,
                scene.width,
                scene.height
            );
            self.backend = Some(FileBackend::Synthetic(SyntheticSource::new(scene)));
            return Ok(());
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            self.backend = Some(FileBackend::Ffmpeg(FfmpegFileSource::open(
                &self.config.path,
            )?));
            log::info!("FileSource: opened {} (ffmpeg)", self.config.path);
            Ok(())
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!(
                "cannot open '{}': file ingestion requires the ingest-file-ffmpeg feature",
                self.config.path
            ))
        }
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let frame = match self.backend.as_mut() {
            None => return Err(anyhow!("{} is not open", self.config.path)),
            Some(FileBackend::Synthetic(source)) => source.next_frame()?,
            #[cfg(feature = "ingest-file-ffmpeg")]
            Some(FileBackend::Ffmpeg(source)) => source.next_frame()?,
        };
        if frame.is_some() {
            self.frames_read += 1;
            self.pace();
        }
        Ok(frame)
    }

    fn release(&mut self) {
        if let Some(backend) = self.backend.take() {
            let produced = match &backend {
                FileBackend::Synthetic(source) => source.produced(),
                #[cfg(feature = "ingest-file-ffmpeg")]
                FileBackend::Ffmpeg(source) => source.frames_decoded(),
            };
            log::debug!(
                "FileSource: released {} after {} frames",
                self.config.path,
                produced
            );
        }
    }
}

/// Statistics for a file source.
#[derive(Clone, Debug)]
pub struct FileStats {
    pub frames_read: u64,
    pub path: String,
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_remote_urls() {
        assert!(FileSource::new(FileConfig::new("rtsp://cam/stream")).is_err());
        assert!(FileSource::new(FileConfig::new("")).is_err());
        assert!(FileSource::new(FileConfig::new("/data/belt.mp4")).is_ok());
    }

    #[test]
    fn read_before_open_fails() {
        let mut source = FileSource::new(FileConfig::new("stub://x?frames=1")).unwrap();
        assert!(source.read().is_err());
    }

    #[test]
    fn stub_source_reads_to_end() {
        let mut source =
            FileSource::new(FileConfig::new("stub://x?frames=2&width=120&height=90")).unwrap();
        source.open().unwrap();
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_none());
        assert_eq!(source.stats().frames_read, 2);
        source.release();
        source.release();
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    #[test]
    fn local_files_need_ffmpeg_feature() {
        let mut source = FileSource::new(FileConfig::new("/data/belt.mp4")).unwrap();
        assert!(source.open().is_err());
    }

    #[test]
    fn pacing_limits_rate() {
        let mut source = FileSource::new(
            FileConfig::new("stub://x?frames=3&width=120&height=90").with_fps(20),
        )
        .unwrap();
        source.open().unwrap();
        let started = Instant::now();
        while source.read().unwrap().is_some() {}
        assert!(started.elapsed() >= Duration::from_millis(90));
    }
}
