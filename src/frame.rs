//! Frames and the single-slot frame relay.
//!
//! - `Frame`: Immutable RGB raster plus a per-stream sequence number.
//! - `FrameRelay`: Latest-wins mailbox between one stream loop and the display.
//! - `RelayView`: Consumer side that remembers the last frame it showed.
//!
//! A producer never waits on the relay. A consumer waits at most its timeout.

use image::{imageops, RgbImage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::detect::BoundingBox;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Captured or annotated frame. Cloning shares the pixel buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    image: Arc<RgbImage>,
    sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image: Arc::new(image),
            sequence,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Arrival order within the stream that produced the frame.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Replace the pixels, keeping the sequence number.
    pub fn with_image(&self, image: RgbImage) -> Frame {
        Frame::new(image, self.sequence)
    }

    /// Copy out a region. `None` when the box falls outside the frame.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<RgbImage> {
        let clamped = bbox.clamp_to(self.width(), self.height())?;
        let x = clamped.x1 as u32;
        let y = clamped.y1 as u32;
        let w = (clamped.width() as u32).min(self.width() - x);
        let h = (clamped.height() as u32).min(self.height() - y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(imageops::crop_imm(self.image.as_ref(), x, y, w, h).to_image())
    }
}

// ----------------------------------------------------------------------------
// FrameRelay
// ----------------------------------------------------------------------------

#[derive(Default)]
struct RelaySlot {
    frame: Option<Frame>,
    newest: Option<u64>,
}

/// Snapshot of a relay's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub put: u64,
    pub overwritten: u64,
    pub stale: u64,
    pub taken: u64,
}

/// Single-slot, overwrite-on-full frame handoff.
///
/// `put` replaces whatever is waiting; `get` takes it. A frame older than one
/// already put is discarded so the consumer never sees a stream go backwards.
pub struct FrameRelay {
    name: String,
    slot: Mutex<RelaySlot>,
    ready: Condvar,
    put: AtomicU64,
    overwritten: AtomicU64,
    stale: AtomicU64,
    taken: AtomicU64,
}

impl FrameRelay {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: Mutex::new(RelaySlot::default()),
            ready: Condvar::new(),
            put: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            taken: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a frame. Never blocks beyond the slot lock.
    pub fn put(&self, frame: Frame) {
        let mut slot = self.lock();
        if slot.newest.is_some_and(|newest| frame.sequence() <= newest) {
            self.stale.fetch_add(1, Ordering::Relaxed);
            return;
        }
        slot.newest = Some(frame.sequence());
        if slot.frame.replace(frame).is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.put.fetch_add(1, Ordering::Relaxed);
        drop(slot);
        self.ready.notify_one();
    }

    /// Take the waiting frame, waiting at most `timeout` for one to arrive.
    pub fn get(&self, timeout: Duration) -> Option<Frame> {
        let slot = self.lock();
        let (mut slot, _) = match self
            .ready
            .wait_timeout_while(slot, timeout, |slot| slot.frame.is_none())
        {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        let frame = slot.frame.take();
        if frame.is_some() {
            self.taken.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            put: self.put.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            taken: self.taken.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelaySlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// RelayView
// ----------------------------------------------------------------------------

/// Display-side reader of one relay that keeps the last frame it retrieved.
pub struct RelayView {
    relay: Arc<FrameRelay>,
    last: Option<Frame>,
}

impl RelayView {
    pub fn new(relay: Arc<FrameRelay>) -> Self {
        Self { relay, last: None }
    }

    /// Poll for a newer frame; falls back to the last one seen.
    pub fn poll(&mut self, timeout: Duration) -> Option<&Frame> {
        if let Some(frame) = self.relay.get(timeout) {
            self.last = Some(frame);
        }
        self.last.as_ref()
    }

    pub fn last(&self) -> Option<&Frame> {
        self.last.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn frame(seq: u64) -> Frame {
        Frame::new(RgbImage::new(4, 4), seq)
    }

    #[test]
    fn get_returns_none_within_timeout_when_empty() {
        let relay = FrameRelay::new("test");
        let started = Instant::now();
        assert!(relay.get(Duration::from_millis(50)).is_none());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(40));
        assert!(waited < Duration::from_millis(1000));
    }

    #[test]
    fn put_overwrites_and_get_takes_latest() {
        let relay = FrameRelay::new("test");
        relay.put(frame(1));
        relay.put(frame(2));
        relay.put(frame(3));
        let got = relay.get(Duration::from_millis(10)).unwrap();
        assert_eq!(got.sequence(), 3);
        assert!(relay.get(Duration::from_millis(10)).is_none());
        let stats = relay.stats();
        assert_eq!(stats.put, 3);
        assert_eq!(stats.overwritten, 2);
        assert_eq!(stats.taken, 1);
    }

    #[test]
    fn older_frames_are_discarded() {
        let relay = FrameRelay::new("test");
        relay.put(frame(5));
        assert_eq!(relay.get(Duration::ZERO).unwrap().sequence(), 5);
        relay.put(frame(4));
        assert!(relay.get(Duration::ZERO).is_none());
        assert_eq!(relay.stats().stale, 1);
    }

    #[test]
    fn consumer_sees_monotonic_sequences() {
        let relay = Arc::new(FrameRelay::new("test"));
        let producer = {
            let relay = Arc::clone(&relay);
            thread::spawn(move || {
                for seq in 1..=500 {
                    relay.put(frame(seq));
                }
            })
        };
        let mut last = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while last < 500 && Instant::now() < deadline {
            if let Some(f) = relay.get(Duration::from_millis(20)) {
                assert!(f.sequence() > last);
                last = f.sequence();
            }
        }
        producer.join().unwrap();
        assert_eq!(last, 500);
    }

    #[test]
    fn get_wakes_on_put() {
        let relay = Arc::new(FrameRelay::new("test"));
        let waiter = {
            let relay = Arc::clone(&relay);
            thread::spawn(move || relay.get(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        relay.put(frame(1));
        assert_eq!(waiter.join().unwrap().unwrap().sequence(), 1);
    }

    #[test]
    fn view_reuses_last_frame() {
        let relay = Arc::new(FrameRelay::new("test"));
        let mut view = RelayView::new(Arc::clone(&relay));
        assert!(view.poll(Duration::ZERO).is_none());
        relay.put(frame(7));
        assert_eq!(view.poll(Duration::ZERO).unwrap().sequence(), 7);
        assert_eq!(view.poll(Duration::ZERO).unwrap().sequence(), 7);
    }

    #[test]
    fn crop_clamps_to_frame() {
        let f = Frame::new(RgbImage::new(10, 10), 1);
        let crop = f.crop(&BoundingBox::new(5.0, 5.0, 20.0, 20.0)).unwrap();
        assert_eq!(crop.dimensions(), (5, 5));
        assert!(f.crop(&BoundingBox::new(20.0, 20.0, 30.0, 30.0)).is_none());
    }
}
