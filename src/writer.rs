//! Background write worker.
//!
//! Stream loops hand `StoreEvent`s to a `WriteQueue`, which never blocks.
//! One worker thread drains the queue in FIFO order, turns each event into
//! store writes through the `PlateLedger`, and attempts every write once.
//! A failed write is logged and dropped; later events are unaffected.

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::storage::EventStore;
use crate::{format_time, plate_path, PlateRecord, StoreEvent, TOTAL_COUNT_PATH};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Non-blocking destination for store events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StoreEvent);
}

// ----------------------------------------------------------------------------
// Counters
// ----------------------------------------------------------------------------

#[derive(Default)]
struct WriterCounters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    writes_ok: AtomicU64,
    writes_failed: AtomicU64,
}

/// Snapshot of the worker's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub enqueued: u64,
    /// Events offered after the worker had gone away.
    pub rejected: u64,
    pub processed: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
}

impl WriterCounters {
    fn snapshot(&self) -> WriterStats {
        WriterStats {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            writes_ok: self.writes_ok.load(Ordering::SeqCst),
            writes_failed: self.writes_failed.load(Ordering::SeqCst),
        }
    }
}

// ----------------------------------------------------------------------------
// WriteQueue
// ----------------------------------------------------------------------------

/// Producer handle for the worker's unbounded FIFO. Cheap to clone.
#[derive(Clone)]
pub struct WriteQueue {
    tx: Sender<StoreEvent>,
    counters: Arc<WriterCounters>,
}

impl WriteQueue {
    /// Append an event. Returns immediately whatever the store is doing.
    pub fn enqueue(&self, event: StoreEvent) {
        self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::SendError(event)) = self.tx.send(event) {
            self.counters.enqueued.fetch_sub(1, Ordering::SeqCst);
            self.counters.rejected.fetch_add(1, Ordering::SeqCst);
            log::debug!("write queue closed; dropping {} event", event.kind());
        }
    }

    pub fn stats(&self) -> WriterStats {
        self.counters.snapshot()
    }

    /// Wait until every enqueued event has been processed. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let stats = self.counters.snapshot();
            if stats.processed >= stats.enqueued {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl EventSink for WriteQueue {
    fn emit(&self, event: StoreEvent) {
        self.enqueue(event);
    }
}

// ----------------------------------------------------------------------------
// Plate ledger
// ----------------------------------------------------------------------------

/// One store mutation planned for an event.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreWrite {
    Set { path: String, value: Value },
    Merge { path: String, fields: Map<String, Value> },
}

impl StoreWrite {
    pub fn path(&self) -> &str {
        match self {
            StoreWrite::Set { path, .. } | StoreWrite::Merge { path, .. } => path,
        }
    }

    fn apply(&self, store: &dyn EventStore) -> Result<()> {
        match self {
            StoreWrite::Set { path, value } => store.write(path, value),
            StoreWrite::Merge { path, fields } => store.update(path, fields),
        }
    }
}

#[derive(Clone, Debug)]
struct ActivePlate {
    plate: String,
    date: NaiveDate,
    path: String,
    baseline: u64,
}

/// Worker-owned state mapping events to set/update writes.
///
/// At most one plate is active. A new distinct plate (or a new day) gets a
/// fresh record with `bag: 0`; the previous plate's record is left alone.
/// Bags counted while a plate is active are attributed to it as
/// `total - total_at_activation`.
#[derive(Debug, Default)]
pub struct PlateLedger {
    active: Option<ActivePlate>,
    total: u64,
}

impl PlateLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_plate(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.plate.as_str())
    }

    pub fn plan(&mut self, event: &StoreEvent) -> Vec<StoreWrite> {
        match event {
            StoreEvent::PlateRecognized { plate, at } => {
                let date = at.date();
                if let Some(active) = &self.active {
                    if active.plate == *plate && active.date == date {
                        return vec![StoreWrite::Merge {
                            path: active.path.clone(),
                            fields: timestamp_fields(format_time(*at)),
                        }];
                    }
                }
                let path = plate_path(date, plate);
                let record = PlateRecord::new(plate.clone(), *at);
                self.active = Some(ActivePlate {
                    plate: plate.clone(),
                    date,
                    path: path.clone(),
                    baseline: self.total,
                });
                vec![StoreWrite::Set {
                    path,
                    value: json!(record),
                }]
            }
            StoreEvent::BagCounted { total, at } => {
                self.total = self.total.max(*total);
                let mut writes = vec![StoreWrite::Set {
                    path: TOTAL_COUNT_PATH.to_string(),
                    value: json!(self.total),
                }];
                if let Some(active) = &self.active {
                    let mut fields = timestamp_fields(format_time(*at));
                    fields.insert(
                        "bag".to_string(),
                        json!(self.total.saturating_sub(active.baseline)),
                    );
                    writes.push(StoreWrite::Merge {
                        path: active.path.clone(),
                        fields,
                    });
                }
                writes
            }
        }
    }
}

fn timestamp_fields(timestamp: String) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("timestamp".to_string(), Value::String(timestamp));
    fields
}

// ----------------------------------------------------------------------------
// WriteWorker
// ----------------------------------------------------------------------------

pub struct WriteWorker {
    rx: Receiver<StoreEvent>,
    store: Arc<dyn EventStore>,
    counters: Arc<WriterCounters>,
    ledger: PlateLedger,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
    drain_ms: Arc<AtomicU64>,
}

/// Owner handle for a running worker.
pub struct WriteWorkerHandle {
    thread: Option<JoinHandle<()>>,
    counters: Arc<WriterCounters>,
    stop: Arc<AtomicBool>,
    drain_ms: Arc<AtomicU64>,
    poll_interval: Duration,
}

impl WriteWorker {
    /// Start the worker thread. Returns the producer queue and the owner handle.
    pub fn spawn(
        store: Arc<dyn EventStore>,
        poll_interval: Duration,
    ) -> Result<(WriteQueue, WriteWorkerHandle)> {
        let (tx, rx) = mpsc::channel();
        let counters = Arc::new(WriterCounters::default());
        let stop = Arc::new(AtomicBool::new(false));
        let drain_ms = Arc::new(AtomicU64::new(0));
        let worker = WriteWorker {
            rx,
            store,
            counters: Arc::clone(&counters),
            ledger: PlateLedger::new(),
            poll_interval,
            stop: Arc::clone(&stop),
            drain_ms: Arc::clone(&drain_ms),
        };
        let thread = thread::Builder::new()
            .name("write-worker".to_string())
            .spawn(move || worker.run())
            .map_err(|e| anyhow!("failed to spawn write worker: {}", e))?;
        log::info!(
            "write worker started (poll {} ms)",
            poll_interval.as_millis()
        );
        Ok((
            WriteQueue {
                tx,
                counters: Arc::clone(&counters),
            },
            WriteWorkerHandle {
                thread: Some(thread),
                counters,
                stop,
                drain_ms,
                poll_interval,
            },
        ))
    }

    fn run(mut self) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                self.drain();
                break;
            }
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    log::debug!("write queue disconnected; worker exiting");
                    break;
                }
            }
        }
        let stats = self.counters.snapshot();
        log::info!(
            "write worker stopped: processed={} ok={} failed={} pending={}",
            stats.processed,
            stats.writes_ok,
            stats.writes_failed,
            stats.enqueued.saturating_sub(stats.processed)
        );
    }

    fn drain(&mut self) {
        let deadline =
            Instant::now() + Duration::from_millis(self.drain_ms.load(Ordering::SeqCst));
        while Instant::now() < deadline {
            match self.rx.try_recv() {
                Ok(event) => self.handle(event),
                Err(_) => break,
            }
        }
    }

    fn handle(&mut self, event: StoreEvent) {
        for write in self.ledger.plan(&event) {
            match write.apply(self.store.as_ref()) {
                Ok(()) => {
                    self.counters.writes_ok.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    self.counters.writes_failed.fetch_add(1, Ordering::SeqCst);
                    log::warn!(
                        "store write to {} failed ({}); dropping: {:#}",
                        write.path(),
                        event.kind(),
                        e
                    );
                }
            }
        }
        self.counters.processed.fetch_add(1, Ordering::SeqCst);
    }
}

impl WriteWorkerHandle {
    pub fn stats(&self) -> WriterStats {
        self.counters.snapshot()
    }

    /// Stop the worker, draining what is queued for at most `drain_timeout`.
    ///
    /// Returns once the thread exits or the bound passes; an overrunning
    /// worker is abandoned.
    pub fn stop(mut self, drain_timeout: Duration) -> WriterStats {
        self.drain_ms
            .store(drain_timeout.as_millis() as u64, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let bound = drain_timeout + self.poll_interval + Duration::from_millis(250);
            crate::join_bounded(thread, bound).into_report("write worker", bound);
        }
        self.counters.snapshot()
    }
}

impl Drop for WriteWorkerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryEventStore, StoreOp};
    use chrono::NaiveDateTime;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn plate(text: &str, when: NaiveDateTime) -> StoreEvent {
        StoreEvent::PlateRecognized {
            plate: text.to_string(),
            at: when,
        }
    }

    fn bag(total: u64, when: NaiveDateTime) -> StoreEvent {
        StoreEvent::BagCounted { total, at: when }
    }

    #[test]
    fn ledger_sets_new_plate_and_merges_repeat() {
        let mut ledger = PlateLedger::new();
        let first = ledger.plan(&plate("51A-123.45", at(8, 0, 0)));
        assert_eq!(
            first,
            vec![StoreWrite::Set {
                path: "license_plates/2024-05-01/plate:51A-123_45".into(),
                value: json!({"plate": "51A-123.45", "bag": 0, "timestamp": "08:00:00"}),
            }]
        );
        let again = ledger.plan(&plate("51A-123.45", at(8, 0, 5)));
        assert_eq!(
            again,
            vec![StoreWrite::Merge {
                path: "license_plates/2024-05-01/plate:51A-123_45".into(),
                fields: timestamp_fields("08:00:05".into()),
            }]
        );
    }

    #[test]
    fn ledger_attributes_bags_since_activation() {
        let mut ledger = PlateLedger::new();
        assert_eq!(ledger.plan(&bag(1, at(7, 0, 0))).len(), 1);
        ledger.plan(&plate("A", at(8, 0, 0)));
        let writes = ledger.plan(&bag(2, at(8, 1, 0)));
        assert_eq!(writes.len(), 2);
        assert_eq!(
            writes[0],
            StoreWrite::Set {
                path: TOTAL_COUNT_PATH.into(),
                value: json!(2)
            }
        );
        let StoreWrite::Merge { fields, .. } = &writes[1] else {
            panic!("expected merge");
        };
        assert_eq!(fields.get("bag"), Some(&json!(1)));
        assert_eq!(fields.get("timestamp"), Some(&json!("08:01:00")));
        assert!(fields.get("plate").is_none());

        ledger.plan(&plate("B", at(9, 0, 0)));
        let writes = ledger.plan(&bag(3, at(9, 0, 1)));
        let StoreWrite::Merge { path, fields } = &writes[1] else {
            panic!("expected merge");
        };
        assert_eq!(path, "license_plates/2024-05-01/plate:B");
        assert_eq!(fields.get("bag"), Some(&json!(1)));
    }

    #[test]
    fn ledger_starts_new_record_on_new_day() {
        let mut ledger = PlateLedger::new();
        ledger.plan(&plate("A", at(23, 59, 59)));
        let next_day = NaiveDate::from_ymd_opt(2024, 5, 2)
            .unwrap()
            .and_hms_opt(0, 0, 1)
            .unwrap();
        let writes = ledger.plan(&plate("A", next_day));
        assert!(matches!(
            &writes[0],
            StoreWrite::Set { path, .. } if path == "license_plates/2024-05-02/plate:A"
        ));
    }

    #[test]
    fn worker_writes_in_fifo_order() {
        let store = InMemoryEventStore::new();
        let (queue, handle) =
            WriteWorker::spawn(Arc::new(store.clone()), Duration::from_millis(20)).unwrap();
        queue.enqueue(plate("A", at(8, 0, 0)));
        queue.enqueue(bag(1, at(8, 0, 1)));
        queue.enqueue(plate("A", at(8, 0, 2)));
        assert!(queue.wait_idle(Duration::from_secs(2)));
        let stats = handle.stop(Duration::from_millis(100));
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.writes_ok, 4);
        assert_eq!(
            store.operations(),
            vec![
                StoreOp::Write("license_plates/2024-05-01/plate:A".into()),
                StoreOp::Write("total_count".into()),
                StoreOp::Update("license_plates/2024-05-01/plate:A".into()),
                StoreOp::Update("license_plates/2024-05-01/plate:A".into()),
            ]
        );
        assert_eq!(
            store.read("license_plates/2024-05-01/plate:A").unwrap(),
            Some(json!({"plate": "A", "bag": 1, "timestamp": "08:00:02"}))
        );
    }

    #[test]
    fn failed_write_is_dropped_not_retried() {
        let store = InMemoryEventStore::new();
        store.fail_next(1);
        let (queue, handle) =
            WriteWorker::spawn(Arc::new(store.clone()), Duration::from_millis(20)).unwrap();
        queue.enqueue(bag(1, at(8, 0, 0)));
        queue.enqueue(bag(2, at(8, 0, 1)));
        assert!(queue.wait_idle(Duration::from_secs(2)));
        let stats = handle.stop(Duration::from_millis(100));
        assert_eq!(stats.writes_failed, 1);
        assert_eq!(stats.writes_ok, 1);
        assert_eq!(store.operations().len(), 1);
        assert_eq!(store.read("total_count").unwrap(), Some(json!(2)));
    }

    #[test]
    fn enqueue_does_not_wait_for_slow_store() {
        let store = InMemoryEventStore::new();
        store.set_latency(Duration::from_millis(200));
        let (queue, handle) =
            WriteWorker::spawn(Arc::new(store.clone()), Duration::from_millis(20)).unwrap();
        let started = Instant::now();
        for total in 1..=20 {
            queue.enqueue(bag(total, at(8, 0, 0)));
        }
        assert!(started.elapsed() < Duration::from_millis(150));
        let stats = handle.stop(Duration::ZERO);
        assert_eq!(stats.enqueued, 20);
        assert!(stats.processed < 20);
    }

    #[test]
    fn enqueue_after_worker_exit_is_rejected() {
        let store = InMemoryEventStore::new();
        let (queue, handle) =
            WriteWorker::spawn(Arc::new(store), Duration::from_millis(10)).unwrap();
        handle.stop(Duration::ZERO);
        queue.enqueue(bag(1, at(8, 0, 0)));
        let stats = queue.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.enqueued, 0);
    }
}
