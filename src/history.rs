//! Dashboard queries over stored plate records.
//!
//! Plate records live under `license_plates/{date}`, one node per plate.
//! `fetch_plate_history` flattens a window of days into rows; the running
//! bag total is read or watched at `total_count`.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::storage::{EventStore, Subscription};
use crate::{format_date, plate_day_path, PlateRecord, TOTAL_COUNT_PATH};

/// One plate record with the day it was stored under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlateRow {
    pub date: String,
    pub plate: String,
    pub bag: u64,
    pub timestamp: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HistorySummary {
    pub plates: usize,
    pub bags: u64,
}

/// Plate rows for `today` and the `days - 1` days before it.
///
/// Days that fail to read or hold nothing are skipped. Rows come back
/// ordered by date, then timestamp.
pub fn fetch_plate_history(store: &dyn EventStore, today: NaiveDate, days: u32) -> Vec<PlateRow> {
    let mut rows = Vec::new();
    for offset in 0..days {
        let date = today - ChronoDuration::days(i64::from(offset));
        let path = plate_day_path(date);
        match store.read(&path) {
            Ok(Some(value)) => rows.extend(flatten_day(&format_date(date), &value)),
            Ok(None) => log::debug!("history: nothing under {}", path),
            Err(e) => log::warn!("history: read {} failed: {:#}", path, e),
        }
    }
    rows.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
    rows
}

fn flatten_day(date: &str, day: &Value) -> Vec<PlateRow> {
    let Value::Object(entries) = day else {
        log::warn!("history: {} is not an object", date);
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|(key, entry)| {
            match serde_json::from_value::<PlateRecord>(entry.clone()) {
                Ok(record) => Some(PlateRow {
                    date: date.to_string(),
                    plate: record.plate,
                    bag: record.bag,
                    timestamp: record.timestamp,
                }),
                Err(e) => {
                    log::debug!("history: skipping {}/{}: {}", date, key, e);
                    None
                }
            }
        })
        .collect()
}

/// Current `total_count`, `None` when unset or not a non-negative integer.
pub fn read_total_count(store: &dyn EventStore) -> Result<Option<u64>> {
    Ok(store.read(TOTAL_COUNT_PATH)?.as_ref().and_then(Value::as_u64))
}

/// Invoke `callback` for every integer value written to `total_count`.
pub fn watch_total_count<F>(store: &dyn EventStore, callback: F) -> Result<Subscription>
where
    F: Fn(u64) + Send + Sync + 'static,
{
    store.subscribe(
        TOTAL_COUNT_PATH,
        Arc::new(move |value: Option<Value>| {
            if let Some(total) = value.as_ref().and_then(Value::as_u64) {
                callback(total);
            }
        }),
    )
}

pub fn summarize(rows: &[PlateRow]) -> HistorySummary {
    HistorySummary {
        plates: rows.len(),
        bags: rows.iter().map(|row| row.bag).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryEventStore;
    use serde_json::json;
    use std::sync::Mutex;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[test]
    fn flattens_days_and_sorts() {
        let store = InMemoryEventStore::new();
        store
            .write(
                "license_plates/2024-05-03",
                &json!({
                    "plate:29B-999_99": {"plate": "29B-999.99", "bag": 4, "timestamp": "10:15:00"},
                    "plate:51A-123_45": {"plate": "51A-123.45", "bag": 2, "timestamp": "08:00:01"},
                }),
            )
            .unwrap();
        store
            .write(
                "license_plates/2024-05-01/plate:77C-000_01",
                &json!({"plate": "77C-000.01", "bag": 1, "timestamp": "23:59:59"}),
            )
            .unwrap();
        store
            .write("license_plates/2024-05-02/plate:broken", &json!("oops"))
            .unwrap();

        let rows = fetch_plate_history(&store, date(3), 3);
        let plates: Vec<&str> = rows.iter().map(|r| r.plate.as_str()).collect();
        assert_eq!(plates, vec!["77C-000.01", "51A-123.45", "29B-999.99"]);
        assert_eq!(rows[0].date, "2024-05-01");
        assert_eq!(
            summarize(&rows),
            HistorySummary {
                plates: 3,
                bags: 7
            }
        );
    }

    #[test]
    fn window_excludes_older_days_and_skips_failures() {
        let store = InMemoryEventStore::new();
        store
            .write(
                "license_plates/2024-05-01/plate:A",
                &json!({"plate": "A", "bag": 1, "timestamp": "09:00:00"}),
            )
            .unwrap();
        store
            .write(
                "license_plates/2024-05-02/plate:B",
                &json!({"plate": "B", "bag": 3, "timestamp": "09:30:00"}),
            )
            .unwrap();
        assert!(fetch_plate_history(&store, date(4), 2).is_empty());

        let flaky = FailingDay {
            inner: store,
            broken: "license_plates/2024-05-02".to_string(),
        };
        let rows = fetch_plate_history(&flaky, date(2), 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].plate, "A");
    }

    struct FailingDay {
        inner: InMemoryEventStore,
        broken: String,
    }

    impl EventStore for FailingDay {
        fn write(&self, path: &str, value: &Value) -> Result<()> {
            self.inner.write(path, value)
        }

        fn update(&self, path: &str, partial: &serde_json::Map<String, Value>) -> Result<()> {
            self.inner.update(path, partial)
        }

        fn read(&self, path: &str) -> Result<Option<Value>> {
            if path == self.broken {
                anyhow::bail!("unreachable");
            }
            self.inner.read(path)
        }

        fn subscribe(
            &self,
            path: &str,
            callback: crate::storage::ChangeCallback,
        ) -> Result<Subscription> {
            self.inner.subscribe(path, callback)
        }
    }

    #[test]
    fn total_count_read_and_watch() {
        let store = InMemoryEventStore::new();
        assert_eq!(read_total_count(&store).unwrap(), None);
        store.write(TOTAL_COUNT_PATH, &json!(5)).unwrap();
        assert_eq!(read_total_count(&store).unwrap(), Some(5));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = watch_total_count(&store, move |total| sink.lock().unwrap().push(total)).unwrap();
        store.write(TOTAL_COUNT_PATH, &json!("nan")).unwrap();
        store.write(TOTAL_COUNT_PATH, &json!(6)).unwrap();
        sub.cancel();
        store.write(TOTAL_COUNT_PATH, &json!(7)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![5, 6]);
    }
}
