//! Event store seam and the in-memory implementation.
//!
//! Stores are hierarchical key-path JSON trees (`a/b/c`). `write` replaces a
//! node, `update` merges top-level fields into it, `read` returns a node.
//! Subscribers get the current value of their node after every change under
//! or above it.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Callback invoked with the subscribed node's value (`None` when absent).
pub type ChangeCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

pub trait EventStore: Send + Sync {
    /// Replace the node at `path`.
    fn write(&self, path: &str, value: &Value) -> Result<()>;

    /// Merge `partial` into the node at `path`, leaving other fields untouched.
    fn update(&self, path: &str, partial: &Map<String, Value>) -> Result<()>;

    fn read(&self, path: &str) -> Result<Option<Value>>;

    /// Watch `path`. The callback fires once with the current value, then on
    /// every change until the returned `Subscription` is dropped.
    fn subscribe(&self, path: &str, callback: ChangeCallback) -> Result<Subscription>;
}

/// Live subscription. Dropping it stops delivery.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

pub(crate) fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

// ----------------------------------------------------------------------------
// InMemoryEventStore
// ----------------------------------------------------------------------------

/// Mutation recorded by the in-memory store, in application order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Write(String),
    Update(String),
}

struct Subscriber {
    id: u64,
    path: Vec<String>,
    callback: ChangeCallback,
}

#[derive(Default)]
struct MemoryState {
    root: Value,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    ops: Vec<StoreOp>,
    fail_next: u32,
    latency: Duration,
}

/// Process-local store for tests and offline runs.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` mutations fail as a transport error would.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    /// Delay every mutation, to model a slow network.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Successful mutations so far.
    pub fn operations(&self) -> Vec<StoreOp> {
        self.lock().ops.clone()
    }

    pub fn snapshot(&self) -> Value {
        self.lock().root.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    fn mutate(&self, path: &str, op: StoreOp, apply: impl FnOnce(&mut Value)) -> Result<()> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let segments = split_path(path);
        let notifications = {
            let mut state = self.lock();
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(anyhow!("in-memory store: injected failure for {}", path));
            }
            apply(&mut state.root);
            state.ops.push(op);
            state
                .subscribers
                .iter()
                .filter(|sub| overlaps(&sub.path, &segments))
                .map(|sub| {
                    let value = node(&state.root, &sub.path).cloned();
                    (Arc::clone(&sub.callback), value)
                })
                .collect::<Vec<_>>()
        };
        for (callback, value) in notifications {
            callback(value);
        }
        Ok(())
    }
}

impl EventStore for InMemoryEventStore {
    fn write(&self, path: &str, value: &Value) -> Result<()> {
        let segments: Vec<String> = split_path(path).into_iter().map(String::from).collect();
        let value = value.clone();
        self.mutate(path, StoreOp::Write(path.to_string()), move |root| {
            set_node(root, &segments, value)
        })
    }

    fn update(&self, path: &str, partial: &Map<String, Value>) -> Result<()> {
        let segments: Vec<String> = split_path(path).into_iter().map(String::from).collect();
        let partial = partial.clone();
        self.mutate(path, StoreOp::Update(path.to_string()), move |root| {
            for (key, value) in partial {
                let mut child = segments.clone();
                child.push(key);
                set_node(root, &child, value);
            }
        })
    }

    fn read(&self, path: &str) -> Result<Option<Value>> {
        let segments: Vec<String> = split_path(path).into_iter().map(String::from).collect();
        Ok(node(&self.lock().root, &segments).cloned())
    }

    fn subscribe(&self, path: &str, callback: ChangeCallback) -> Result<Subscription> {
        let segments: Vec<String> = split_path(path).into_iter().map(String::from).collect();
        let (id, current) = {
            let mut state = self.lock();
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.push(Subscriber {
                id,
                path: segments.clone(),
                callback: Arc::clone(&callback),
            });
            (id, node(&state.root, &segments).cloned())
        };
        callback(current);

        let weak: Weak<Mutex<MemoryState>> = Arc::downgrade(&self.state);
        Ok(Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                lock_state(&state).subscribers.retain(|sub| sub.id != id);
            }
        }))
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn overlaps<S: AsRef<str>>(watched: &[String], changed: &[S]) -> bool {
    watched
        .iter()
        .zip(changed.iter())
        .all(|(a, b)| a.as_str() == b.as_ref())
}

fn node<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn set_node(root: &mut Value, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };
    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        if value.is_null() {
            map.remove(last);
        } else {
            map.insert(last.clone(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_then_read_nested_paths() {
        let store = InMemoryEventStore::new();
        store
            .write("license_plates/2024-05-01/plate:A", &json!({"plate": "A", "bag": 0}))
            .unwrap();
        store.write("total_count", &json!(3)).unwrap();
        assert_eq!(
            store.read("license_plates/2024-05-01").unwrap(),
            Some(json!({"plate:A": {"plate": "A", "bag": 0}}))
        );
        assert_eq!(store.read("total_count").unwrap(), Some(json!(3)));
        assert_eq!(store.read("missing/path").unwrap(), None);
    }

    #[test]
    fn update_merges_fields() {
        let store = InMemoryEventStore::new();
        store
            .write("p", &json!({"plate": "A", "bag": 0, "timestamp": "10:00:00"}))
            .unwrap();
        let mut partial = Map::new();
        partial.insert("timestamp".into(), json!("10:00:05"));
        store.update("p", &partial).unwrap();
        assert_eq!(
            store.read("p").unwrap(),
            Some(json!({"plate": "A", "bag": 0, "timestamp": "10:00:05"}))
        );
        assert_eq!(
            store.operations(),
            vec![StoreOp::Write("p".into()), StoreOp::Update("p".into())]
        );
    }

    #[test]
    fn injected_failures_are_consumed() {
        let store = InMemoryEventStore::new();
        store.fail_next(1);
        assert!(store.write("total_count", &json!(1)).is_err());
        assert!(store.write("total_count", &json!(2)).is_ok());
        assert_eq!(store.read("total_count").unwrap(), Some(json!(2)));
        assert_eq!(store.operations().len(), 1);
    }

    #[test]
    fn subscribers_see_initial_and_changed_values() {
        let store = InMemoryEventStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = store
            .subscribe(
                "total_count",
                Arc::new(move |value: Option<Value>| sink.lock().unwrap().push(value)),
            )
            .unwrap();
        store.write("total_count", &json!(1)).unwrap();
        store.write("license_plates/x", &json!(1)).unwrap();
        store.write("total_count", &json!(2)).unwrap();
        drop(sub);
        store.write("total_count", &json!(3)).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![None, Some(json!(1)), Some(json!(2))]
        );
    }

    #[test]
    fn parent_subscription_sees_child_writes() {
        let store = InMemoryEventStore::new();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let _sub = store
            .subscribe(
                "license_plates",
                Arc::new(move |_: Option<Value>| *sink.lock().unwrap() += 1),
            )
            .unwrap();
        store.write("license_plates/2024-05-01/plate:A", &json!({})).unwrap();
        assert_eq!(*count.lock().unwrap(), 2);
    }
}
