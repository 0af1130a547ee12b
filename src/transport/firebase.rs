//! Firebase Realtime Database store over REST.
//!
//! - `write` -> `PUT {url}/{path}.json`
//! - `update` -> `PATCH {url}/{path}.json`
//! - `read` -> `GET {url}/{path}.json`
//! - `subscribe` -> `GET` with `Accept: text/event-stream`, on a background thread
//!
//! Each call is attempted once. Retrying is the caller's decision; the write
//! worker never retries.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use url::Url;

use crate::storage::{split_path, ChangeCallback, EventStore, Subscription};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct FirebaseConfig {
    /// Database root, e.g. `https://<db>.firebasedatabase.app/`.
    pub url: String,
    /// Database secret or ID token, sent as the `auth` query parameter.
    pub auth: Option<String>,
    pub timeout: Duration,
    pub reconnect_backoff: Duration,
}

impl FirebaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: None,
            timeout: DEFAULT_TIMEOUT,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }
}

#[derive(Clone)]
pub struct FirebaseStore {
    agent: ureq::Agent,
    stream_agent: ureq::Agent,
    base: Url,
    auth: Option<String>,
    reconnect_backoff: Duration,
}

impl FirebaseStore {
    pub fn new(config: FirebaseConfig) -> Result<Self> {
        let base = Url::parse(&config.url).context("parse store url")?;
        match base.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported store scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        if base.cannot_be_a_base() {
            return Err(anyhow!("store url {} cannot carry paths", config.url));
        }
        Ok(Self {
            agent: ureq::AgentBuilder::new().timeout(config.timeout).build(),
            stream_agent: ureq::AgentBuilder::new()
                .timeout_connect(config.timeout)
                .timeout_read(STREAM_READ_TIMEOUT)
                .build(),
            base,
            auth: config.auth.filter(|a| !a.trim().is_empty()),
            reconnect_backoff: config.reconnect_backoff,
        })
    }

    /// REST endpoint for a key path.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("store url cannot carry paths"))?;
            segments.pop_if_empty();
            let parts = split_path(path);
            match parts.split_last() {
                None => {
                    segments.push(".json");
                }
                Some((last, parents)) => {
                    segments.extend(parents.iter().copied());
                    segments.push(&format!("{}.json", last));
                }
            }
        }
        if let Some(auth) = &self.auth {
            url.query_pairs_mut().append_pair("auth", auth);
        }
        Ok(url)
    }

    fn stream(&self, path: &str, callback: &ChangeCallback, cancel: &AtomicBool) -> Result<()> {
        let url = self.endpoint(path)?;
        let response = self
            .stream_agent
            .get(url.as_str())
            .set("Accept", "text/event-stream")
            .call()
            .with_context(|| format!("open event stream for {}", path))?;
        let mut decoder = SseDecoder::default();
        for line in BufReader::new(response.into_reader()).lines() {
            if cancel.load(Ordering::SeqCst) {
                return Ok(());
            }
            let line = line.context("read event stream")?;
            let Some(event) = decoder.push_line(&line) else {
                continue;
            };
            match classify(&event) {
                StreamAction::Deliver(value) => callback(value),
                StreamAction::Refetch => callback(self.read(path)?),
                StreamAction::Ignore => {}
                StreamAction::Reconnect(reason) => {
                    return Err(anyhow!("event stream closed by server: {}", reason))
                }
            }
        }
        Err(anyhow!("event stream ended"))
    }
}

impl EventStore for FirebaseStore {
    fn write(&self, path: &str, value: &Value) -> Result<()> {
        let url = self.endpoint(path)?;
        self.agent
            .put(url.as_str())
            .send_json(value)
            .with_context(|| format!("PUT {}", path))?;
        Ok(())
    }

    fn update(&self, path: &str, partial: &Map<String, Value>) -> Result<()> {
        let url = self.endpoint(path)?;
        self.agent
            .request("PATCH", url.as_str())
            .send_json(partial)
            .with_context(|| format!("PATCH {}", path))?;
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<Value>> {
        let url = self.endpoint(path)?;
        let value: Value = self
            .agent
            .get(url.as_str())
            .call()
            .with_context(|| format!("GET {}", path))?
            .into_json()
            .with_context(|| format!("decode {}", path))?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    fn subscribe(&self, path: &str, callback: ChangeCallback) -> Result<Subscription> {
        let cancel = Arc::new(AtomicBool::new(false));
        let store = self.clone();
        let watched = path.to_string();
        let flag = Arc::clone(&cancel);
        thread::Builder::new()
            .name(format!("watch-{}", watched.replace('/', "-")))
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    if let Err(e) = store.stream(&watched, &callback, &flag) {
                        log::warn!("watch {}: {:#}; reconnecting", watched, e);
                    }
                    if !flag.load(Ordering::SeqCst) {
                        thread::sleep(store.reconnect_backoff);
                    }
                }
                log::debug!("watch {}: cancelled", watched);
            })
            .map_err(|e| anyhow!("failed to spawn watcher: {}", e))?;
        Ok(Subscription::new(move || cancel.store(true, Ordering::SeqCst)))
    }
}

// ----------------------------------------------------------------------------
// Server-sent events
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct SseEvent {
    event: String,
    data: String,
}

#[derive(Default)]
struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed one line; a blank line completes an event.
    fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                return None;
            }
            return Some(SseEvent {
                event: self.event.take().unwrap_or_else(|| "message".to_string()),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    path: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, PartialEq)]
enum StreamAction {
    Deliver(Option<Value>),
    Refetch,
    Ignore,
    Reconnect(String),
}

fn classify(event: &SseEvent) -> StreamAction {
    match event.event.as_str() {
        "put" => match serde_json::from_str::<StreamPayload>(&event.data) {
            Ok(payload) if payload.path == "/" => {
                StreamAction::Deliver(Some(payload.data).filter(|v| !v.is_null()))
            }
            Ok(_) => StreamAction::Refetch,
            Err(e) => {
                log::debug!("ignoring malformed stream payload: {}", e);
                StreamAction::Ignore
            }
        },
        "patch" => StreamAction::Refetch,
        "cancel" | "auth_revoked" => StreamAction::Reconnect(event.event.clone()),
        _ => StreamAction::Ignore,
    }
}
