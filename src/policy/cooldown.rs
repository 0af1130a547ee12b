use regex::Regex;
use std::time::{Duration, Instant};

use crate::detect::TextReading;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(1500);

/// Outcome of feeding one recognition result to the deduplicator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlateDecision {
    /// Differs from the last recognized plate; publish it.
    NewPlate(String),
    /// Same as the last recognized plate; do not publish again.
    Repeat(String),
    /// Nothing usable was read. Cooldown is not restarted.
    Unrecognized,
}

impl PlateDecision {
    pub fn text(&self) -> Option<&str> {
        match self {
            PlateDecision::NewPlate(text) | PlateDecision::Repeat(text) => Some(text),
            PlateDecision::Unrecognized => None,
        }
    }
}

/// Cooldown gate and consecutive-duplicate filter for plate readings.
///
/// Owned by a single plate stage; never shared across threads.
#[derive(Debug)]
pub struct PlateDeduplicator {
    cooldown: Duration,
    pattern: Option<Regex>,
    last_plate: Option<String>,
    last_recognition: Option<Instant>,
}

impl PlateDeduplicator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            pattern: None,
            last_plate: None,
            last_recognition: None,
        }
    }

    /// Only accept readings that match `pattern` (e.g. a national plate format).
    pub fn with_pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn last_plate(&self) -> Option<&str> {
        self.last_plate.as_deref()
    }

    /// True when no recognition has happened yet or the cooldown has fully elapsed.
    pub fn recognition_due(&self, now: Instant) -> bool {
        match self.last_recognition {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.cooldown,
        }
    }

    /// Record one recognition attempt made at `now`.
    pub fn observe(&mut self, readings: &[TextReading], now: Instant) -> PlateDecision {
        let best = readings
            .iter()
            .filter_map(|reading| {
                let text = reading.text.trim();
                if text.is_empty() {
                    return None;
                }
                if let Some(pattern) = &self.pattern {
                    if !pattern.is_match(text) {
                        return None;
                    }
                }
                Some((text, reading.confidence))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));

        let Some((text, _)) = best else {
            return PlateDecision::Unrecognized;
        };
        let text = text.to_string();
        self.last_recognition = Some(now);
        if self.last_plate.as_deref() == Some(text.as_str()) {
            PlateDecision::Repeat(text)
        } else {
            self.last_plate = Some(text.clone());
            PlateDecision::NewPlate(text)
        }
    }
}
