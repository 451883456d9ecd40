//! Append-only event stream for observability.
//!
//! Components emit structured records; the sink appends them as JSONL under
//! `events/`. Emission must never fail the caller — sink I/O errors are
//! logged and swallowed. Consumers must tolerate extra fields.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────

/// Severity of an event record.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One record in the event stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    /// Emitting component (`dispatcher`, `team`, `swarm`, `worker`, ...).
    pub component: String,
    pub level: EventLevel,
    /// Event type (`message_received`, `swarm_job_start`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-form JSON payload.
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(
        component: impl Into<String>,
        level: EventLevel,
        kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        Event {
            ts: Utc::now(),
            component: component.into(),
            level,
            kind: kind.into(),
            payload,
        }
    }

    pub fn info(component: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self::new(component, EventLevel::Info, kind, payload)
    }

    pub fn warn(component: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self::new(component, EventLevel::Warn, kind, payload)
    }

    pub fn error(component: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self::new(component, EventLevel::Error, kind, payload)
    }
}

// ─────────────────────────────────────────────
// Sinks
// ─────────────────────────────────────────────

/// Destination for event records. Injected into every component that emits.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Appends events to `events/events-YYYY-MM-DD.jsonl` under the hive root.
pub struct FileEventSink {
    events_dir: PathBuf,
}

impl FileEventSink {
    pub fn new(events_dir: impl Into<PathBuf>) -> Self {
        Self {
            events_dir: events_dir.into(),
        }
    }

    fn current_file(&self) -> PathBuf {
        let day = Utc::now().format("%Y-%m-%d");
        self.events_dir.join(format!("events-{day}.jsonl"))
    }
}

impl EventSink for FileEventSink {
    fn emit(&self, event: Event) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(error = %e, "failed to serialize event");
                return;
            }
        };

        if let Err(e) = std::fs::create_dir_all(&self.events_dir).and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.current_file())
                .and_then(|mut f| writeln!(f, "{line}"))
        }) {
            tracing::debug!(error = %e, "failed to append event record");
        }
    }
}

/// Discards all events. Useful in tests and single-shot CLI commands.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: Event) {}
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
