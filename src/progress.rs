//! Sync progress reporting.
//!
//! A pass reports what it is listing, the size of its delta plan, and how far
//! the ingest and delete phases have got. Reporters write to **stderr**; stdout
//! carries only the final summary so scripts can parse it.

use std::io::Write;
use std::sync::Arc;

use serde::Serialize;

/// A single progress event for a pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum SyncProgressEvent {
    /// The store is being listed. Total unknown.
    Listing { store: String },
    /// The delta plan is known.
    Planned {
        store: String,
        ingest: u64,
        delete: u64,
        unchanged: u64,
    },
    /// `n` of `total` ingest records have finished (either way).
    Ingesting { store: String, n: u64, total: u64 },
    /// `n` of `total` deletions have been attempted.
    Deleting { store: String, n: u64, total: u64 },
}

impl SyncProgressEvent {
    /// One human-readable line, without trailing newline.
    pub fn human_line(&self) -> String {
        match self {
            SyncProgressEvent::Listing { store } => format!("sync {}  listing...", store),
            SyncProgressEvent::Planned {
                store,
                ingest,
                delete,
                unchanged,
            } => format!(
                "sync {}  plan: {} to ingest, {} to delete, {} unchanged",
                store,
                format_number(*ingest),
                format_number(*delete),
                format_number(*unchanged)
            ),
            SyncProgressEvent::Ingesting { store, n, total } => format!(
                "sync {}  ingesting  {} / {} files",
                store,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Deleting { store, n, total } => format!(
                "sync {}  deleting  {} / {} files",
                store,
                format_number(*n),
                format_number(*total)
            ),
        }
    }

    /// JSON object: `{"event":"progress","phase":..., ...fields}`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("event".to_string(), "progress".into());
        }
        value
    }
}

/// Receives progress events from the orchestrator. Must be cheap; it is
/// called from the coordinating task.
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

fn write_stderr(line: &str) {
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{}", line);
    let _ = err.flush();
}

/// Human-friendly lines: `sync sharepoint:Bids  ingesting  1,234 / 5,000 files`.
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        write_stderr(&event.human_line());
    }
}

/// JSON lines for machines.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        write_stderr(&event.to_json().to_string());
    }
}

pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

/// `1234567` → `"1,234,567"`.
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Which reporter `csync sync` uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human lines on an interactive stderr, nothing otherwise.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
