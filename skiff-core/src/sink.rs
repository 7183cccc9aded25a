//! Destinations for build logs and progress.
//!
//! The core never formats output for a terminal; it hands lines and progress
//! events to a [`BuildSink`] supplied by the caller.

use crate::types::ProgressEvent;
use std::sync::Mutex;
use tracing::info;

/// Receives human-readable build output.
pub trait BuildSink: Send + Sync {
    /// A line (or chunk) of build log text, forwarded verbatim.
    fn log(&self, text: &str);

    /// A throttled progress update.
    fn progress(&self, event: &ProgressEvent);
}

/// Sink that forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl BuildSink for TracingSink {
    fn log(&self, text: &str) {
        let text = text.trim_end();
        if !text.is_empty() {
            info!(target: "skiff::build", "{}", text);
        }
    }

    fn progress(&self, event: &ProgressEvent) {
        info!(
            target: "skiff::build",
            progress_id = %event.id,
            must_print = event.must_print,
            "{}",
            event.render()
        );
    }
}

/// Sink that records everything it receives, for inspection in tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    logs: Mutex<Vec<String>>,
    progress: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn progress_events(&self) -> Vec<ProgressEvent> {
        self.progress.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl BuildSink for RecordingSink {
    fn log(&self, text: &str) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(text.to_string());
        }
    }

    fn progress(&self, event: &ProgressEvent) {
        if let Ok(mut progress) = self.progress.lock() {
            progress.push(event.clone());
        }
    }
}
