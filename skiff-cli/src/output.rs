//! Terminal rendering of build output.

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use skiff_core::sink::BuildSink;
use skiff_core::types::{ProgressEvent, StageStatus};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

/// Sink that writes build logs to the terminal and draws one progress bar
/// per transfer id.
pub struct ConsoleSink {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::with_progress(MultiProgress::new())
    }

    fn with_progress(multi: MultiProgress) -> Self {
        Self { multi, bars: Mutex::new(HashMap::new()) }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{prefix:.bold} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-")
    }

    /// Number of bars still being updated.
    fn active_bars(&self) -> usize {
        self.bars.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildSink for ConsoleSink {
    fn log(&self, text: &str) {
        // Suspend so log text never tears through a bar being redrawn
        self.multi.suspend(|| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        });
    }

    fn progress(&self, event: &ProgressEvent) {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        let bar = bars
            .entry(event.id.clone())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(0));
                bar.set_style(Self::bar_style());
                bar.set_prefix(event.id.clone());
                bar
            })
            .clone();

        if let Some(total) = event.total.filter(|t| *t > 0) {
            bar.set_length(total as u64);
        }
        if let Some(current) = event.current {
            bar.set_position(current.max(0) as u64);
        }
        bar.set_message(event.status.clone());

        if event.must_print {
            bar.finish();
            bars.remove(&event.id);
        }
    }
}

/// One summary line per stage.
pub fn print_stages(stages: &[StageStatus]) {
    for stage in stages {
        let marker = if stage.error.is_some() {
            "✘".red()
        } else if stage.cached {
            "○".cyan()
        } else if stage.completed {
            "✔".green()
        } else {
            "…".yellow()
        };

        let duration = stage
            .duration()
            .and_then(|d| d.to_std().ok())
            .map(|d| format!(" ({:.1}s)", d.as_secs_f64()))
            .unwrap_or_default();
        println!("  {} {}{}", marker, stage.name, duration.dimmed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use indicatif::ProgressDrawTarget;

    fn event(id: &str, current: i64, total: i64, must_print: bool) -> ProgressEvent {
        ProgressEvent {
            id: id.to_string(),
            status: "Pushing".to_string(),
            current: Some(current),
            total: Some(total),
            timestamp: Utc::now(),
            must_print,
        }
    }

    #[test]
    fn test_one_bar_per_id_until_complete() {
        let sink = ConsoleSink::with_progress(MultiProgress::with_draw_target(
            ProgressDrawTarget::hidden(),
        ));

        sink.progress(&event("layer1", 5, 10, false));
        sink.progress(&event("layer2", 1, 10, false));
        sink.progress(&event("layer1", 7, 10, false));
        assert_eq!(sink.active_bars(), 2);

        let bar = sink.bars.lock().unwrap().get("layer1").cloned().unwrap();
        assert_eq!(bar.position(), 7);
        assert_eq!(bar.length(), Some(10));

        sink.progress(&event("layer1", 10, 10, true));
        assert_eq!(sink.active_bars(), 1);
        assert!(bar.is_finished());
        assert_eq!(bar.position(), 10);
    }
}
