//! Stage statuses and progress events reported while a build runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one unit of build work (a backend vertex).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub name: String,
    pub started: bool,
    pub completed: bool,
    pub cached: bool,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageStatus {
    /// Wall time between start and completion, when both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// A progress update for one backend message id (a layer, a transfer, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Message identity the update belongs to
    pub id: String,
    /// Human status text, e.g. `Pushing`
    pub status: String,
    pub current: Option<i64>,
    pub total: Option<i64>,
    pub timestamp: DateTime<Utc>,
    /// Set on completion; consumers must not coalesce it with later updates
    pub must_print: bool,
}

impl ProgressEvent {
    /// `"<id>: <status> <progress>"` as shown in build logs.
    pub fn render(&self) -> String {
        let progress = match (self.current, self.total) {
            (Some(current), Some(total)) if total > 0 => {
                format!("{}/{}", format_bytes(current), format_bytes(total))
            }
            (Some(current), _) if current > 0 => format_bytes(current),
            _ => String::new(),
        };
        format!("{}: {} {}", self.id, self.status, progress).trim_end().to_string()
    }
}

/// Human-readable byte count (`1.5MB`).
pub fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1_500_000), "1.5MB");
    }

    #[test]
    fn test_render_progress() {
        let event = ProgressEvent {
            id: "abc123".to_string(),
            status: "Pushing".to_string(),
            current: Some(5),
            total: Some(10),
            timestamp: Utc::now(),
            must_print: false,
        };
        assert_eq!(event.render(), "abc123: Pushing 5B/10B");
    }

    #[test]
    fn test_stage_duration() {
        let stage = StageStatus {
            started_at: Some(Utc.timestamp_opt(100, 0).unwrap()),
            completed_at: Some(Utc.timestamp_opt(103, 0).unwrap()),
            ..Default::default()
        };
        assert_eq!(stage.duration(), Some(chrono::Duration::seconds(3)));
        assert_eq!(StageStatus::default().duration(), None);
    }
}
