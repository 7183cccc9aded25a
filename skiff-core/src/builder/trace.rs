//! Next-generation build trace protocol.
//!
//! # Wire Format
//!
//! Trace records arrive as ordinary JSON messages whose `id` is
//! [`TRACE_MESSAGE_ID`]. Their `aux` field is a JSON string holding the
//! base64 encoding of a protobuf `StatusResponse`:
//!
//! ```text
//! StatusResponse
//! ├── vertexes (1)  Vertex       { digest, inputs, name, cached, started, completed, error }
//! ├── statuses (2)  VertexStatus { id, vertex, name, current, total, timestamp, started, completed }
//! └── logs     (3)  VertexLog    { vertex, timestamp, stream, msg }
//! ```
//!
//! Fields this crate does not use (warnings, progress groups) are skipped by
//! the protobuf decoder.

use crate::error::{BuildError, Result};
use crate::sink::BuildSink;
use crate::types::StageStatus;
use base64::Engine;
use chrono::{DateTime, Utc};
use prost::Message;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Message identity of trace records.
pub const TRACE_MESSAGE_ID: &str = "moby.buildkit.trace";

/// Protobuf messages of the trace payload.
pub mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StatusResponse {
        #[prost(message, repeated, tag = "1")]
        pub vertexes: Vec<Vertex>,
        #[prost(message, repeated, tag = "2")]
        pub statuses: Vec<VertexStatus>,
        #[prost(message, repeated, tag = "3")]
        pub logs: Vec<VertexLog>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Vertex {
        #[prost(string, tag = "1")]
        pub digest: String,
        #[prost(string, repeated, tag = "2")]
        pub inputs: Vec<String>,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(bool, tag = "4")]
        pub cached: bool,
        #[prost(message, optional, tag = "5")]
        pub started: Option<prost_types::Timestamp>,
        #[prost(message, optional, tag = "6")]
        pub completed: Option<prost_types::Timestamp>,
        #[prost(string, tag = "7")]
        pub error: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct VertexStatus {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(string, tag = "2")]
        pub vertex: String,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(int64, tag = "4")]
        pub current: i64,
        #[prost(int64, tag = "5")]
        pub total: i64,
        #[prost(message, optional, tag = "6")]
        pub timestamp: Option<prost_types::Timestamp>,
        #[prost(message, optional, tag = "7")]
        pub started: Option<prost_types::Timestamp>,
        #[prost(message, optional, tag = "8")]
        pub completed: Option<prost_types::Timestamp>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct VertexLog {
        #[prost(string, tag = "1")]
        pub vertex: String,
        #[prost(message, optional, tag = "2")]
        pub timestamp: Option<prost_types::Timestamp>,
        #[prost(int64, tag = "3")]
        pub stream: i64,
        #[prost(bytes = "vec", tag = "4")]
        pub msg: Vec<u8>,
    }
}

/// One unit of build work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceVertex {
    pub digest: String,
    pub name: String,
    pub error: Option<String>,
    pub cached: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Completed minus started, when both are present
    pub duration: Option<Duration>,
}

/// A line of output from a vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLog {
    pub vertex: String,
    pub text: String,
}

/// Progress of one operation inside a vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceStatus {
    pub vertex: String,
    pub id: String,
    pub current: i64,
    pub total: i64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Everything carried by one trace record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceBatch {
    pub vertexes: Vec<TraceVertex>,
    pub logs: Vec<TraceLog>,
    pub statuses: Vec<TraceStatus>,
}

fn to_datetime(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
}

/// Decode the `aux` payload of a trace record.
pub fn decode_trace_payload(aux: &serde_json::Value) -> Result<TraceBatch> {
    let encoded = aux.as_str().ok_or_else(|| BuildError::Decode {
        reason: "trace payload is not a string".to_string(),
    })?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).map_err(|e| {
        BuildError::Decode { reason: format!("trace payload is not valid base64: {}", e) }
    })?;
    let response = proto::StatusResponse::decode(bytes.as_slice())
        .map_err(|e| BuildError::Decode { reason: format!("decoding trace status: {}", e) })?;
    Ok(to_batch(response))
}

/// Convert a decoded status response into the three record kinds.
pub fn to_batch(response: proto::StatusResponse) -> TraceBatch {
    let vertexes = response
        .vertexes
        .into_iter()
        .map(|v| {
            let started_at = v.started.as_ref().and_then(to_datetime);
            let completed_at = v.completed.as_ref().and_then(to_datetime);
            let duration = match (started_at, completed_at) {
                (Some(start), Some(end)) => (end - start).to_std().ok(),
                _ => None,
            };
            TraceVertex {
                digest: v.digest,
                name: v.name,
                error: Some(v.error).filter(|e| !e.is_empty()),
                cached: v.cached,
                started_at,
                completed_at,
                duration,
            }
        })
        .collect();

    let logs = response
        .logs
        .into_iter()
        .map(|l| TraceLog { vertex: l.vertex, text: String::from_utf8_lossy(&l.msg).into_owned() })
        .collect();

    let statuses = response
        .statuses
        .into_iter()
        .map(|s| TraceStatus {
            vertex: s.vertex,
            id: s.id,
            current: s.current,
            total: s.total,
            timestamp: s.timestamp.as_ref().and_then(to_datetime),
        })
        .collect();

    TraceBatch { vertexes, logs, statuses }
}

/// Running state of one vertex.
#[derive(Debug, Default)]
struct VertexState {
    status: StageStatus,
    /// Latest (current, total) per operation id
    progress: HashMap<String, (i64, i64)>,
    log_lines: usize,
}

/// Accumulates stage statuses for one build attempt.
///
/// Stages appear in the order their vertex was first reported.
#[derive(Debug, Default)]
pub struct StageTracker {
    order: Vec<String>,
    vertexes: HashMap<String, VertexState>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a trace batch into the stage statuses, echoing notable events to `sink`.
    pub fn apply(&mut self, batch: TraceBatch, sink: &dyn BuildSink) {
        for vertex in batch.vertexes {
            self.apply_vertex(vertex, sink);
        }

        for log in batch.logs {
            match self.vertexes.get_mut(&log.vertex) {
                Some(state) => {
                    state.log_lines += 1;
                    for line in log.text.lines().filter(|l| !l.trim().is_empty()) {
                        sink.log(&format!("[{}] {}\n", state.status.name, line));
                    }
                }
                None => debug!(vertex = %log.vertex, "Log for unknown vertex"),
            }
        }

        for status in batch.statuses {
            match self.vertexes.get_mut(&status.vertex) {
                Some(state) => {
                    if !state.status.started {
                        state.status.started = true;
                        state.status.started_at = status.timestamp;
                    }
                    state.progress.insert(status.id, (status.current, status.total));
                }
                None => debug!(vertex = %status.vertex, "Status for unknown vertex"),
            }
        }
    }

    fn apply_vertex(&mut self, vertex: TraceVertex, sink: &dyn BuildSink) {
        if !self.vertexes.contains_key(&vertex.digest) {
            self.order.push(vertex.digest.clone());
        }
        let state = self.vertexes.entry(vertex.digest.clone()).or_default();
        let stage = &mut state.status;
        let was_started = stage.started;
        let was_completed = stage.completed;

        if !vertex.name.is_empty() {
            stage.name = vertex.name;
        }
        if vertex.started_at.is_some() {
            stage.started = true;
            stage.started_at = vertex.started_at;
        }
        if vertex.completed_at.is_some() {
            stage.completed = true;
            stage.completed_at = vertex.completed_at;
        }
        stage.cached |= vertex.cached;
        if vertex.error.is_some() {
            stage.error = vertex.error;
        }

        if stage.started && !was_started {
            sink.log(&format!("[{}]\n", stage.name));
        }
        if stage.completed && !was_completed {
            if let Some(error) = &stage.error {
                sink.log(&format!("ERROR IN: [{}]: {}\n", stage.name, error));
            } else if stage.cached {
                sink.log(&format!("[{}] CACHED\n", stage.name));
            } else if let Some(duration) = vertex.duration {
                sink.log(&format!("[{}] done in {:.1}s\n", stage.name, duration.as_secs_f64()));
            }
        }
    }

    /// Stage statuses in first-seen order.
    pub fn stage_statuses(&self) -> Vec<StageStatus> {
        self.order
            .iter()
            .filter_map(|digest| self.vertexes.get(digest))
            .map(|state| state.status.clone())
            .collect()
    }

    /// Latest progress reported for `vertex`, keyed by operation id.
    pub fn progress(&self, vertex: &str) -> Option<&HashMap<String, (i64, i64)>> {
        self.vertexes.get(vertex).map(|s| &s.progress)
    }

    /// Number of log records received for `vertex`.
    pub fn log_count(&self, vertex: &str) -> usize {
        self.vertexes.get(vertex).map(|s| s.log_lines).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;

    fn ts(seconds: i64) -> Option<prost_types::Timestamp> {
        Some(prost_types::Timestamp { seconds, nanos: 0 })
    }

    fn vertex(digest: &str, name: &str) -> proto::Vertex {
        proto::Vertex { digest: digest.to_string(), name: name.to_string(), ..Default::default() }
    }

    fn encode(response: &proto::StatusResponse) -> serde_json::Value {
        serde_json::Value::String(
            base64::engine::general_purpose::STANDARD.encode(response.encode_to_vec()),
        )
    }

    #[test]
    fn test_decode_payload() {
        let response = proto::StatusResponse {
            vertexes: vec![proto::Vertex {
                started: ts(10),
                completed: ts(12),
                cached: true,
                ..vertex("sha256:v1", "[1/2] FROM alpine")
            }],
            statuses: vec![proto::VertexStatus {
                id: "extracting".to_string(),
                vertex: "sha256:v1".to_string(),
                current: 5,
                total: 10,
                timestamp: ts(11),
                ..Default::default()
            }],
            logs: vec![proto::VertexLog {
                vertex: "sha256:v1".to_string(),
                msg: b"hello\n".to_vec(),
                ..Default::default()
            }],
        };

        let batch = decode_trace_payload(&encode(&response)).unwrap();
        assert_eq!(batch.vertexes.len(), 1);
        assert_eq!(batch.vertexes[0].duration, Some(Duration::from_secs(2)));
        assert!(batch.vertexes[0].cached);
        assert_eq!(batch.vertexes[0].error, None);
        assert_eq!(batch.logs[0].text, "hello\n");
        assert_eq!(batch.statuses[0].current, 5);
    }

    #[test]
    fn test_decode_payload_rejects_non_string() {
        assert!(decode_trace_payload(&serde_json::json!({"ID": "x"})).is_err());
        assert!(decode_trace_payload(&serde_json::json!("not base64!")).is_err());
    }

    #[test]
    fn test_tracker_lifecycle() {
        let sink = RecordingSink::new();
        let mut tracker = StageTracker::new();

        tracker.apply(
            to_batch(proto::StatusResponse {
                vertexes: vec![
                    proto::Vertex { started: ts(1), ..vertex("a", "[1/2] FROM alpine") },
                    vertex("b", "[2/2] RUN make"),
                ],
                ..Default::default()
            }),
            &sink,
        );
        tracker.apply(
            to_batch(proto::StatusResponse {
                vertexes: vec![proto::Vertex {
                    started: ts(1),
                    completed: ts(3),
                    ..vertex("a", "[1/2] FROM alpine")
                }],
                logs: vec![proto::VertexLog {
                    vertex: "a".to_string(),
                    msg: b"pulled\n".to_vec(),
                    ..Default::default()
                }],
                statuses: vec![proto::VertexStatus {
                    id: "layer".to_string(),
                    vertex: "b".to_string(),
                    current: 1,
                    total: 2,
                    timestamp: ts(4),
                    ..Default::default()
                }],
            }),
            &sink,
        );
        tracker.apply(
            to_batch(proto::StatusResponse {
                vertexes: vec![proto::Vertex {
                    started: ts(4),
                    completed: ts(5),
                    error: "exit code 1".to_string(),
                    ..vertex("b", "[2/2] RUN make")
                }],
                ..Default::default()
            }),
            &sink,
        );

        let stages = tracker.stage_statuses();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].name, "[1/2] FROM alpine");
        assert!(stages[0].started && stages[0].completed);
        assert_eq!(stages[1].name, "[2/2] RUN make");
        assert_eq!(stages[1].error.as_deref(), Some("exit code 1"));
        assert_eq!(tracker.log_count("a"), 1);
        assert_eq!(tracker.progress("b").unwrap().get("layer"), Some(&(1, 2)));

        let logs = sink.logs();
        assert_eq!(logs[0], "[[1/2] FROM alpine]\n");
        assert!(logs.contains(&"[[1/2] FROM alpine] pulled\n".to_string()));
        assert!(logs.iter().any(|l| l.starts_with("ERROR IN: [[2/2] RUN make]")));
    }

    #[test]
    fn test_tracker_ignores_unknown_vertex_records() {
        let sink = RecordingSink::new();
        let mut tracker = StageTracker::new();
        tracker.apply(
            TraceBatch {
                logs: vec![TraceLog { vertex: "nope".to_string(), text: "x".to_string() }],
                ..Default::default()
            },
            &sink,
        );
        assert!(tracker.stage_statuses().is_empty());
        assert!(sink.logs().is_empty());
    }
}
