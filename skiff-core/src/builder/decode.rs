//! Decoding of the backend's streamed JSON output.
//!
//! The response body is a concatenation of JSON objects. Each one is either a
//! legacy record (log text, progress, error, aux payload) or a trace record
//! from the next-generation builder. Records are classified once by their
//! message id and dispatched to the matching aggregation path.

use crate::builder::sanitize::sanitize;
use crate::builder::trace::{self, StageTracker, TRACE_MESSAGE_ID};
use crate::error::{BuildError, BuildFailure, Result};
use crate::sink::BuildSink;
use crate::types::{Digest, ProgressEvent, StageStatus};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Minimum time between two prints of the same progress id.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

const READ_BUF_SIZE: usize = 8 * 1024;

/// Classic builder success line, the last-resort digest source.
static OLD_DIGEST_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Successfully built ([0-9a-f]+)\s*$").expect("Invalid digest regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProgressDetail {
    #[serde(default)]
    pub current: i64,
    #[serde(default)]
    pub total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// One JSON object from the backend stream.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JsonMessage {
    pub stream: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "progressDetail")]
    pub progress_detail: Option<ProgressDetail>,
    pub progress: Option<String>,
    pub id: Option<String>,
    pub error: Option<String>,
    #[serde(rename = "errorDetail")]
    pub error_detail: Option<ErrorDetail>,
    pub aux: Option<serde_json::Value>,
}

impl JsonMessage {
    /// Error text, preferring the structured detail.
    ///
    /// A present `errorDetail` always marks a failure; the flat `error`
    /// field only does when it is non-empty.
    pub fn error_text(&self) -> Option<&str> {
        let flat = self.error.as_deref().filter(|e| !e.is_empty());
        match &self.error_detail {
            Some(detail) if !detail.message.is_empty() => Some(detail.message.as_str()),
            Some(_) => Some(flat.unwrap_or_default()),
            None => flat,
        }
    }
}

/// A classified backend record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Legacy(JsonMessage),
    /// Aux payload of a trace record
    Trace(serde_json::Value),
}

impl Record {
    pub fn classify(message: JsonMessage) -> Self {
        let is_trace = message.id.as_deref() == Some(TRACE_MESSAGE_ID);
        match message {
            JsonMessage { aux: Some(aux), .. } if is_trace => Record::Trace(aux),
            message => Record::Legacy(message),
        }
    }
}

/// Per-id rate limit for progress printing.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_printed: HashMap<String, Instant>,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(PROGRESS_INTERVAL)
    }
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_printed: HashMap::new() }
    }

    /// Decide whether an update is printed at `now`.
    ///
    /// Returns `Some(must_print)` when it should be printed; `must_print` is
    /// set for completion updates.
    pub fn admit(
        &mut self,
        id: &str,
        status: &str,
        current: i64,
        total: i64,
        now: Instant,
    ) -> Option<bool> {
        if current == 0 && (status == "Waiting" || status == "Preparing") {
            return None;
        }

        let done = current == total;
        let due = match self.last_printed.get(id) {
            None => true,
            Some(last) => now.saturating_duration_since(*last) >= self.interval,
        };
        if !(due || done) {
            return None;
        }

        self.last_printed.insert(id.to_string(), now);
        Some(done)
    }
}

/// Digest sources captured from a finished stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOutput {
    /// Last aux payload outside the trace protocol
    pub aux: Option<serde_json::Value>,
    /// Short ID scraped from classic builder log text
    pub short_id: Option<String>,
}

/// Successful decode of a whole stream.
#[derive(Debug, Clone, Default)]
pub struct Decoded {
    pub raw: RawOutput,
    pub stages: Vec<StageStatus>,
}

/// Where the built image's identity came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutput {
    /// Full content digest from an aux record
    Digest(Digest),
    /// Short ID that still needs an inspect to become a digest
    ShortId(String),
}

/// Pick the image identity out of a decoded stream.
pub fn resolve_build_output(raw: &RawOutput) -> Result<BuildOutput> {
    if let Some(aux) = &raw.aux {
        let fields: HashMap<String, serde_json::Value> = serde_json::from_value(aux.clone())
            .map_err(|e| BuildError::Decode { reason: format!("reading aux payload: {}", e) })?;
        return match fields.get("ID").and_then(|v| v.as_str()) {
            Some(id) => Ok(BuildOutput::Digest(Digest::new(id))),
            None => Err(BuildError::DigestNotFound),
        };
    }

    match &raw.short_id {
        Some(id) => Ok(BuildOutput::ShortId(id.clone())),
        None => Err(BuildError::BackendUnresponsive),
    }
}

/// State of one decode pass.
struct OutputDecoder<'a> {
    sink: &'a dyn BuildSink,
    throttle: ProgressThrottle,
    tracker: StageTracker,
    raw: RawOutput,
}

impl<'a> OutputDecoder<'a> {
    fn new(sink: &'a dyn BuildSink) -> Self {
        Self {
            sink,
            throttle: ProgressThrottle::default(),
            tracker: StageTracker::new(),
            raw: RawOutput::default(),
        }
    }

    /// Consume every complete record in `buf`, returning the bytes used.
    fn feed(&mut self, buf: &[u8]) -> Result<usize> {
        let mut records = serde_json::Deserializer::from_slice(buf).into_iter::<JsonMessage>();
        let mut consumed = 0;
        loop {
            match records.next() {
                None => return Ok(buf.len()),
                Some(Ok(message)) => {
                    consumed = records.byte_offset();
                    self.handle(Record::classify(message), Instant::now())?;
                }
                // Partial record, wait for more bytes
                Some(Err(e)) if e.is_eof() => return Ok(consumed),
                Some(Err(e)) => {
                    return Err(BuildError::Decode { reason: format!("malformed record: {}", e) })
                }
            }
        }
    }

    fn handle(&mut self, record: Record, now: Instant) -> Result<()> {
        match record {
            Record::Trace(aux) => {
                let batch = trace::decode_trace_payload(&aux)?;
                self.tracker.apply(batch, self.sink);
                Ok(())
            }
            Record::Legacy(message) => self.handle_legacy(message, now),
        }
    }

    fn handle_legacy(&mut self, message: JsonMessage, now: Instant) -> Result<()> {
        if let Some(text) = message.stream.as_deref().filter(|s| !s.is_empty()) {
            self.sink.log(text);
            if let Some(caps) = OLD_DIGEST_REGEX.captures(text) {
                self.raw.short_id = Some(caps[1].to_string());
            }
        }

        if let Some(error) = message.error_text() {
            return Err(BuildError::BackendReported(sanitize(error)));
        }

        if let (Some(id), Some(detail)) = (message.id.as_deref(), &message.progress_detail) {
            if !id.is_empty() {
                let status = message.status.as_deref().unwrap_or_default();
                if let Some(must_print) =
                    self.throttle.admit(id, status, detail.current, detail.total, now)
                {
                    self.sink.progress(&ProgressEvent {
                        id: id.to_string(),
                        status: status.to_string(),
                        current: Some(detail.current),
                        total: Some(detail.total),
                        timestamp: Utc::now(),
                        must_print,
                    });
                }
            }
        }

        if let Some(aux) = message.aux {
            self.raw.aux = Some(aux);
        }
        Ok(())
    }

    fn failure(&self, error: BuildError) -> BuildFailure {
        BuildFailure::new(error, self.tracker.stage_statuses())
    }

    fn finish(self) -> Decoded {
        Decoded { raw: self.raw, stages: self.tracker.stage_statuses() }
    }
}

/// Decode a backend output stream until it ends.
///
/// Log text and throttled progress go to `sink`. Any failure carries the
/// stage statuses seen before it. Cancellation wins over a stream that
/// otherwise ended cleanly.
pub async fn decode_output<R>(
    mut reader: R,
    sink: &dyn BuildSink,
    cancel: &CancellationToken,
) -> std::result::Result<Decoded, BuildFailure>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = OutputDecoder::new(sink);
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; READ_BUF_SIZE];

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            read = reader.read(&mut chunk) => Some(read),
        };
        let n = match read {
            None => return Err(decoder.failure(BuildError::Cancelled)),
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                return Err(decoder.failure(BuildError::Decode {
                    reason: format!("reading build output: {}", e),
                }))
            }
        };
        if n == 0 {
            break;
        }

        pending.extend_from_slice(&chunk[..n]);
        // Records are objects, so only a closing brace can complete one
        if chunk[..n].contains(&b'}') {
            let consumed = decoder.feed(&pending).map_err(|e| decoder.failure(e))?;
            pending.drain(..consumed);
        }
    }

    if !pending.iter().all(u8::is_ascii_whitespace) {
        let consumed = decoder.feed(&pending).map_err(|e| decoder.failure(e))?;
        pending.drain(..consumed);
    }
    if !pending.iter().all(u8::is_ascii_whitespace) {
        debug!(bytes = pending.len(), "Build output ended inside a record");
        return Err(decoder.failure(BuildError::Decode {
            reason: "build output ended inside a record".to_string(),
        }));
    }

    if cancel.is_cancelled() {
        return Err(decoder.failure(BuildError::Cancelled));
    }

    Ok(decoder.finish())
}
