//! Upload framing and line parsing.
//!
//! Bodies are split into frames on a delimiter, each frame is parsed into a
//! level/source/message triple by best-effort detection (JSON, logfmt, plain
//! text), and sequence numbers are assigned under the stream's ingest lane.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use tokio::sync::{Mutex, RwLock};

use exh_protocol::{ExhaustError, Level, StreamId, FIRST_SEQUENCE};

/// Frame delimiter, chosen from the request's content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Newline,
    Nul,
}

impl Delimiter {
    pub fn for_content_type(content_type: Option<&str>) -> Self {
        let is_binary = content_type
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/octet-stream"));
        if is_binary {
            Self::Nul
        } else {
            Self::Newline
        }
    }

    fn byte(self) -> u8 {
        match self {
            Self::Newline => b'\n',
            Self::Nul => 0,
        }
    }
}

/// Incremental splitter over body chunks.
///
/// Frames longer than `max_line_bytes` are cut at the limit; the remainder
/// up to the next delimiter is discarded.
#[derive(Debug)]
pub struct LineFramer {
    delimiter: Delimiter,
    max_line_bytes: usize,
    buf: Vec<u8>,
    truncated: bool,
}

impl LineFramer {
    pub fn new(delimiter: Delimiter, max_line_bytes: usize) -> Self {
        Self { delimiter, max_line_bytes: max_line_bytes.max(1), buf: Vec::new(), truncated: false }
    }

    /// Continue a frame left unfinished by an earlier upload.
    pub fn resume(&mut self, partial: Vec<u8>) {
        self.buf = partial;
        self.buf.truncate(self.max_line_bytes);
    }

    /// Feed a chunk; returns the frames it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let delim = self.delimiter.byte();
        let mut frames = Vec::new();
        for piece in chunk.split_inclusive(|b| *b == delim) {
            let (body, complete) = match piece.split_last() {
                Some((last, rest)) if *last == delim => (rest, true),
                _ => (piece, false),
            };
            let room = self.max_line_bytes.saturating_sub(self.buf.len());
            if body.len() > room {
                self.truncated = true;
            }
            self.buf.extend_from_slice(&body[..body.len().min(room)]);
            if complete {
                if let Some(frame) = self.take_frame() {
                    frames.push(frame);
                }
            }
        }
        frames
    }

    /// Flush whatever is buffered as a final frame.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.take_frame()
    }

    /// Bytes of the unfinished frame, for parking after a dropped connection.
    pub fn into_partial(self) -> Vec<u8> {
        self.buf
    }

    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let mut frame = std::mem::take(&mut self.buf);
        if self.truncated {
            tracing::debug!(limit = self.max_line_bytes, "Truncated oversized line");
            self.truncated = false;
        }
        if self.delimiter == Delimiter::Newline && frame.last() == Some(&b'\r') {
            frame.pop();
        }
        (!frame.is_empty()).then_some(frame)
    }
}

/// Result of parsing one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Level,
    pub source: Option<String>,
    pub message: Vec<u8>,
}

impl ParsedLine {
    fn fallback(frame: &[u8]) -> Self {
        Self { timestamp: None, level: Level::Info, source: None, message: frame.to_vec() }
    }
}

/// Parse a frame, trying JSON, logfmt, then plain text.
///
/// Anything unrecognised (including non-UTF-8 bytes) becomes an INFO record
/// with the frame kept verbatim.
pub fn parse_line(frame: &[u8]) -> ParsedLine {
    let Ok(text) = std::str::from_utf8(frame) else {
        return ParsedLine::fallback(frame);
    };
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        if let Some(parsed) = parse_json(trimmed) {
            return parsed;
        }
    }
    if trimmed.contains("level=") {
        if let Some(parsed) = parse_logfmt(trimmed) {
            return parsed;
        }
    }
    parse_plain(trimmed).unwrap_or_else(|| ParsedLine::fallback(frame))
}

const LEVEL_KEYS: &[&str] = &["level", "severity", "lvl"];
const MESSAGE_KEYS: &[&str] = &["message", "msg"];
const SOURCE_KEYS: &[&str] = &["source", "service", "logger", "target"];
const TIME_KEYS: &[&str] = &["timestamp", "ts", "time"];

fn parse_json(text: &str) -> Option<ParsedLine> {
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text).ok()?;
    let pick = |keys: &[&str]| keys.iter().find_map(|k| map.get(*k));

    let level = pick(LEVEL_KEYS).and_then(|v| v.as_str()).and_then(Level::parse);
    let message = pick(MESSAGE_KEYS).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    if level.is_none() && message.is_none() {
        return None;
    }
    let source = pick(SOURCE_KEYS).and_then(|v| v.as_str()).map(str::to_string);
    let timestamp = pick(TIME_KEYS).and_then(|v| match v {
        serde_json::Value::String(s) => parse_timestamp(s),
        serde_json::Value::Number(n) => n.as_f64().and_then(epoch_to_datetime),
        _ => None,
    });
    Some(ParsedLine {
        timestamp,
        level: level.unwrap_or(Level::Info),
        source,
        message: message.unwrap_or_else(|| text.to_string()).into_bytes(),
    })
}

fn logfmt_pair() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][A-Za-z0-9_.\-]*)=("(?:[^"\\]|\\.)*"|\S*)"#)
            .unwrap_or_else(|e| unreachable!("static logfmt regex: {e}"))
    })
}

fn parse_logfmt(text: &str) -> Option<ParsedLine> {
    let mut fields = HashMap::new();
    for cap in logfmt_pair().captures_iter(text) {
        let value = &cap[2];
        let value = match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
            Some(quoted) => quoted.replace("\\\"", "\"").replace("\\\\", "\\"),
            None => value.to_string(),
        };
        fields.insert(cap[1].to_ascii_lowercase(), value);
    }
    let pick = |keys: &[&str]| keys.iter().find_map(|k| fields.get(*k));

    let level = pick(LEVEL_KEYS).and_then(|v| Level::parse(v))?;
    Some(ParsedLine {
        timestamp: pick(TIME_KEYS).and_then(|v| parse_timestamp(v)),
        level,
        source: pick(SOURCE_KEYS).filter(|s| !s.is_empty()).cloned(),
        message: pick(MESSAGE_KEYS).cloned().unwrap_or_else(|| text.to_string()).into_bytes(),
    })
}

fn plain_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^(?:(?P<ts>\d{4}-\d{2}-\d{2}[T\ ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?)\s+)?
            \[?(?P<level>[A-Za-z]+)\]?:?
            (?:\s+|$)
            (?:\[(?P<src>[^\]]+)\]:?\s*|(?P<label>[A-Za-z0-9_.\-/]+):\s+)?
            (?P<msg>.*)$",
        )
        .unwrap_or_else(|e| unreachable!("static plain-text regex: {e}"))
    })
}

fn parse_plain(text: &str) -> Option<ParsedLine> {
    let caps = plain_line().captures(text)?;
    let level = Level::parse(caps.name("level")?.as_str())?;
    let source = caps.name("src").or_else(|| caps.name("label")).map(|m| m.as_str().trim().to_string());
    Some(ParsedLine {
        timestamp: caps.name("ts").and_then(|m| parse_timestamp(m.as_str())),
        level,
        source,
        message: caps.name("msg").map(|m| m.as_str()).unwrap_or_default().as_bytes().to_vec(),
    })
}

/// RFC 3339, or the same with a space separator and no offset (read as UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let normalized = raw.trim().replacen(' ', "T", 1).replacen(',', ".", 1);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Epoch seconds, or milliseconds when the value is too large for seconds.
fn epoch_to_datetime(value: f64) -> Option<DateTime<Utc>> {
    let millis = if value > 1e12 { value } else { value * 1000.0 };
    DateTime::from_timestamp_millis(millis as i64)
}

/// A partial frame parked after its upload connection dropped.
#[derive(Debug)]
pub struct ParkedPartial {
    pub bytes: Vec<u8>,
    /// Token generation that produced the bytes; only that token may finish them.
    pub generation: u32,
    pub parked_at: Instant,
}

impl ParkedPartial {
    /// Drop the bytes, logging why.
    pub fn discard(self, stream_id: &StreamId, reason: &str) {
        tracing::warn!(
            stream = %stream_id,
            bytes = self.bytes.len(),
            generation = self.generation,
            error = %ExhaustError::TokenTimeout,
            reason,
            "Discarding abandoned partial line"
        );
    }
}

/// Per-stream ingest state. Sequence assignment and publish both happen
/// while this lane is locked.
#[derive(Debug)]
pub struct IngestLane {
    pub next_sequence: u64,
    pub partial: Option<ParkedPartial>,
    /// Set on disconnect; no chunk publishes while it is set.
    pub closed: bool,
}

impl Default for IngestLane {
    fn default() -> Self {
        Self { next_sequence: FIRST_SEQUENCE, partial: None, closed: false }
    }
}

impl IngestLane {
    /// Take the parked partial if it belongs to `generation` and is still
    /// fresh. Any other parked partial is discarded.
    pub fn claim_partial(&mut self, stream_id: &StreamId, generation: u32, timeout: Duration) -> Option<Vec<u8>> {
        let parked = self.partial.take()?;
        if parked.generation != generation {
            parked.discard(stream_id, "parked by a revoked token");
            None
        } else if parked.parked_at.elapsed() >= timeout {
            parked.discard(stream_id, "reconnect timeout elapsed");
            None
        } else {
            Some(parked.bytes)
        }
    }
}

/// All ingest lanes, keyed by stream.
#[derive(Default)]
pub struct IngestLanes {
    lanes: RwLock<HashMap<StreamId, Arc<Mutex<IngestLane>>>>,
}

impl IngestLanes {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lane(&self, stream_id: &StreamId) -> Arc<Mutex<IngestLane>> {
        if let Some(lane) = self.lanes.read().await.get(stream_id) {
            return Arc::clone(lane);
        }
        let mut lanes = self.lanes.write().await;
        Arc::clone(lanes.entry(stream_id.clone()).or_default())
    }

    pub async fn remove(&self, stream_id: &StreamId) -> Option<Arc<Mutex<IngestLane>>> {
        self.lanes.write().await.remove(stream_id)
    }

    pub async fn snapshot(&self) -> Vec<(StreamId, Arc<Mutex<IngestLane>>)> {
        self.lanes
            .read()
            .await
            .iter()
            .map(|(id, lane)| (id.clone(), Arc::clone(lane)))
            .collect()
    }
}
