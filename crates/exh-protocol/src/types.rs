use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque stream identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    #[default]
    /// Created, nothing ingested yet with the current token
    Waiting,
    /// At least one record ingested
    Active,
    /// Token revoked; terminal until a new token is issued
    Disconnected,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// Registry view of a stream. Never carries the token itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream_id: StreamId,
    pub name: String,
    pub status: StreamStatus,
    pub ticket_ref: Option<String>,
    pub created_by: Option<String>,
    pub stream_url: String,
    pub token_generation: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Per-status stream counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub total: usize,
    pub active: usize,
    pub waiting: usize,
    pub disconnected: usize,
}

/// Log level of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Recognise a level token, ignoring case and common aliases.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "ERROR" | "ERR" | "FATAL" | "CRITICAL" | "CRIT" | "PANIC" => Some(Self::Error),
            "WARN" | "WARNING" => Some(Self::Warn),
            "INFO" | "NOTICE" => Some(Self::Info),
            "DEBUG" | "TRACE" => Some(Self::Debug),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, sequenced log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub stream_id: StreamId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub source: Option<String>,
    /// Raw message bytes; rendered as lossy UTF-8 on the wire.
    #[serde(with = "lossy_bytes")]
    pub message: Vec<u8>,
}

impl LogRecord {
    pub fn message_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.message)
    }
}

mod lossy_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(d).map(String::into_bytes)
    }
}

/// Kind of analyzer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    ErrorPattern,
    Suggestion,
    Match,
    Diagnosis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A detected pattern in a stream's logs. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: String,
    pub stream_id: StreamId,
    pub category: FindingCategory,
    pub severity: Severity,
    /// Rule that produced this finding.
    pub rule: String,
    pub title: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Finding {
    pub fn new(
        stream_id: StreamId,
        rule: impl Into<String>,
        category: FindingCategory,
        severity: Severity,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            finding_id: Uuid::new_v4().to_string(),
            stream_id,
            category,
            severity,
            rule: rule.into(),
            title: title.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Where a stream's tail analysis stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisState {
    /// No record analysed yet
    #[default]
    Idle,
    Analyzing,
    /// The stream ended or analysis was stopped
    Complete,
}

/// Progress report of a stream's tail analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStatus {
    pub state: AnalysisState,
    pub status_message: String,
    pub records_analyzed: u64,
    pub findings: u64,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisStatus {
    pub fn idle() -> Self {
        Self {
            state: AnalysisState::Idle,
            status_message: "Waiting for log data".into(),
            records_analyzed: 0,
            findings: 0,
            updated_at: Utc::now(),
        }
    }

    /// Account for one analysed record and the findings it produced.
    pub fn record_analyzed(&mut self, findings: usize) {
        self.state = AnalysisState::Analyzing;
        self.records_analyzed += 1;
        self.findings += findings as u64;
        self.status_message = format!(
            "Scanning logs for error patterns: {} records, {} findings",
            self.records_analyzed, self.findings
        );
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, why: &str) {
        self.state = AnalysisState::Complete;
        self.status_message = format!(
            "Analysis complete ({why}): {} records, {} findings",
            self.records_analyzed, self.findings
        );
        self.updated_at = Utc::now();
    }
}

/// Item delivered on a viewer's push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Record(LogRecord),
    Finding(Finding),
}

impl StreamEvent {
    /// Event name used on SSE channels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Record(_) => "record",
            Self::Finding(_) => "finding",
        }
    }
}

/// Why a subscription stopped delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    SlowConsumer,
    StreamEnded,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SlowConsumer => "slow_consumer",
            Self::StreamEnded => "stream_ended",
        }
    }
}

impl From<CloseReason> for crate::ExhaustError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::SlowConsumer => crate::ExhaustError::SlowConsumer,
            CloseReason::StreamEnded => crate::ExhaustError::StreamEnded,
        }
    }
}
