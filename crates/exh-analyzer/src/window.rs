use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};

use exh_protocol::{Level, MAX_ANALYSIS_SPAN_SECS};

/// A configured span in seconds as a [`TimeDelta`]. `None` for zero or
/// anything longer than [`MAX_ANALYSIS_SPAN_SECS`].
pub fn span_from_secs(secs: u64) -> Option<TimeDelta> {
    if secs == 0 || secs > MAX_ANALYSIS_SPAN_SECS {
        return None;
    }
    TimeDelta::try_seconds(i64::try_from(secs).ok()?)
}

/// What the window remembers about one record.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub source: Option<String>,
    /// Decoded message; empty for malformed records.
    pub text: String,
    pub malformed: bool,
}

/// Sliding window bounded by record count and by age relative to the
/// newest record's timestamp.
#[derive(Debug)]
pub struct TailWindow {
    entries: VecDeque<WindowEntry>,
    max_records: usize,
    max_age: TimeDelta,
}

impl TailWindow {
    pub fn new(max_records: usize, max_age: TimeDelta) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_records.min(1024)),
            max_records: max_records.max(1),
            max_age,
        }
    }

    pub fn push(&mut self, entry: WindowEntry) {
        let newest = entry.timestamp;
        self.entries.push_back(entry);
        while self.entries.len() > self.max_records {
            self.entries.pop_front();
        }
        let Some(cutoff) = newest.checked_sub_signed(self.max_age) else {
            return;
        };
        while self.entries.front().is_some_and(|e| e.timestamp < cutoff) {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn malformed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.malformed).count()
    }

    /// Entries at or after `since`.
    pub fn since(&self, since: DateTime<Utc>) -> impl Iterator<Item = &WindowEntry> {
        self.entries.iter().filter(move |e| e.timestamp >= since)
    }

    pub fn span(&self) -> TimeDelta {
        self.max_age
    }
}
