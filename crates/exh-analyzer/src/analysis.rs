use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use exh_protocol::{
    ExhaustError, Finding, FindingCategory, LogRecord, Severity, StreamId, DEFAULT_WINDOW_RECORDS,
    DEFAULT_WINDOW_SECS, MAX_ANALYSIS_SPAN_SECS,
};

use crate::rules::{Rule, RuleSet};
use crate::window::{span_from_secs, TailWindow, WindowEntry};

/// Rule name used for the malformed-record diagnosis.
pub const MALFORMED_RULE: &str = "malformed-records";

const EXCERPT_CHARS: usize = 200;

/// Window sizing and malformed-record thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub window_records: usize,
    pub window_secs: u64,
    /// Fraction of malformed records in the window that triggers a diagnosis.
    pub bad_record_ratio: f64,
    pub bad_record_min_samples: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_records: DEFAULT_WINDOW_RECORDS,
            window_secs: DEFAULT_WINDOW_SECS,
            bad_record_ratio: 0.2,
            bad_record_min_samples: 20,
        }
    }
}

impl AnalyzerConfig {
    /// The window's age bound.
    pub fn window_span(&self) -> Result<TimeDelta, ExhaustError> {
        span_from_secs(self.window_secs).ok_or_else(|| {
            ExhaustError::Config(format!(
                "analyzer.window_secs must be between 1 and {MAX_ANALYSIS_SPAN_SECS}"
            ))
        })
    }

    pub fn validate(&self) -> Result<(), ExhaustError> {
        if self.window_records == 0 {
            return Err(ExhaustError::Config("analyzer.window_records must be positive".into()));
        }
        self.window_span()?;
        if !(0.0..=1.0).contains(&self.bad_record_ratio) {
            return Err(ExhaustError::Config("analyzer.bad_record_ratio must be within 0..=1".into()));
        }
        Ok(())
    }
}

/// Incremental analysis state for one stream.
///
/// Purely synchronous: the async task in [`crate::TailAnalyzer`] feeds it
/// records in sequence order and collects the findings it returns.
pub struct StreamAnalysis {
    stream_id: StreamId,
    config: AnalyzerConfig,
    rules: Arc<RuleSet>,
    window: TailWindow,
    last_sequence: u64,
    /// Per (rule, source) key: record time before which the rule stays quiet.
    quiet_until: HashMap<(usize, Option<String>), DateTime<Utc>>,
    last_malformed_diagnosis: Option<DateTime<Utc>>,
    malformed_total: u64,
}

impl StreamAnalysis {
    pub fn new(stream_id: StreamId, config: AnalyzerConfig, rules: Arc<RuleSet>) -> Result<Self, ExhaustError> {
        config.validate()?;
        let window = TailWindow::new(config.window_records, config.window_span()?);
        Ok(Self {
            stream_id,
            config,
            rules,
            window,
            last_sequence: 0,
            quiet_until: HashMap::new(),
            last_malformed_diagnosis: None,
            malformed_total: 0,
        })
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Total malformed records seen since the analysis started.
    pub fn malformed_total(&self) -> u64 {
        self.malformed_total
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Feed one record; returns the findings it triggered, in emission order.
    pub fn observe(&mut self, record: &LogRecord) -> Vec<Finding> {
        match self.inspect(record) {
            Ok(entry) => {
                self.last_sequence = record.sequence;
                self.window.push(entry.clone());
                self.evaluate_rules(&entry)
            }
            Err(e) => {
                self.malformed_total += 1;
                tracing::debug!(
                    stream = %self.stream_id,
                    sequence = record.sequence,
                    error = %e,
                    "Skipping malformed record"
                );
                self.window.push(WindowEntry {
                    sequence: record.sequence,
                    timestamp: record.timestamp,
                    level: record.level,
                    source: record.source.clone(),
                    text: String::new(),
                    malformed: true,
                });
                self.check_malformed_ratio(record.timestamp).into_iter().collect()
            }
        }
    }

    fn inspect(&self, record: &LogRecord) -> Result<WindowEntry, ExhaustError> {
        if record.sequence <= self.last_sequence {
            return Err(ExhaustError::MalformedRecord(format!(
                "sequence {} already analysed (last {})",
                record.sequence, self.last_sequence
            )));
        }
        let text = std::str::from_utf8(&record.message)
            .map_err(|e| ExhaustError::MalformedRecord(format!("message is not UTF-8: {e}")))?;
        Ok(WindowEntry {
            sequence: record.sequence,
            timestamp: record.timestamp,
            level: record.level,
            source: record.source.clone(),
            text: text.to_string(),
            malformed: false,
        })
    }

    fn evaluate_rules(&mut self, latest: &WindowEntry) -> Vec<Finding> {
        let rules = Arc::clone(&self.rules);
        let mut findings = Vec::new();
        for (idx, rule) in rules.rules().iter().enumerate() {
            if !rule.matches(latest) {
                continue;
            }
            let source = if rule.spec.per_source { latest.source.clone() } else { None };
            let key = (idx, source);
            if self.quiet_until.get(&key).is_some_and(|until| latest.timestamp < *until) {
                continue;
            }

            let since = latest
                .timestamp
                .checked_sub_signed(rule.within())
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let count = self
                .window
                .since(since)
                .filter(|e| rule.matches(e))
                .filter(|e| !rule.spec.per_source || e.source == key.1)
                .count();
            if count < rule.spec.threshold {
                continue;
            }

            let quiet_until = latest
                .timestamp
                .checked_add_signed(rule.within())
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.quiet_until.insert(key.clone(), quiet_until);
            tracing::info!(
                stream = %self.stream_id,
                rule = %rule.name(),
                count,
                "Rule fired"
            );
            findings.push(self.rule_finding(rule, latest, count, key.1.as_deref()));
            if let Some(hint) = &rule.spec.hint {
                findings.push(Finding::new(
                    self.stream_id.clone(),
                    rule.name(),
                    FindingCategory::Suggestion,
                    rule.spec.severity,
                    format!("Suggested fix: {}", rule.spec.title),
                    hint.clone(),
                ));
            }
        }
        findings
    }

    fn rule_finding(&self, rule: &Rule, latest: &WindowEntry, count: usize, source: Option<&str>) -> Finding {
        let mut body = format!(
            "{count} matching record(s) within {}s (threshold {}).",
            rule.spec.within_secs, rule.spec.threshold
        );
        if let Some(source) = source {
            body.push_str(&format!(" Source: {source}."));
        }
        body.push_str(&format!(
            " Latest at sequence {}: {}",
            latest.sequence,
            excerpt(&latest.text)
        ));
        Finding::new(
            self.stream_id.clone(),
            rule.name(),
            rule.spec.category,
            rule.spec.severity,
            rule.spec.title.clone(),
            body,
        )
    }

    fn check_malformed_ratio(&mut self, now: DateTime<Utc>) -> Option<Finding> {
        let total = self.window.len();
        if total < self.config.bad_record_min_samples.max(1) {
            return None;
        }
        let bad = self.window.malformed_count();
        let ratio = bad as f64 / total as f64;
        if ratio <= self.config.bad_record_ratio {
            return None;
        }
        let span = self.window.span();
        if self
            .last_malformed_diagnosis
            .is_some_and(|last| last.checked_add_signed(span).map_or(true, |until| now < until))
        {
            return None;
        }
        self.last_malformed_diagnosis = Some(now);
        tracing::warn!(
            stream = %self.stream_id,
            malformed = bad,
            window = total,
            "Malformed record ratio exceeded"
        );
        Some(Finding::new(
            self.stream_id.clone(),
            MALFORMED_RULE,
            FindingCategory::Diagnosis,
            Severity::Info,
            "Stream contains malformed records",
            format!(
                "{bad} of the last {total} records could not be analysed ({:.0}%). \
                 Check the uploader's encoding and that records are not being replayed.",
                ratio * 100.0
            ),
        ))
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(EXCERPT_CHARS).collect();
    cut.push('…');
    cut
}
