//! Static rule table for the tail analyzer.
//!
//! Rules are declared as [`RuleSpec`]s (defaults below, or loaded from the
//! `[[analyzer.rules]]` config section) and compiled into a [`RuleSet`] once
//! at startup. Compilation rejects bad regexes, zero thresholds and spans
//! outside `1..=MAX_ANALYSIS_SPAN_SECS`.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use chrono::TimeDelta;

use exh_protocol::{ExhaustError, FindingCategory, Level, Severity, MAX_ANALYSIS_SPAN_SECS};

use crate::window::{span_from_secs, WindowEntry};

fn default_min_level() -> Level {
    Level::Error
}

fn default_threshold() -> usize {
    1
}

fn default_within_secs() -> u64 {
    60
}

/// Declarative rule, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub name: String,
    pub category: FindingCategory,
    pub severity: Severity,
    pub title: String,
    /// Records below this level never match.
    #[serde(default = "default_min_level")]
    pub min_level: Level,
    /// Case-insensitive regex over the message.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Matches needed inside `within_secs` to fire.
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default = "default_within_secs")]
    pub within_secs: u64,
    /// Count matches separately per source label.
    #[serde(default)]
    pub per_source: bool,
    /// Remediation text emitted as a follow-up suggestion.
    #[serde(default)]
    pub hint: Option<String>,
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub spec: RuleSpec,
    pattern: Option<Regex>,
    within: TimeDelta,
}

impl Rule {
    pub fn compile(spec: RuleSpec) -> Result<Self, ExhaustError> {
        if spec.name.trim().is_empty() {
            return Err(ExhaustError::Config("rule name must not be empty".into()));
        }
        if spec.threshold == 0 {
            return Err(ExhaustError::Config(format!("rule '{}': threshold must be at least 1", spec.name)));
        }
        let within = span_from_secs(spec.within_secs).ok_or_else(|| {
            ExhaustError::Config(format!(
                "rule '{}': within_secs must be between 1 and {MAX_ANALYSIS_SPAN_SECS}",
                spec.name
            ))
        })?;
        let pattern = spec
            .pattern
            .as_deref()
            .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
            .transpose()
            .map_err(|e| ExhaustError::Config(format!("rule '{}': bad pattern: {e}", spec.name)))?;
        Ok(Self { spec, pattern, within })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn within(&self) -> TimeDelta {
        self.within
    }

    /// Does a single window entry match this rule?
    pub fn matches(&self, entry: &WindowEntry) -> bool {
        if entry.malformed || entry.level < self.spec.min_level {
            return false;
        }
        self.pattern.as_ref().map(|re| re.is_match(&entry.text)).unwrap_or(true)
    }
}

/// Ordered, validated rule table.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn compile(specs: Vec<RuleSpec>) -> Result<Self, ExhaustError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            if !seen.insert(spec.name.clone()) {
                return Err(ExhaustError::Config(format!("duplicate rule name '{}'", spec.name)));
            }
            rules.push(Rule::compile(spec)?);
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        let rules = default_rule_specs()
            .into_iter()
            .filter_map(|spec| Rule::compile(spec).ok())
            .collect();
        Self { rules }
    }
}

/// Built-in rule table.
pub fn default_rule_specs() -> Vec<RuleSpec> {
    vec![
        RuleSpec {
            name: "error-seen".into(),
            category: FindingCategory::ErrorPattern,
            severity: Severity::Warning,
            title: "Errors detected in stream".into(),
            min_level: Level::Error,
            pattern: None,
            threshold: 1,
            within_secs: 60,
            per_source: false,
            hint: None,
        },
        RuleSpec {
            name: "auth-denial-burst".into(),
            category: FindingCategory::Diagnosis,
            severity: Severity::Critical,
            title: "Repeated authentication or policy denials".into(),
            min_level: Level::Error,
            pattern: Some(
                r"policy denied|access denied|permission denied|auth\w*\s+(denied|failed|failure)|unauthori[sz]ed|forbidden"
                    .into(),
            ),
            threshold: 3,
            within_secs: 60,
            per_source: false,
            hint: Some(
                "Verify the caller's role assignment, check the access policy for the affected \
                 resources, and confirm the credential has not expired."
                    .into(),
            ),
        },
        RuleSpec {
            name: "source-error-storm".into(),
            category: FindingCategory::ErrorPattern,
            severity: Severity::Critical,
            title: "Error storm from a single source".into(),
            min_level: Level::Error,
            pattern: None,
            threshold: 10,
            within_secs: 30,
            per_source: true,
            hint: None,
        },
        RuleSpec {
            name: "timeout-cluster".into(),
            category: FindingCategory::Suggestion,
            severity: Severity::Warning,
            title: "Clustered timeouts".into(),
            min_level: Level::Warn,
            pattern: Some(r"time[d\s-]?out".into()),
            threshold: 3,
            within_secs: 120,
            per_source: false,
            hint: Some(
                "Check downstream latency and connection pool limits; consider raising the \
                 timeout only after confirming the dependency is healthy."
                    .into(),
            ),
        },
    ]
}
