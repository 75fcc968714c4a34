//! Relates a firing rule to past incidents on other streams.
//!
//! When a rule fires, every other stream where the same rule fired before is
//! a candidate incident; the streams' ticket references are what an
//! engineer follows up on. One `match` finding is emitted per rule each time
//! the set of related streams grows.

use std::collections::HashMap;
use std::sync::Arc;

use exh_protocol::{Finding, FindingCategory, Severity, StreamId};
use exh_state::{FindingsStore, StreamRegistry};

use crate::analysis::MALFORMED_RULE;

/// Most incidents listed in one finding body.
const MAX_LISTED: usize = 5;

pub struct IncidentMatcher {
    stream_id: StreamId,
    registry: Arc<StreamRegistry>,
    findings: Arc<FindingsStore>,
    /// Related-stream count last reported, per rule.
    reported: HashMap<String, usize>,
}

impl IncidentMatcher {
    pub fn new(stream_id: StreamId, registry: Arc<StreamRegistry>, findings: Arc<FindingsStore>) -> Self {
        Self { stream_id, registry, findings, reported: HashMap::new() }
    }

    /// A `match` finding for `fired`, if it relates to incidents not yet reported.
    pub async fn related(&mut self, fired: &Finding) -> Option<Finding> {
        if matches!(fired.category, FindingCategory::Match | FindingCategory::Suggestion)
            || fired.rule == MALFORMED_RULE
        {
            return None;
        }
        let related = self.findings.streams_with_rule(&fired.rule, &self.stream_id).await;
        let reported = self.reported.get(&fired.rule).copied().unwrap_or(0);
        if related.len() <= reported {
            return None;
        }
        self.reported.insert(fired.rule.clone(), related.len());

        let mut lines = Vec::with_capacity(related.len().min(MAX_LISTED));
        for (other, first_seen) in related.iter().take(MAX_LISTED) {
            let line = match self.registry.get(other).await {
                Ok(info) => match info.ticket_ref {
                    Some(ticket) => format!("- {ticket}: {} (since {})", info.name, first_seen.to_rfc3339()),
                    None => format!("- {}: no linked ticket (since {})", info.name, first_seen.to_rfc3339()),
                },
                Err(_) => format!("- deleted stream {other} (since {})", first_seen.to_rfc3339()),
            };
            lines.push(line);
        }
        if related.len() > MAX_LISTED {
            lines.push(format!("- and {} more", related.len() - MAX_LISTED));
        }

        tracing::info!(
            stream = %self.stream_id,
            rule = %fired.rule,
            related = related.len(),
            "Matched past incidents"
        );
        Some(Finding::new(
            self.stream_id.clone(),
            fired.rule.clone(),
            FindingCategory::Match,
            Severity::Info,
            "Matching past incidents",
            format!(
                "Found {} similar incident(s) on other streams for '{}':\n{}",
                related.len(),
                fired.title,
                lines.join("\n")
            ),
        ))
    }
}
