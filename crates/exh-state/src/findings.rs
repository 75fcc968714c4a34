//! Append-only findings store.
//!
//! There is deliberately no update or delete path: history stays auditable
//! even when a later finding contradicts an earlier one.

use std::collections::HashMap;

use tokio::sync::RwLock;

use chrono::{DateTime, Utc};

use exh_protocol::{ExhaustError, Finding, StreamId};

#[derive(Default)]
pub struct FindingsStore {
    streams: RwLock<HashMap<StreamId, Vec<Finding>>>,
}

impl FindingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finding; returns its position in the stream's history.
    pub async fn append(&self, stream_id: &StreamId, finding: Finding) -> Result<usize, ExhaustError> {
        if finding.stream_id != *stream_id {
            return Err(ExhaustError::InvalidRequest(format!(
                "finding for stream {} appended to {}",
                finding.stream_id, stream_id
            )));
        }
        let mut streams = self.streams.write().await;
        let list = streams.entry(stream_id.clone()).or_default();
        tracing::debug!(
            stream = %stream_id,
            rule = %finding.rule,
            severity = ?finding.severity,
            "Finding recorded"
        );
        list.push(finding);
        Ok(list.len() - 1)
    }

    /// Every finding of a stream, in append order.
    pub async fn list(&self, stream_id: &StreamId) -> Vec<Finding> {
        self.list_since(stream_id, 0).await
    }

    /// Findings from position `offset` onward, for polling clients.
    pub async fn list_since(&self, stream_id: &StreamId, offset: usize) -> Vec<Finding> {
        self.streams
            .read()
            .await
            .get(stream_id)
            .map(|list| list.iter().skip(offset).cloned().collect())
            .unwrap_or_default()
    }

    /// Other streams where `rule` has fired, with the time it first did,
    /// oldest first.
    pub async fn streams_with_rule(&self, rule: &str, exclude: &StreamId) -> Vec<(StreamId, DateTime<Utc>)> {
        let streams = self.streams.read().await;
        let mut hits: Vec<_> = streams
            .iter()
            .filter(|(id, _)| *id != exclude)
            .filter_map(|(id, list)| {
                list.iter()
                    .find(|f| f.rule == rule)
                    .map(|f| (id.clone(), f.timestamp))
            })
            .collect();
        hits.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hits
    }

    pub async fn len(&self, stream_id: &StreamId) -> usize {
        self.streams.read().await.get(stream_id).map(Vec::len).unwrap_or(0)
    }
}
