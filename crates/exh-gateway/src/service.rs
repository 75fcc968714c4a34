use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;

use exh_analyzer::TailAnalyzer;
use exh_broker::{Broker, PublishOutcome, SubscriberKind, Subscription};
use exh_protocol::{
    AnalysisStatus, ExhaustError, Finding, LogRecord, StreamId, StreamInfo, StreamStatus,
    StreamSummary,
};
use exh_state::{FindingsStore, IssuedStream, NewStream, StreamRegistry};

use crate::auth::{AdminGuard, UploadLimiter};
use crate::config::{ExhaustConfig, IngestConfig};
use crate::ingest::{parse_line, Delimiter, IngestLane, IngestLanes, LineFramer, ParkedPartial};

/// Response to a successful upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    pub accepted: u64,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
}

impl IngestReceipt {
    fn empty() -> Self {
        Self { accepted: 0, first_sequence: None, last_sequence: None }
    }

    fn record(&mut self, sequence: u64) {
        self.accepted += 1;
        self.first_sequence.get_or_insert(sequence);
        self.last_sequence = Some(sequence);
    }
}

/// Streams plus per-status counts, for the management listing.
#[derive(Debug, Clone, Serialize)]
pub struct StreamListing {
    pub streams: Vec<StreamInfo>,
    pub summary: StreamSummary,
}

/// The whole pipeline behind the HTTP surface.
///
/// Every per-stream structure (registry entry, ingest lane, broker topic,
/// analyzer task) has its own lock, so work on one stream never waits on
/// another.
pub struct ExhaustService {
    ingest: IngestConfig,
    registry: Arc<StreamRegistry>,
    broker: Arc<Broker>,
    findings: Arc<FindingsStore>,
    analyzer: Arc<TailAnalyzer>,
    lanes: IngestLanes,
    limiter: Mutex<UploadLimiter>,
    admin: AdminGuard,
}

impl ExhaustService {
    pub fn new(config: &ExhaustConfig) -> Result<Self, ExhaustError> {
        config.validate()?;
        let registry = Arc::new(StreamRegistry::new(config.server.public_base_url()));
        let broker = Arc::new(Broker::new(config.broker.to_broker_config()));
        let findings = Arc::new(FindingsStore::new());
        let analyzer = Arc::new(TailAnalyzer::new(
            config.analyzer.to_analyzer_config(),
            config.analyzer.rule_set()?,
            Arc::clone(&registry),
            Arc::clone(&broker),
            Arc::clone(&findings),
        )?);
        Ok(Self {
            ingest: config.ingest.clone(),
            registry,
            broker,
            findings,
            analyzer,
            lanes: IngestLanes::new(),
            limiter: Mutex::new(UploadLimiter::new(
                config.ingest.rate_limit_burst,
                config.ingest.rate_limit_per_sec,
            )),
            admin: AdminGuard::new(config.server.admin_token.as_deref()),
        })
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn admin(&self) -> &AdminGuard {
        &self.admin
    }

    /// Create a stream, issue its token, and start analysing it.
    pub async fn create_stream(&self, req: NewStream) -> Result<IssuedStream, ExhaustError> {
        let issued = self.registry.create_stream(req).await?;
        self.lanes.lane(&issued.info.stream_id).await;
        self.analyzer.start(&issued.info.stream_id).await;
        Ok(issued)
    }

    /// Ingest an upload body for `stream_id`, authenticated by `token`.
    ///
    /// Records are published as soon as their frame completes. The token is
    /// re-checked under the stream's ingest lock before each chunk, so a
    /// revocation takes effect mid-upload. If the body fails part-way the
    /// unfinished frame is parked for the next upload with the same token.
    pub async fn ingest<S, E>(
        &self,
        stream_id: &StreamId,
        token: Option<&str>,
        content_type: Option<&str>,
        body: S,
    ) -> Result<IngestReceipt, ExhaustError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let token = token.ok_or(ExhaustError::Unauthorized)?;
        let generation = self.registry.authorize(stream_id, token).await?;
        if let Err(retry_after) = self.limiter.lock().await.admit(stream_id) {
            tracing::warn!(stream = %stream_id, ?retry_after, "Upload rate limited");
            return Err(ExhaustError::RateLimited);
        }

        let lane = self.lanes.lane(stream_id).await;
        let mut framer = LineFramer::new(Delimiter::for_content_type(content_type), self.ingest.max_line_bytes);
        let timeout = self.partial_timeout();
        if let Some(partial) = lane.lock().await.claim_partial(stream_id, generation, timeout) {
            tracing::debug!(stream = %stream_id, bytes = partial.len(), "Resuming parked partial line");
            framer.resume(partial);
        }

        let mut receipt = IngestReceipt::empty();
        let mut body = std::pin::pin!(body);
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.park_partial(stream_id, &lane, framer, generation).await;
                    tracing::info!(stream = %stream_id, error = %e, accepted = receipt.accepted, "Upload interrupted");
                    self.finish_batch(stream_id, &receipt).await;
                    return Err(ExhaustError::InvalidRequest(format!("upload interrupted: {e}")));
                }
            };
            let frames = framer.push(&chunk);
            self.publish_frames(stream_id, token, &lane, frames, &mut receipt).await?;
        }
        let tail: Vec<Vec<u8>> = framer.finish().into_iter().collect();
        self.publish_frames(stream_id, token, &lane, tail, &mut receipt).await?;

        self.finish_batch(stream_id, &receipt).await;
        tracing::debug!(
            stream = %stream_id,
            accepted = receipt.accepted,
            last_sequence = ?receipt.last_sequence,
            "Upload complete"
        );
        Ok(receipt)
    }

    /// Revalidate, sequence, and publish frames under the lane lock.
    async fn publish_frames(
        &self,
        stream_id: &StreamId,
        token: &str,
        lane: &Mutex<IngestLane>,
        frames: Vec<Vec<u8>>,
        receipt: &mut IngestReceipt,
    ) -> Result<(), ExhaustError> {
        let mut guard = lane.lock().await;
        if guard.closed {
            return Err(ExhaustError::Unauthorized);
        }
        self.registry.authorize(stream_id, token).await?;
        if frames.is_empty() {
            return Ok(());
        }

        let first_in_request = receipt.accepted == 0;
        let mut violation = None;
        for frame in frames {
            let parsed = parse_line(&frame);
            let record = LogRecord {
                stream_id: stream_id.clone(),
                sequence: guard.next_sequence,
                timestamp: parsed.timestamp.unwrap_or_else(Utc::now),
                level: parsed.level,
                source: parsed.source,
                message: parsed.message,
            };
            tracing::trace!(stream = %stream_id, sequence = record.sequence, level = %record.level, "Record parsed");
            match self.broker.publish(stream_id, record).await {
                Ok(PublishOutcome::Delivered { .. }) => {
                    receipt.record(guard.next_sequence);
                    guard.next_sequence += 1;
                }
                Ok(PublishOutcome::Duplicate) => {
                    tracing::warn!(stream = %stream_id, sequence = guard.next_sequence, "Broker reported duplicate; skipping ahead");
                    guard.next_sequence += 1;
                }
                Err(ExhaustError::StreamEnded) => return Err(ExhaustError::Unauthorized),
                Err(e @ ExhaustError::SequenceViolation { .. }) => {
                    violation = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        drop(guard);

        if let Some(e) = violation {
            tracing::error!(stream = %stream_id, error = %e, "Sequence invariant violated; disconnecting stream");
            if let Err(close_err) = self.disconnect(stream_id).await {
                tracing::error!(stream = %stream_id, error = %close_err, "Forced disconnect failed");
            }
            return Err(e);
        }
        if first_in_request && receipt.accepted > 0 {
            self.registry.set_status(stream_id, StreamStatus::Active).await?;
        }
        Ok(())
    }

    async fn finish_batch(&self, stream_id: &StreamId, receipt: &IngestReceipt) {
        if receipt.accepted == 0 {
            return;
        }
        if let Err(e) = self.registry.touch(stream_id).await {
            tracing::debug!(stream = %stream_id, error = %e, "Could not record activity");
        }
    }

    async fn park_partial(&self, stream_id: &StreamId, lane: &Mutex<IngestLane>, framer: LineFramer, generation: u32) {
        if !framer.has_partial() {
            return;
        }
        let bytes = framer.into_partial();
        let mut lane = lane.lock().await;
        if lane.closed {
            return;
        }
        tracing::debug!(stream = %stream_id, bytes = bytes.len(), generation, "Parked partial line");
        lane.partial = Some(ParkedPartial { bytes, generation, parked_at: Instant::now() });
    }

    /// Discard parked partial lines older than the configured timeout.
    pub async fn reap_partials(&self) -> usize {
        let timeout = self.partial_timeout();
        let mut reaped = 0;
        for (stream_id, lane) in self.lanes.snapshot().await {
            let mut lane = lane.lock().await;
            if lane.partial.as_ref().is_some_and(|p| p.parked_at.elapsed() >= timeout) {
                if let Some(parked) = lane.partial.take() {
                    parked.discard(&stream_id, "reconnect timeout elapsed");
                    reaped += 1;
                }
            }
        }
        reaped
    }

    /// Drop rate-limit buckets that have fully refilled.
    pub async fn prune_rate_limits(&self) -> usize {
        self.limiter.lock().await.prune()
    }

    /// Revoke the token and end every subscription of the stream.
    ///
    /// The analysis task finishes the records already delivered to it; a
    /// reissued token starts a fresh one.
    pub async fn disconnect(&self, stream_id: &StreamId) -> Result<StreamInfo, ExhaustError> {
        self.registry.revoke(stream_id).await?;
        {
            let lane = self.lanes.lane(stream_id).await;
            let mut lane = lane.lock().await;
            lane.closed = true;
            if let Some(parked) = lane.partial.take() {
                parked.discard(stream_id, "stream disconnected");
            }
        }
        self.broker.close_stream(stream_id).await;
        self.analyzer.detach(stream_id).await;
        self.registry.get(stream_id).await
    }

    /// Issue a fresh token; a disconnected stream goes back to waiting.
    pub async fn reissue_token(&self, stream_id: &StreamId) -> Result<IssuedStream, ExhaustError> {
        let issued = self.registry.reissue_token(stream_id).await?;
        {
            let lane = self.lanes.lane(stream_id).await;
            let mut lane = lane.lock().await;
            lane.closed = false;
            if let Some(parked) = lane.partial.take() {
                parked.discard(stream_id, "token reissued");
            }
        }
        self.broker.reopen(stream_id).await;
        self.analyzer.start(stream_id).await;
        Ok(issued)
    }

    /// Delete a stream. Its findings are kept.
    pub async fn delete(&self, stream_id: &StreamId) -> Result<StreamInfo, ExhaustError> {
        let info = self.registry.delete(stream_id).await?;
        if let Some(lane) = self.lanes.remove(stream_id).await {
            let mut lane = lane.lock().await;
            lane.closed = true;
            if let Some(parked) = lane.partial.take() {
                parked.discard(stream_id, "stream deleted");
            }
        }
        self.broker.remove_stream(stream_id).await;
        self.analyzer.stop(stream_id).await;
        self.limiter.lock().await.forget(stream_id);
        Ok(info)
    }

    pub async fn get(&self, stream_id: &StreamId) -> Result<StreamInfo, ExhaustError> {
        self.registry.get(stream_id).await
    }

    pub async fn list(&self) -> StreamListing {
        let streams = self.registry.list().await;
        let summary = self.registry.summary().await;
        StreamListing { streams, summary }
    }

    /// Findings from position `since`. Deleted streams keep theirs.
    pub async fn findings(&self, stream_id: &StreamId, since: usize) -> Result<Vec<Finding>, ExhaustError> {
        self.ensure_known(stream_id).await?;
        Ok(self.findings.list_since(stream_id, since).await)
    }

    /// Where the stream's tail analysis stands.
    pub async fn analysis_status(&self, stream_id: &StreamId) -> Result<AnalysisStatus, ExhaustError> {
        self.ensure_known(stream_id).await?;
        Ok(self.analyzer.status(stream_id).await)
    }

    /// Live or deleted; only never-created ids fail.
    async fn ensure_known(&self, stream_id: &StreamId) -> Result<(), ExhaustError> {
        if !self.registry.is_deleted(stream_id).await {
            self.registry.get(stream_id).await?;
        }
        Ok(())
    }

    /// Open a viewer subscription: backlog first, then live records and findings.
    pub async fn subscribe(&self, stream_id: &StreamId) -> Result<Subscription, ExhaustError> {
        self.registry.get(stream_id).await?;
        Ok(self.broker.subscribe(stream_id, SubscriberKind::Viewer).await)
    }

    pub async fn shutdown(&self) {
        self.analyzer.shutdown().await;
    }

    fn partial_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest.partial_line_timeout_secs)
    }
}
