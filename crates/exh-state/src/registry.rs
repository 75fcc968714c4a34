//! Stream registry: lifecycle, token issuance and validation.
//!
//! The id/token maps sit behind one registry-wide lock; each stream entry
//! has its own mutex so validation and status changes for one stream are
//! serialized without blocking the others. Lock order is registry → entry;
//! no path takes the registry lock while holding an entry lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

use exh_protocol::token::looks_like_token;
use exh_protocol::{
    generate_token, token_digest, ExhaustError, StreamId, StreamInfo, StreamStatus,
    StreamSummary, StreamToken, MAX_STREAM_NAME_CHARS,
};

/// Stream creation request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewStream {
    pub name: String,
    #[serde(default)]
    pub ticket_ref: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// A stream together with its freshly issued token.
#[derive(Debug, Clone)]
pub struct IssuedStream {
    pub info: StreamInfo,
    pub token: StreamToken,
}

/// Outcome of a status transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Changed { from: StreamStatus, to: StreamStatus },
    Unchanged,
    /// Would regress the lifecycle; ignored.
    Rejected { current: StreamStatus, requested: StreamStatus },
}

struct StreamEntry {
    info: StreamInfo,
    /// Digest of the live token; `None` once revoked.
    token_digest: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    streams: HashMap<StreamId, Arc<Mutex<StreamEntry>>>,
    /// token digest → stream
    tokens: HashMap<String, StreamId>,
    deleted: HashSet<StreamId>,
}

pub struct StreamRegistry {
    public_base_url: String,
    inner: RwLock<RegistryInner>,
}

impl StreamRegistry {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn stream_url(&self, stream_id: &StreamId) -> String {
        format!("{}/streams/{}", self.public_base_url, stream_id)
    }

    /// Create a waiting stream and issue its token.
    pub async fn create_stream(&self, req: NewStream) -> Result<IssuedStream, ExhaustError> {
        let name = validate_name(&req.name)?;
        let ticket_ref = normalize_optional(req.ticket_ref);
        let created_by = normalize_optional(req.created_by);

        let stream_id = StreamId::generate();
        let token = generate_token();
        let now = Utc::now();
        let info = StreamInfo {
            stream_id: stream_id.clone(),
            name,
            status: StreamStatus::Waiting,
            ticket_ref,
            created_by,
            stream_url: self.stream_url(&stream_id),
            token_generation: 1,
            created_at: now,
            last_activity: now,
        };
        let entry = StreamEntry { info: info.clone(), token_digest: Some(token.digest()) };

        let mut inner = self.inner.write().await;
        inner.tokens.insert(token.digest(), stream_id.clone());
        inner.streams.insert(stream_id.clone(), Arc::new(Mutex::new(entry)));
        drop(inner);

        tracing::info!(stream = %stream_id, name = %info.name, "Stream created");
        Ok(IssuedStream { info, token })
    }

    /// Resolve a bearer token to its stream.
    ///
    /// Fails with `Unauthorized` for unknown, revoked, superseded, or
    /// deleted-stream tokens.
    pub async fn validate_token(&self, token: &str) -> Result<StreamId, ExhaustError> {
        self.resolve(token).await.map(|(stream_id, _)| stream_id)
    }

    /// Validate a token against the stream named in a request path and
    /// return the token generation it belongs to.
    pub async fn authorize(&self, stream_id: &StreamId, token: &str) -> Result<u32, ExhaustError> {
        if self.inner.read().await.deleted.contains(stream_id) {
            return Err(ExhaustError::StreamGone(stream_id.clone()));
        }
        let (bound, generation) = self.resolve(token).await?;
        if bound != *stream_id {
            tracing::warn!(stream = %stream_id, "Token presented for a different stream");
            return Err(ExhaustError::Unauthorized);
        }
        Ok(generation)
    }

    async fn resolve(&self, token: &str) -> Result<(StreamId, u32), ExhaustError> {
        if !looks_like_token(token) {
            return Err(ExhaustError::Unauthorized);
        }
        let digest = token_digest(token);
        let entry = {
            let inner = self.inner.read().await;
            let stream_id = inner.tokens.get(&digest).ok_or(ExhaustError::Unauthorized)?;
            inner.streams.get(stream_id).cloned().ok_or(ExhaustError::Unauthorized)?
        };
        let entry = entry.lock().await;
        match (&entry.token_digest, entry.info.status) {
            (Some(live), status) if *live == digest && status != StreamStatus::Disconnected => {
                Ok((entry.info.stream_id.clone(), entry.info.token_generation))
            }
            _ => Err(ExhaustError::Unauthorized),
        }
    }

    /// Apply a lifecycle transition, refusing regressions.
    pub async fn set_status(
        &self,
        stream_id: &StreamId,
        status: StreamStatus,
    ) -> Result<StatusChange, ExhaustError> {
        if status == StreamStatus::Disconnected {
            return self.revoke(stream_id).await;
        }
        let entry = self.entry(stream_id).await?;
        let mut entry = entry.lock().await;
        let current = entry.info.status;
        let change = match (current, status) {
            (from, to) if from == to => StatusChange::Unchanged,
            (StreamStatus::Waiting, StreamStatus::Active) => {
                entry.info.status = StreamStatus::Active;
                entry.info.last_activity = Utc::now();
                StatusChange::Changed { from: current, to: status }
            }
            _ => StatusChange::Rejected { current, requested: status },
        };
        drop(entry);

        match change {
            StatusChange::Changed { from, to } => {
                tracing::info!(stream = %stream_id, %from, %to, "Stream status changed");
            }
            StatusChange::Rejected { current, requested } => {
                tracing::warn!(
                    stream = %stream_id,
                    %current,
                    %requested,
                    "Rejected non-monotonic status transition"
                );
            }
            StatusChange::Unchanged => {}
        }
        Ok(change)
    }

    /// Revoke the stream's token and mark it disconnected.
    pub async fn revoke(&self, stream_id: &StreamId) -> Result<StatusChange, ExhaustError> {
        let entry = self.entry(stream_id).await?;
        let (change, digest) = {
            let mut entry = entry.lock().await;
            let current = entry.info.status;
            entry.info.status = StreamStatus::Disconnected;
            entry.info.last_activity = Utc::now();
            let change = if current == StreamStatus::Disconnected {
                StatusChange::Unchanged
            } else {
                StatusChange::Changed { from: current, to: StreamStatus::Disconnected }
            };
            (change, entry.token_digest.take())
        };
        if let Some(digest) = digest {
            self.inner.write().await.tokens.remove(&digest);
        }
        if let StatusChange::Changed { from, .. } = change {
            tracing::info!(stream = %stream_id, %from, "Stream token revoked");
        }
        Ok(change)
    }

    /// Issue a new token, invalidating the old one. A disconnected stream
    /// goes back to waiting; this is the only way out of `Disconnected`.
    pub async fn reissue_token(&self, stream_id: &StreamId) -> Result<IssuedStream, ExhaustError> {
        let entry = self.entry(stream_id).await?;
        let token = generate_token();
        let (info, old_digest) = {
            let mut entry = entry.lock().await;
            if entry.info.status == StreamStatus::Disconnected {
                entry.info.status = StreamStatus::Waiting;
            }
            entry.info.token_generation += 1;
            entry.info.last_activity = Utc::now();
            let old = entry.token_digest.replace(token.digest());
            (entry.info.clone(), old)
        };

        let mut inner = self.inner.write().await;
        if let Some(old) = old_digest {
            inner.tokens.remove(&old);
        }
        // Deleted between the entry lookup and now: do not resurrect the token.
        if inner.streams.contains_key(stream_id) {
            inner.tokens.insert(token.digest(), stream_id.clone());
        } else {
            return Err(ExhaustError::StreamGone(stream_id.clone()));
        }
        drop(inner);

        tracing::info!(
            stream = %stream_id,
            generation = info.token_generation,
            "Stream token reissued"
        );
        Ok(IssuedStream { info, token })
    }

    /// Remove a stream. Its id is tombstoned so later uploads get `Gone`.
    pub async fn delete(&self, stream_id: &StreamId) -> Result<StreamInfo, ExhaustError> {
        let mut inner = self.inner.write().await;
        if inner.deleted.contains(stream_id) {
            return Err(ExhaustError::StreamGone(stream_id.clone()));
        }
        let entry = inner
            .streams
            .remove(stream_id)
            .ok_or_else(|| ExhaustError::StreamNotFound(stream_id.clone()))?;
        inner.deleted.insert(stream_id.clone());
        let mut entry = entry.lock().await;
        if let Some(digest) = entry.token_digest.take() {
            inner.tokens.remove(&digest);
        }
        entry.info.status = StreamStatus::Disconnected;
        let info = entry.info.clone();
        drop(entry);
        drop(inner);

        tracing::info!(stream = %stream_id, "Stream deleted");
        Ok(info)
    }

    /// Record ingest activity.
    pub async fn touch(&self, stream_id: &StreamId) -> Result<(), ExhaustError> {
        let entry = self.entry(stream_id).await?;
        entry.lock().await.info.last_activity = Utc::now();
        Ok(())
    }

    pub async fn get(&self, stream_id: &StreamId) -> Result<StreamInfo, ExhaustError> {
        let entry = self.entry(stream_id).await?;
        let info = entry.lock().await.info.clone();
        Ok(info)
    }

    pub async fn status(&self, stream_id: &StreamId) -> Result<StreamStatus, ExhaustError> {
        Ok(self.get(stream_id).await?.status)
    }

    /// All live streams, oldest first.
    pub async fn list(&self) -> Vec<StreamInfo> {
        let entries: Vec<_> = self.inner.read().await.streams.values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.info.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.stream_id.cmp(&b.stream_id)));
        out
    }

    pub async fn summary(&self) -> StreamSummary {
        let mut summary = StreamSummary::default();
        for info in self.list().await {
            summary.total += 1;
            match info.status {
                StreamStatus::Active => summary.active += 1,
                StreamStatus::Waiting => summary.waiting += 1,
                StreamStatus::Disconnected => summary.disconnected += 1,
            }
        }
        summary
    }

    pub async fn is_deleted(&self, stream_id: &StreamId) -> bool {
        self.inner.read().await.deleted.contains(stream_id)
    }

    async fn entry(&self, stream_id: &StreamId) -> Result<Arc<Mutex<StreamEntry>>, ExhaustError> {
        let inner = self.inner.read().await;
        if let Some(entry) = inner.streams.get(stream_id) {
            return Ok(Arc::clone(entry));
        }
        if inner.deleted.contains(stream_id) {
            Err(ExhaustError::StreamGone(stream_id.clone()))
        } else {
            Err(ExhaustError::StreamNotFound(stream_id.clone()))
        }
    }
}

fn validate_name(name: &str) -> Result<String, ExhaustError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ExhaustError::InvalidRequest("stream name must not be empty".into()));
    }
    if name.chars().count() > MAX_STREAM_NAME_CHARS {
        return Err(ExhaustError::InvalidRequest(format!(
            "stream name longer than {MAX_STREAM_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

/// Blank optional fields count as absent.
fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
