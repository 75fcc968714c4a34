//! Upload admission: per-stream rate limiting, bearer-token extraction and
//! the admin-token check for management routes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};

use exh_protocol::{token_digest, StreamId};

/// Token bucket per stream, charged one token per upload request.
pub struct UploadLimiter {
    buckets: HashMap<StreamId, Bucket>,
    burst: f64,
    per_sec: f64,
}

struct Bucket {
    available: f64,
    updated: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, burst: f64, per_sec: f64) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.available = (self.available + elapsed * per_sec).min(burst);
        self.updated = now;
    }
}

impl UploadLimiter {
    pub fn new(burst: u32, per_sec: f64) -> Self {
        Self { buckets: HashMap::new(), burst: f64::from(burst), per_sec }
    }

    /// Charge one upload to `stream_id`. On refusal, returns how long until
    /// the next upload would be admitted.
    pub fn admit(&mut self, stream_id: &StreamId) -> Result<(), Duration> {
        self.admit_at(stream_id, Instant::now())
    }

    fn admit_at(&mut self, stream_id: &StreamId, now: Instant) -> Result<(), Duration> {
        let (burst, per_sec) = (self.burst, self.per_sec);
        let bucket = self
            .buckets
            .entry(stream_id.clone())
            .or_insert(Bucket { available: burst, updated: now });
        bucket.refill(now, burst, per_sec);
        if bucket.available >= 1.0 {
            bucket.available -= 1.0;
            return Ok(());
        }
        if per_sec <= 0.0 {
            return Err(Duration::MAX);
        }
        Err(Duration::try_from_secs_f64((1.0 - bucket.available) / per_sec).unwrap_or(Duration::MAX))
    }

    /// Drop a deleted stream's bucket.
    pub fn forget(&mut self, stream_id: &StreamId) {
        self.buckets.remove(stream_id);
    }

    /// Drop buckets that have refilled to the full burst; a fresh bucket
    /// admits exactly the same. Returns how many were dropped.
    pub fn prune(&mut self) -> usize {
        self.prune_at(Instant::now())
    }

    fn prune_at(&mut self, now: Instant) -> usize {
        let (burst, per_sec) = (self.burst, self.per_sec);
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.refill(now, burst, per_sec);
            bucket.available < burst
        });
        before - self.buckets.len()
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

/// The token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Admin credential held as a digest; presented tokens are digested before
/// comparing, so the comparison never runs over the secret itself.
#[derive(Clone)]
pub struct AdminGuard {
    digest: Option<String>,
}

impl AdminGuard {
    /// `None` or a blank token leaves management routes open.
    pub fn new(token: Option<&str>) -> Self {
        let digest = token.map(str::trim).filter(|t| !t.is_empty()).map(token_digest);
        Self { digest }
    }

    pub fn is_enabled(&self) -> bool {
        self.digest.is_some()
    }

    pub fn admits(&self, presented: Option<&str>) -> bool {
        match &self.digest {
            None => true,
            Some(expected) => presented.is_some_and(|p| token_digest(p) == *expected),
        }
    }
}
