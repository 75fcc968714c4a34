use crate::types::StreamId;

/// Errors produced anywhere in the pipeline.
///
/// Each variant is scoped to the narrowest entity it concerns: one record,
/// one subscriber, or one stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExhaustError {
    /// Missing, malformed, revoked, or foreign bearer token.
    #[error("unauthorized: invalid or revoked stream token")]
    Unauthorized,

    /// Subscriber dropped because its buffer filled up.
    #[error("subscriber dropped: buffer full (slow consumer)")]
    SlowConsumer,

    /// Stream was disconnected or deleted while subscribed.
    #[error("stream ended")]
    StreamEnded,

    /// A single record could not be analysed.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// A parked partial frame was abandoned.
    #[error("partial upload abandoned after timeout")]
    TokenTimeout,

    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("stream deleted: {0}")]
    StreamGone(StreamId),

    #[error("rate limited: too many uploads for this stream")]
    RateLimited,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal invariant violation; the stream is forcibly disconnected.
    #[error("sequence violation on stream {stream_id}: expected {expected}, got {got}")]
    SequenceViolation {
        stream_id: StreamId,
        expected: u64,
        got: u64,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl ExhaustError {
    /// True for errors caused by the caller rather than by the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized
                | Self::StreamNotFound(_)
                | Self::StreamGone(_)
                | Self::RateLimited
                | Self::InvalidRequest(_)
        )
    }
}
