/// Prefix of every issued stream token.
pub const TOKEN_PREFIX: &str = "exh_live_";

/// Random bytes behind each token (hex-encoded after the prefix).
pub const TOKEN_ENTROPY_BYTES: usize = 24;

/// Default bounded buffer per viewer subscription.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1_000;

/// Default number of recent records replayed to a new viewer.
pub const DEFAULT_BACKLOG: usize = 200;

/// Default time a parked partial frame waits for its uploader to reconnect.
pub const DEFAULT_PARTIAL_LINE_TIMEOUT_SECS: u64 = 30;

/// Frames longer than this are truncated.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Tail analyzer window bounds.
pub const DEFAULT_WINDOW_RECORDS: usize = 500;
pub const DEFAULT_WINDOW_SECS: u64 = 300;

/// Longest accepted stream name, in characters.
pub const MAX_STREAM_NAME_CHARS: usize = 128;

/// First sequence number assigned on a stream.
pub const FIRST_SEQUENCE: u64 = 1;

/// Longest time span a rule or the analyzer window may cover.
pub const MAX_ANALYSIS_SPAN_SECS: u64 = 30 * 24 * 60 * 60;
