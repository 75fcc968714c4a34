//! Exhaust ingest gateway and HTTP API.
//!
//! Uploads arrive on `POST /streams/:id` with the stream's bearer token,
//! are framed and parsed into sequenced records, and fan out to live
//! viewers and the tail analyzer. Management routes create, list,
//! disconnect, reissue, and delete streams.

pub mod auth;
pub mod config;
pub mod http;
pub mod ingest;
pub mod service;

pub use config::ExhaustConfig;
pub use http::{router, serve, ApiError};
pub use service::{ExhaustService, IngestReceipt, StreamListing};
