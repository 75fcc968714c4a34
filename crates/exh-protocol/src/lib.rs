//! Exhaust Protocol - Core types shared by every pipeline stage
//!
//! Defines streams, log records, findings, the push-channel event envelope,
//! the error taxonomy, and the bearer-token primitives used by the ingest
//! gateway and stream registry.

pub mod constants;
pub mod error;
pub mod sequence;
pub mod token;
pub mod types;

pub use constants::*;
pub use error::*;
pub use sequence::{Admission, SequenceGuard};
pub use token::{generate_token, token_digest, StreamToken};
pub use types::*;
