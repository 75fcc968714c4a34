//! Server-side state owned by the Exhaust pipeline: the stream registry
//! (lifecycle and tokens) and the append-only findings store.

pub mod findings;
pub mod registry;

pub use findings::FindingsStore;
pub use registry::{IssuedStream, NewStream, StatusChange, StreamRegistry};
