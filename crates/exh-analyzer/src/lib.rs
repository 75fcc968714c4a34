//! Tail analyzer for Exhaust streams.
//!
//! Each open stream gets one analysis task fed by a privileged broker
//! subscription. The task keeps a bounded sliding window of recent records,
//! runs the rule table on every new record, relates what fires to past
//! incidents on other streams, and appends findings to the findings store
//! while pushing them to live viewers.

pub mod analysis;
pub mod analyzer;
pub mod incidents;
pub mod rules;
pub mod window;

pub use analysis::{AnalyzerConfig, StreamAnalysis};
pub use analyzer::TailAnalyzer;
pub use incidents::IncidentMatcher;
pub use rules::{Rule, RuleSet, RuleSpec};
pub use window::{TailWindow, WindowEntry};
