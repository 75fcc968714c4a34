//! Fan-out broker for Exhaust streams.
//!
//! Delivers each stream's records to every live subscriber in sequence
//! order. Viewer channels are bounded; a viewer that falls behind is dropped
//! with `SlowConsumer` instead of slowing the publisher. The analyzer
//! subscribes as a privileged consumer with an unbounded (or much larger)
//! buffer and never receives findings.

pub mod broker;
pub mod subscription;

pub use broker::{Broker, BrokerConfig, PublishOutcome};
pub use subscription::{SubscriberKind, Subscription};
