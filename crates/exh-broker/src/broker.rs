use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, Mutex, RwLock};

use exh_protocol::{
    Admission, CloseReason, ExhaustError, Finding, LogRecord, SequenceGuard, StreamEvent,
    StreamId, DEFAULT_BACKLOG, DEFAULT_SUBSCRIBER_BUFFER,
};

use crate::subscription::{Delivery, Inbox, Outbox, SubscriberKind, Subscriber, Subscription};

/// Broker sizing.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bounded buffer per viewer.
    pub subscriber_buffer: usize,
    /// Analyzer buffer; `None` means unbounded.
    pub analyzer_buffer: Option<usize>,
    /// Recent records replayed to new viewers.
    pub backlog: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            analyzer_buffer: None,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// What happened to a published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered {
        /// Subscribers that received the record.
        receivers: usize,
        /// Subscribers dropped as slow consumers during this publish.
        dropped: usize,
    },
    /// Sequence already delivered; nothing sent.
    Duplicate,
}

struct Topic {
    guard: SequenceGuard,
    backlog: VecDeque<LogRecord>,
    subscribers: Vec<Subscriber>,
    closed: bool,
}

impl Topic {
    fn new(stream_id: StreamId) -> Self {
        Self {
            guard: SequenceGuard::new(stream_id),
            backlog: VecDeque::new(),
            subscribers: Vec::new(),
            closed: false,
        }
    }

    /// Send to every subscriber accepted by `wants`, dropping full ones.
    fn fan_out(
        &mut self,
        stream_id: &StreamId,
        event: &StreamEvent,
        wants: impl Fn(SubscriberKind) -> bool,
    ) -> (usize, usize) {
        let mut receivers = 0;
        let mut dropped = 0;
        let mut kept = Vec::with_capacity(self.subscribers.len());
        for sub in self.subscribers.drain(..) {
            if !wants(sub.kind) {
                kept.push(sub);
                continue;
            }
            match sub.deliver(event.clone()) {
                Delivery::Sent => {
                    receivers += 1;
                    kept.push(sub);
                }
                Delivery::Full => {
                    tracing::warn!(
                        stream = %stream_id,
                        subscriber = sub.id,
                        "Dropping slow consumer"
                    );
                    dropped += 1;
                    sub.close(CloseReason::SlowConsumer);
                }
                Delivery::Gone => {
                    tracing::debug!(stream = %stream_id, subscriber = sub.id, "Subscriber went away");
                }
            }
        }
        self.subscribers = kept;
        (receivers, dropped)
    }

    fn close_all(&mut self) -> usize {
        let n = self.subscribers.len();
        for sub in self.subscribers.drain(..) {
            sub.close(CloseReason::StreamEnded);
        }
        n
    }
}

/// Per-stream fan-out hub.
///
/// Every stream has its own topic lock, so a busy stream never delays
/// another. Publishing never awaits a subscriber.
pub struct Broker {
    config: BrokerConfig,
    topics: RwLock<HashMap<StreamId, Arc<Mutex<Topic>>>>,
    next_id: AtomicU64,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Deliver a record to every subscriber of its stream, in order.
    ///
    /// Re-published sequences are reported as `Duplicate` and not resent.
    /// A sequence gap is an invariant violation and is returned as an error
    /// without delivering anything.
    pub async fn publish(
        &self,
        stream_id: &StreamId,
        record: LogRecord,
    ) -> Result<PublishOutcome, ExhaustError> {
        if record.stream_id != *stream_id {
            return Err(ExhaustError::InvalidRequest(format!(
                "record for stream {} published on {}",
                record.stream_id, stream_id
            )));
        }
        let topic = self.topic(stream_id).await;
        let mut topic = topic.lock().await;
        if topic.closed {
            return Err(ExhaustError::StreamEnded);
        }
        if topic.guard.check_and_advance(record.sequence)? == Admission::Duplicate {
            tracing::debug!(stream = %stream_id, sequence = record.sequence, "Duplicate record ignored");
            return Ok(PublishOutcome::Duplicate);
        }

        if self.config.backlog > 0 {
            if topic.backlog.len() == self.config.backlog {
                topic.backlog.pop_front();
            }
            topic.backlog.push_back(record.clone());
        }

        let event = StreamEvent::Record(record);
        let (receivers, dropped) = topic.fan_out(stream_id, &event, |_| true);
        Ok(PublishOutcome::Delivered { receivers, dropped })
    }

    /// Push a finding to the stream's viewers. Returns how many received it.
    pub async fn publish_finding(&self, stream_id: &StreamId, finding: Finding) -> usize {
        let Some(topic) = self.topics.read().await.get(stream_id).cloned() else {
            return 0;
        };
        let mut topic = topic.lock().await;
        if topic.closed {
            return 0;
        }
        let event = StreamEvent::Finding(finding);
        topic
            .fan_out(stream_id, &event, |kind| kind == SubscriberKind::Viewer)
            .0
    }

    /// Open a subscription.
    ///
    /// Viewers first receive the stream's backlog, then live events, with no
    /// gap or duplicate at the seam. On a closed stream the subscription
    /// yields the backlog and then `StreamEnded`.
    pub async fn subscribe(&self, stream_id: &StreamId, kind: SubscriberKind) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let closed = Arc::new(OnceLock::new());
        let (outbox, inbox, capacity) = match (kind, self.config.analyzer_buffer) {
            (SubscriberKind::Viewer, _) => {
                let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
                (Outbox::Bounded(tx), Inbox::Bounded(rx), self.config.subscriber_buffer)
            }
            (SubscriberKind::Analyzer, Some(cap)) => {
                let (tx, rx) = mpsc::channel(cap.max(1));
                (Outbox::Bounded(tx), Inbox::Bounded(rx), cap)
            }
            (SubscriberKind::Analyzer, None) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Outbox::Unbounded(tx), Inbox::Unbounded(rx), usize::MAX)
            }
        };
        let subscriber = Subscriber { id, kind, outbox, closed: Arc::clone(&closed) };

        let topic = self.topic(stream_id).await;
        let mut topic = topic.lock().await;
        if kind == SubscriberKind::Viewer {
            let skip = topic.backlog.len().saturating_sub(capacity);
            for record in topic.backlog.iter().skip(skip) {
                subscriber.deliver(StreamEvent::Record(record.clone()));
            }
        }
        if topic.closed {
            subscriber.close(CloseReason::StreamEnded);
        } else {
            topic.subscribers.push(subscriber);
            tracing::debug!(stream = %stream_id, subscriber = id, ?kind, "Subscribed");
        }
        drop(topic);

        Subscription::new(id, stream_id.clone(), kind, inbox, closed)
    }

    /// Detach a subscription. Its channel is dropped without a close signal.
    pub async fn unsubscribe(&self, subscription: Subscription) {
        let Some(topic) = self.topics.read().await.get(subscription.stream_id()).cloned() else {
            return;
        };
        topic.lock().await.subscribers.retain(|s| s.id != subscription.id);
        tracing::debug!(stream = %subscription.stream_id(), subscriber = subscription.id, "Unsubscribed");
    }

    /// End every subscription of the stream with `StreamEnded` and refuse
    /// further publishes until [`reopen`](Self::reopen). The sequence
    /// high-water mark and backlog are kept.
    pub async fn close_stream(&self, stream_id: &StreamId) -> usize {
        let topic = self.topic(stream_id).await;
        let mut topic = topic.lock().await;
        topic.closed = true;
        let closed = topic.close_all();
        tracing::info!(stream = %stream_id, subscribers = closed, "Stream closed on broker");
        closed
    }

    /// Accept publishes again after a token reissue.
    pub async fn reopen(&self, stream_id: &StreamId) {
        let topic = self.topic(stream_id).await;
        topic.lock().await.closed = false;
    }

    /// Close and forget a stream entirely.
    pub async fn remove_stream(&self, stream_id: &StreamId) -> usize {
        let Some(topic) = self.topics.write().await.remove(stream_id) else {
            return 0;
        };
        let mut topic = topic.lock().await;
        topic.closed = true;
        topic.close_all()
    }

    pub async fn subscriber_count(&self, stream_id: &StreamId) -> usize {
        match self.topics.read().await.get(stream_id).cloned() {
            Some(topic) => topic.lock().await.subscribers.len(),
            None => 0,
        }
    }

    /// Highest sequence delivered on the stream (0 if none).
    pub async fn last_sequence(&self, stream_id: &StreamId) -> u64 {
        match self.topics.read().await.get(stream_id).cloned() {
            Some(topic) => topic.lock().await.guard.last(),
            None => 0,
        }
    }

    async fn topic(&self, stream_id: &StreamId) -> Arc<Mutex<Topic>> {
        if let Some(topic) = self.topics.read().await.get(stream_id) {
            return Arc::clone(topic);
        }
        let mut topics = self.topics.write().await;
        Arc::clone(
            topics
                .entry(stream_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Topic::new(stream_id.clone())))),
        )
    }
}
