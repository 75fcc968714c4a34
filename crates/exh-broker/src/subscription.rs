use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;

use exh_protocol::{CloseReason, ExhaustError, StreamEvent, StreamId};

/// Who is on the receiving end of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberKind {
    /// UI viewer: bounded buffer, receives records and findings.
    Viewer,
    /// Tail analyzer: privileged buffer, receives records only.
    Analyzer,
}

pub(crate) enum Outbox {
    Bounded(mpsc::Sender<StreamEvent>),
    Unbounded(mpsc::UnboundedSender<StreamEvent>),
}

pub(crate) enum Inbox {
    Bounded(mpsc::Receiver<StreamEvent>),
    Unbounded(mpsc::UnboundedReceiver<StreamEvent>),
}

/// Broker-side half of a subscription.
pub(crate) struct Subscriber {
    pub(crate) id: u64,
    pub(crate) kind: SubscriberKind,
    pub(crate) outbox: Outbox,
    pub(crate) closed: Arc<OnceLock<CloseReason>>,
}

pub(crate) enum Delivery {
    Sent,
    /// Buffer full; subscriber must be dropped.
    Full,
    /// Receiver already gone.
    Gone,
}

impl Subscriber {
    pub(crate) fn deliver(&self, event: StreamEvent) -> Delivery {
        match &self.outbox {
            Outbox::Bounded(tx) => match tx.try_send(event) {
                Ok(()) => Delivery::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
                Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
            },
            Outbox::Unbounded(tx) => match tx.send(event) {
                Ok(()) => Delivery::Sent,
                Err(_) => Delivery::Gone,
            },
        }
    }

    /// Record why the channel is closing. The first reason wins.
    pub(crate) fn close(self, reason: CloseReason) {
        let _ = self.closed.set(reason);
    }
}

/// Receiving half handed to a viewer or the analyzer.
///
/// Dropping it unsubscribes lazily; the broker prunes it on the next publish.
pub struct Subscription {
    pub(crate) id: u64,
    stream_id: StreamId,
    kind: SubscriberKind,
    inbox: Inbox,
    closed: Arc<OnceLock<CloseReason>>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        stream_id: StreamId,
        kind: SubscriberKind,
        inbox: Inbox,
        closed: Arc<OnceLock<CloseReason>>,
    ) -> Self {
        Self { id, stream_id, kind, inbox, closed }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn kind(&self) -> SubscriberKind {
        self.kind
    }

    /// Next event, or the close reason once the buffer is drained.
    pub async fn recv(&mut self) -> Result<StreamEvent, ExhaustError> {
        let next = match &mut self.inbox {
            Inbox::Bounded(rx) => rx.recv().await,
            Inbox::Unbounded(rx) => rx.recv().await,
        };
        next.ok_or_else(|| self.close_reason().into())
    }

    /// Non-blocking variant of [`recv`](Self::recv). `Ok(None)` means no
    /// event is buffered yet.
    pub fn try_recv(&mut self) -> Result<Option<StreamEvent>, ExhaustError> {
        let next = match &mut self.inbox {
            Inbox::Bounded(rx) => rx.try_recv(),
            Inbox::Unbounded(rx) => rx.try_recv(),
        };
        match next {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(self.close_reason().into()),
        }
    }

    /// Reason the broker closed this subscription. Meaningful only after
    /// `recv` has reported the close.
    pub fn close_reason(&self) -> CloseReason {
        self.closed.get().copied().unwrap_or(CloseReason::StreamEnded)
    }
}
