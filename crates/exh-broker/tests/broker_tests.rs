use chrono::Utc;

use exh_broker::{Broker, BrokerConfig, PublishOutcome, SubscriberKind, Subscription};
use exh_protocol::{
    ExhaustError, Finding, FindingCategory, Level, LogRecord, Severity, StreamEvent, StreamId,
};

fn record(stream: &str, sequence: u64) -> LogRecord {
    LogRecord {
        stream_id: StreamId::from(stream),
        sequence,
        timestamp: Utc::now(),
        level: Level::Info,
        source: Some("api".into()),
        message: format!("line {sequence}").into_bytes(),
    }
}

fn drain_sequences(sub: &mut Subscription) -> Vec<u64> {
    let mut out = Vec::new();
    while let Ok(Some(event)) = sub.try_recv() {
        if let StreamEvent::Record(r) = event {
            out.push(r.sequence);
        }
    }
    out
}

#[tokio::test]
async fn test_all_subscribers_see_ordered_gap_free_sequence() {
    let broker = Broker::new(BrokerConfig::default());
    let s = StreamId::from("s1");
    let mut a = broker.subscribe(&s, SubscriberKind::Viewer).await;
    let mut b = broker.subscribe(&s, SubscriberKind::Viewer).await;

    for seq in 1..=50 {
        broker.publish(&s, record("s1", seq)).await.unwrap();
    }

    let expected: Vec<u64> = (1..=50).collect();
    assert_eq!(drain_sequences(&mut a), expected);
    assert_eq!(drain_sequences(&mut b), expected);
}

#[tokio::test]
async fn test_republish_is_deduplicated() {
    let broker = Broker::new(BrokerConfig::default());
    let s = StreamId::from("s1");
    let mut sub = broker.subscribe(&s, SubscriberKind::Viewer).await;

    broker.publish(&s, record("s1", 1)).await.unwrap();
    broker.publish(&s, record("s1", 2)).await.unwrap();
    let again = broker.publish(&s, record("s1", 2)).await.unwrap();

    assert_eq!(again, PublishOutcome::Duplicate);
    assert_eq!(drain_sequences(&mut sub), vec![1, 2]);
}

#[tokio::test]
async fn test_gap_is_rejected_without_delivery() {
    let broker = Broker::new(BrokerConfig::default());
    let s = StreamId::from("s1");
    let mut sub = broker.subscribe(&s, SubscriberKind::Viewer).await;

    broker.publish(&s, record("s1", 1)).await.unwrap();
    let err = broker.publish(&s, record("s1", 3)).await.unwrap_err();

    assert!(matches!(err, ExhaustError::SequenceViolation { expected: 2, got: 3, .. }));
    assert_eq!(drain_sequences(&mut sub), vec![1]);
}

#[tokio::test]
async fn test_slow_consumer_dropped_others_continue() {
    let broker = Broker::new(BrokerConfig { backlog: 0, ..BrokerConfig::default() });
    let s = StreamId::from("s1");
    let mut slow = broker.subscribe(&s, SubscriberKind::Viewer).await;
    let mut fast = broker.subscribe(&s, SubscriberKind::Viewer).await;

    let mut fast_seen = Vec::new();
    let mut dropped_total = 0;
    for seq in 1..=1_001 {
        match broker.publish(&s, record("s1", seq)).await.unwrap() {
            PublishOutcome::Delivered { dropped, .. } => dropped_total += dropped,
            PublishOutcome::Duplicate => panic!("unexpected duplicate"),
        }
        fast_seen.extend(drain_sequences(&mut fast));
    }

    assert_eq!(dropped_total, 1, "only the slow viewer is dropped");
    assert_eq!(fast_seen, (1..=1_001).collect::<Vec<_>>());
    assert_eq!(broker.subscriber_count(&s).await, 1);

    // The slow viewer drains what it buffered, then learns why it was cut off.
    let buffered = drain_sequences(&mut slow);
    assert_eq!(buffered, (1..=1_000).collect::<Vec<_>>());
    assert_eq!(slow.recv().await.unwrap_err(), ExhaustError::SlowConsumer);
}

#[tokio::test]
async fn test_analyzer_never_dropped_and_gets_no_findings() {
    let broker = Broker::new(BrokerConfig { subscriber_buffer: 4, ..BrokerConfig::default() });
    let s = StreamId::from("s1");
    let mut analyzer = broker.subscribe(&s, SubscriberKind::Analyzer).await;
    let mut viewer = broker.subscribe(&s, SubscriberKind::Viewer).await;

    for seq in 1..=100 {
        broker.publish(&s, record("s1", seq)).await.unwrap();
    }
    let finding = Finding::new(
        s.clone(),
        "error-seen",
        FindingCategory::ErrorPattern,
        Severity::Warning,
        "t",
        "b",
    );
    assert_eq!(broker.publish_finding(&s, finding).await, 0, "viewer was already dropped");

    assert_eq!(drain_sequences(&mut analyzer), (1..=100).collect::<Vec<_>>());
    assert_eq!(drain_sequences(&mut viewer), vec![1, 2, 3, 4]);
    assert_eq!(viewer.recv().await.unwrap_err(), ExhaustError::SlowConsumer);
}

#[tokio::test]
async fn test_findings_reach_viewers_only() {
    let broker = Broker::new(BrokerConfig::default());
    let s = StreamId::from("s1");
    let mut analyzer = broker.subscribe(&s, SubscriberKind::Analyzer).await;
    let mut viewer = broker.subscribe(&s, SubscriberKind::Viewer).await;

    let finding = Finding::new(
        s.clone(),
        "error-seen",
        FindingCategory::ErrorPattern,
        Severity::Warning,
        "t",
        "b",
    );
    assert_eq!(broker.publish_finding(&s, finding.clone()).await, 1);

    assert_eq!(viewer.try_recv().unwrap(), Some(StreamEvent::Finding(finding)));
    assert_eq!(analyzer.try_recv().unwrap(), None);
}

#[tokio::test]
async fn test_close_stream_ends_every_subscriber() {
    let broker = Broker::new(BrokerConfig::default());
    let s = StreamId::from("s1");
    let mut a = broker.subscribe(&s, SubscriberKind::Viewer).await;
    let mut b = broker.subscribe(&s, SubscriberKind::Analyzer).await;
    broker.publish(&s, record("s1", 1)).await.unwrap();

    assert_eq!(broker.close_stream(&s).await, 2);

    assert_eq!(drain_sequences(&mut a), vec![1]);
    assert_eq!(a.recv().await.unwrap_err(), ExhaustError::StreamEnded);
    assert_eq!(drain_sequences(&mut b), vec![1]);
    assert_eq!(b.recv().await.unwrap_err(), ExhaustError::StreamEnded);
    assert_eq!(
        broker.publish(&s, record("s1", 2)).await.unwrap_err(),
        ExhaustError::StreamEnded
    );
}

#[tokio::test]
async fn test_reopen_continues_sequence() {
    let broker = Broker::new(BrokerConfig::default());
    let s = StreamId::from("s1");
    broker.publish(&s, record("s1", 1)).await.unwrap();
    broker.close_stream(&s).await;
    broker.reopen(&s).await;

    assert_eq!(broker.last_sequence(&s).await, 1);
    assert_eq!(broker.publish(&s, record("s1", 1)).await.unwrap(), PublishOutcome::Duplicate);
    assert!(matches!(
        broker.publish(&s, record("s1", 2)).await.unwrap(),
        PublishOutcome::Delivered { .. }
    ));
}

#[tokio::test]
async fn test_late_viewer_gets_backlog_then_live() {
    let broker = Broker::new(BrokerConfig { backlog: 3, ..BrokerConfig::default() });
    let s = StreamId::from("s1");
    for seq in 1..=5 {
        broker.publish(&s, record("s1", seq)).await.unwrap();
    }
    let mut late = broker.subscribe(&s, SubscriberKind::Viewer).await;
    broker.publish(&s, record("s1", 6)).await.unwrap();

    assert_eq!(drain_sequences(&mut late), vec![3, 4, 5, 6]);
}

#[tokio::test]
async fn test_subscribe_to_closed_stream_replays_then_ends() {
    let broker = Broker::new(BrokerConfig::default());
    let s = StreamId::from("s1");
    broker.publish(&s, record("s1", 1)).await.unwrap();
    broker.close_stream(&s).await;

    let mut sub = broker.subscribe(&s, SubscriberKind::Viewer).await;
    assert_eq!(drain_sequences(&mut sub), vec![1]);
    assert_eq!(sub.recv().await.unwrap_err(), ExhaustError::StreamEnded);
    assert_eq!(broker.subscriber_count(&s).await, 0);
}

#[tokio::test]
async fn test_unsubscribe_and_dropped_receivers_are_pruned() {
    let broker = Broker::new(BrokerConfig::default());
    let s = StreamId::from("s1");
    let a = broker.subscribe(&s, SubscriberKind::Viewer).await;
    let b = broker.subscribe(&s, SubscriberKind::Viewer).await;
    assert_eq!(broker.subscriber_count(&s).await, 2);

    broker.unsubscribe(a).await;
    assert_eq!(broker.subscriber_count(&s).await, 1);

    drop(b);
    broker.publish(&s, record("s1", 1)).await.unwrap();
    assert_eq!(broker.subscriber_count(&s).await, 0);
}

#[tokio::test]
async fn test_streams_are_independent() {
    let broker = Broker::new(BrokerConfig { subscriber_buffer: 1, backlog: 0, ..BrokerConfig::default() });
    let a = StreamId::from("a");
    let b = StreamId::from("b");
    let _stuck = broker.subscribe(&a, SubscriberKind::Viewer).await;
    let mut live = broker.subscribe(&b, SubscriberKind::Viewer).await;

    for seq in 1..=3 {
        broker.publish(&a, record("a", seq)).await.unwrap();
        broker.publish(&b, record("b", seq)).await.unwrap();
        assert_eq!(drain_sequences(&mut live), vec![seq]);
    }
    assert_eq!(broker.subscriber_count(&a).await, 0);
    assert_eq!(broker.subscriber_count(&b).await, 1);
}
