use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};

use exh_broker::Subscription;
use exh_gateway::{ExhaustConfig, ExhaustService};
use exh_protocol::{
    AnalysisState, ExhaustError, Level, LogRecord, Severity, StreamEvent, StreamId, StreamStatus,
};
use exh_state::{IssuedStream, NewStream};

fn config() -> ExhaustConfig {
    let mut config = ExhaustConfig::default();
    config.server.public_base_url = Some("https://exhaust.test".into());
    config
}

fn service_with(config: ExhaustConfig) -> Arc<ExhaustService> {
    Arc::new(ExhaustService::new(&config).unwrap())
}

fn body(chunks: &[&str]) -> impl Stream<Item = Result<Bytes, io::Error>> {
    let items: Vec<_> = chunks.iter().map(|c| Ok(Bytes::copy_from_slice(c.as_bytes()))).collect();
    stream::iter(items)
}

fn dropped_body(chunk: &str) -> impl Stream<Item = Result<Bytes, io::Error>> {
    stream::iter(vec![
        Ok(Bytes::copy_from_slice(chunk.as_bytes())),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")),
    ])
}

async fn create(svc: &ExhaustService, name: &str) -> IssuedStream {
    svc.create_stream(NewStream { name: name.into(), ticket_ref: Some("ATLAS-1234".into()), created_by: None })
        .await
        .unwrap()
}

async fn wait_for_findings(svc: &ExhaustService, id: &StreamId, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while svc.findings(id, 0).await.unwrap().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("findings did not arrive");
}

fn drain_records(sub: &mut Subscription) -> Vec<LogRecord> {
    let mut out = Vec::new();
    while let Ok(Some(event)) = sub.try_recv() {
        if let StreamEvent::Record(r) = event {
            out.push(r);
        }
    }
    out
}

#[tokio::test]
async fn test_upload_activates_stream_and_emits_one_warning() {
    let svc = service_with(config());
    let issued = create(&svc, "prod-api-logs").await;
    let id = issued.info.stream_id.clone();
    let mut viewer = svc.subscribe(&id).await.unwrap();

    let receipt = svc
        .ingest(&id, Some(issued.token.as_str()), Some("text/plain"), body(&["ERROR auth denied\nWARN rate limit\nINFO health ok\n"]))
        .await
        .unwrap();

    assert_eq!(receipt.accepted, 3);
    assert_eq!((receipt.first_sequence, receipt.last_sequence), (Some(1), Some(3)));
    assert_eq!(svc.get(&id).await.unwrap().status, StreamStatus::Active);

    let records = drain_records(&mut viewer);
    assert_eq!(records.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(records.iter().map(|r| r.level).collect::<Vec<_>>(), vec![Level::Error, Level::Warn, Level::Info]);

    tokio::time::timeout(Duration::from_secs(5), async {
        while svc.findings(&id, 0).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no finding produced");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let findings = svc.findings(&id, 0).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].severity, Severity::Warning);
}

#[tokio::test]
async fn test_wrong_token_rejected_without_side_effects() {
    let svc = service_with(config());
    let issued = create(&svc, "prod-api-logs").await;
    let id = issued.info.stream_id.clone();

    let err = svc.ingest(&id, Some("wrong_token"), None, body(&["ERROR x\n"])).await.unwrap_err();
    assert_eq!(err, ExhaustError::Unauthorized);
    let err = svc.ingest(&id, None, None, body(&["ERROR x\n"])).await.unwrap_err();
    assert_eq!(err, ExhaustError::Unauthorized);

    assert_eq!(svc.get(&id).await.unwrap().status, StreamStatus::Waiting);
    assert_eq!(svc.broker().last_sequence(&id).await, 0);
}

#[tokio::test]
async fn test_token_bound_to_its_own_stream() {
    let svc = service_with(config());
    let a = create(&svc, "a").await;
    let b = create(&svc, "b").await;

    let err = svc
        .ingest(&b.info.stream_id, Some(a.token.as_str()), None, body(&["INFO hi\n"]))
        .await
        .unwrap_err();
    assert_eq!(err, ExhaustError::Unauthorized);
}

#[tokio::test]
async fn test_sequences_continue_across_uploads() {
    let svc = service_with(config());
    let issued = create(&svc, "s").await;
    let id = issued.info.stream_id.clone();
    let token = issued.token.as_str();

    svc.ingest(&id, Some(token), None, body(&["INFO a\nINFO b\n"])).await.unwrap();
    let second = svc.ingest(&id, Some(token), None, body(&["INFO c\n", "INFO d"])).await.unwrap();

    assert_eq!((second.first_sequence, second.last_sequence), (Some(3), Some(4)));
}

#[tokio::test]
async fn test_partial_line_completed_by_next_upload() {
    let svc = service_with(config());
    let issued = create(&svc, "s").await;
    let id = issued.info.stream_id.clone();
    let token = issued.token.as_str();
    let mut viewer = svc.subscribe(&id).await.unwrap();

    let err = svc.ingest(&id, Some(token), None, dropped_body("INFO first\nERROR half")).await.unwrap_err();
    assert!(matches!(err, ExhaustError::InvalidRequest(_)));

    svc.ingest(&id, Some(token), None, body(&["way done\n"])).await.unwrap();

    let records = drain_records(&mut viewer);
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].sequence, 2);
    assert_eq!(records[1].level, Level::Error);
    assert_eq!(records[1].message_text(), "halfway done");
}

#[tokio::test]
async fn test_partial_line_discarded_after_timeout() {
    let mut cfg = config();
    cfg.ingest.partial_line_timeout_secs = 0;
    let svc = service_with(cfg);
    let issued = create(&svc, "s").await;
    let id = issued.info.stream_id.clone();
    let token = issued.token.as_str();
    let mut viewer = svc.subscribe(&id).await.unwrap();

    svc.ingest(&id, Some(token), None, dropped_body("ERROR never fini")).await.unwrap_err();
    assert_eq!(svc.reap_partials().await, 1);
    assert_eq!(svc.reap_partials().await, 0);

    svc.ingest(&id, Some(token), None, body(&["INFO fresh\n"])).await.unwrap();
    let records = drain_records(&mut viewer);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message_text(), "fresh");
}

#[tokio::test]
async fn test_revocation_mid_upload_stops_ingest() {
    let svc = service_with(config());
    let issued = create(&svc, "s").await;
    let id = issued.info.stream_id.clone();
    let token = issued.token.as_str().to_string();

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(4);
    let upload = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    let task = {
        let svc = Arc::clone(&svc);
        let id = id.clone();
        tokio::spawn(async move { svc.ingest(&id, Some(token.as_str()), None, upload).await })
    };

    tx.send(Ok(Bytes::from_static(b"INFO one\n"))).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while svc.broker().last_sequence(&id).await < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first chunk never published");

    svc.disconnect(&id).await.unwrap();
    tx.send(Ok(Bytes::from_static(b"INFO two\n"))).await.unwrap();
    drop(tx);

    assert_eq!(task.await.unwrap().unwrap_err(), ExhaustError::Unauthorized);
    assert_eq!(svc.broker().last_sequence(&id).await, 1);
    assert_eq!(svc.get(&id).await.unwrap().status, StreamStatus::Disconnected);
}

#[tokio::test]
async fn test_disconnected_stream_needs_new_token() {
    let svc = service_with(config());
    let issued = create(&svc, "s").await;
    let id = issued.info.stream_id.clone();
    svc.ingest(&id, Some(issued.token.as_str()), None, body(&["INFO a\n"])).await.unwrap();

    let mut viewer = svc.subscribe(&id).await.unwrap();
    svc.disconnect(&id).await.unwrap();
    drain_records(&mut viewer);
    assert_eq!(viewer.recv().await.unwrap_err(), ExhaustError::StreamEnded);

    let err = svc.ingest(&id, Some(issued.token.as_str()), None, body(&["INFO b\n"])).await.unwrap_err();
    assert_eq!(err, ExhaustError::Unauthorized);
    assert_eq!(svc.get(&id).await.unwrap().status, StreamStatus::Disconnected);

    let reissued = svc.reissue_token(&id).await.unwrap();
    assert_eq!(reissued.info.status, StreamStatus::Waiting);
    let receipt = svc.ingest(&id, Some(reissued.token.as_str()), None, body(&["INFO b\n"])).await.unwrap();
    assert_eq!(receipt.first_sequence, Some(2), "sequence continues after reissue");
    assert_eq!(svc.get(&id).await.unwrap().status, StreamStatus::Active);
}

#[tokio::test]
async fn test_deleted_stream_is_gone_but_findings_remain() {
    let svc = service_with(config());
    let issued = create(&svc, "s").await;
    let id = issued.info.stream_id.clone();
    svc.ingest(&id, Some(issued.token.as_str()), None, body(&["ERROR boom\n"])).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while svc.findings(&id, 0).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no finding produced");

    svc.delete(&id).await.unwrap();

    let err = svc.ingest(&id, Some(issued.token.as_str()), None, body(&["INFO x\n"])).await.unwrap_err();
    assert_eq!(err, ExhaustError::StreamGone(id.clone()));
    assert_eq!(svc.get(&id).await.unwrap_err(), ExhaustError::StreamGone(id.clone()));
    assert_eq!(svc.findings(&id, 0).await.unwrap().len(), 1);
    assert!(svc.list().await.streams.is_empty());
}

#[tokio::test]
async fn test_upload_rate_limit() {
    let mut cfg = config();
    cfg.ingest.rate_limit_burst = 2;
    cfg.ingest.rate_limit_per_sec = 0.0;
    let svc = service_with(cfg);
    let issued = create(&svc, "s").await;
    let id = issued.info.stream_id.clone();
    let token = issued.token.as_str();

    svc.ingest(&id, Some(token), None, body(&["INFO 1\n"])).await.unwrap();
    svc.ingest(&id, Some(token), None, body(&["INFO 2\n"])).await.unwrap();
    let err = svc.ingest(&id, Some(token), None, body(&["INFO 3\n"])).await.unwrap_err();
    assert_eq!(err, ExhaustError::RateLimited);
    assert_eq!(svc.broker().last_sequence(&id).await, 2);
}

#[tokio::test]
async fn test_late_viewer_gets_backlog_without_duplicates() {
    let svc = service_with(config());
    let issued = create(&svc, "s").await;
    let id = issued.info.stream_id.clone();
    let token = issued.token.as_str();

    svc.ingest(&id, Some(token), None, body(&["INFO 1\nINFO 2\nINFO 3\n"])).await.unwrap();
    let mut late = svc.subscribe(&id).await.unwrap();
    svc.ingest(&id, Some(token), None, body(&["INFO 4\n"])).await.unwrap();

    let seqs: Vec<u64> = drain_records(&mut late).iter().map(|r| r.sequence).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_listing_counts_statuses() {
    let svc = service_with(config());
    let a = create(&svc, "a").await;
    let b = create(&svc, "b").await;
    create(&svc, "c").await;
    svc.ingest(&a.info.stream_id, Some(a.token.as_str()), None, body(&["INFO x\n"])).await.unwrap();
    svc.disconnect(&b.info.stream_id).await.unwrap();

    let listing = svc.list().await;
    assert_eq!(listing.streams.len(), 3);
    assert_eq!(
        (listing.summary.total, listing.summary.active, listing.summary.waiting, listing.summary.disconnected),
        (3, 1, 1, 1)
    );
}

#[tokio::test]
async fn test_unknown_stream_not_found() {
    let svc = service_with(config());
    let ghost = StreamId::from("does-not-exist");
    assert_eq!(svc.disconnect(&ghost).await.unwrap_err(), ExhaustError::StreamNotFound(ghost.clone()));
    assert_eq!(svc.findings(&ghost, 0).await.unwrap_err(), ExhaustError::StreamNotFound(ghost.clone()));
}

#[tokio::test]
async fn test_reissued_stream_is_analysed_again() {
    let svc = service_with(config());
    let issued = create(&svc, "s").await;
    let id = issued.info.stream_id.clone();

    svc.disconnect(&id).await.unwrap();
    let reissued = svc.reissue_token(&id).await.unwrap();
    svc.ingest(&id, Some(reissued.token.as_str()), None, body(&["ERROR boom\n"])).await.unwrap();

    wait_for_findings(&svc, &id, 1).await;
    let findings = svc.findings(&id, 0).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].rule, "error-seen");
}

#[tokio::test]
async fn test_sequence_gap_forces_disconnect() {
    let svc = service_with(config());
    let issued = create(&svc, "s").await;
    let id = issued.info.stream_id.clone();
    let token = issued.token.as_str();
    svc.ingest(&id, Some(token), None, body(&["INFO a\nINFO b\n"])).await.unwrap();

    // A fresh broker topic has no record of sequences 1 and 2.
    svc.broker().remove_stream(&id).await;
    let mut viewer = svc.subscribe(&id).await.unwrap();

    let err = svc.ingest(&id, Some(token), None, body(&["INFO c\n"])).await.unwrap_err();
    assert_eq!(err, ExhaustError::SequenceViolation { stream_id: id.clone(), expected: 1, got: 3 });
    assert_eq!(svc.get(&id).await.unwrap().status, StreamStatus::Disconnected);
    assert_eq!(viewer.recv().await.unwrap_err(), ExhaustError::StreamEnded);

    let err = svc.ingest(&id, Some(token), None, body(&["INFO d\n"])).await.unwrap_err();
    assert_eq!(err, ExhaustError::Unauthorized);
}

#[tokio::test]
async fn test_analysis_status_tracks_stream() {
    let svc = service_with(config());
    let issued = create(&svc, "s").await;
    let id = issued.info.stream_id.clone();
    assert_eq!(svc.analysis_status(&id).await.unwrap().state, AnalysisState::Idle);

    svc.ingest(&id, Some(issued.token.as_str()), None, body(&["ERROR boom\nINFO ok\n"])).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while svc.analysis_status(&id).await.unwrap().records_analyzed < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("analysis never caught up");
    let status = svc.analysis_status(&id).await.unwrap();
    assert_eq!(status.state, AnalysisState::Analyzing);
    assert_eq!(status.findings, 1);

    svc.disconnect(&id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while svc.analysis_status(&id).await.unwrap().state != AnalysisState::Complete {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("analysis never completed");

    svc.delete(&id).await.unwrap();
    let status = svc.analysis_status(&id).await.unwrap();
    assert_eq!(status.state, AnalysisState::Complete);
    assert_eq!(status.records_analyzed, 2);
}

#[tokio::test]
async fn test_admin_guard_compares_whole_token() {
    let mut cfg = config();
    cfg.server.admin_token = Some("ops-secret".into());
    let svc = service_with(cfg);
    assert!(svc.admin().admits(Some("ops-secret")));
    assert!(!svc.admin().admits(Some("ops-secret-longer")));
    assert!(!svc.admin().admits(None));
}
