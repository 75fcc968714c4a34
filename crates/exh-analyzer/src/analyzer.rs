use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use exh_broker::{Broker, SubscriberKind, Subscription};
use exh_protocol::{AnalysisStatus, ExhaustError, StreamEvent, StreamId};
use exh_state::{FindingsStore, StreamRegistry};

use crate::analysis::{AnalyzerConfig, StreamAnalysis};
use crate::incidents::IncidentMatcher;
use crate::rules::RuleSet;

struct StreamTask {
    /// `None` once stopped or detached.
    handle: Option<JoinHandle<()>>,
    status: Arc<RwLock<AnalysisStatus>>,
}

/// Owns one analysis task per open stream.
pub struct TailAnalyzer {
    config: AnalyzerConfig,
    rules: Arc<RuleSet>,
    registry: Arc<StreamRegistry>,
    broker: Arc<Broker>,
    findings: Arc<FindingsStore>,
    tasks: Mutex<HashMap<StreamId, StreamTask>>,
}

impl TailAnalyzer {
    pub fn new(
        config: AnalyzerConfig,
        rules: RuleSet,
        registry: Arc<StreamRegistry>,
        broker: Arc<Broker>,
        findings: Arc<FindingsStore>,
    ) -> Result<Self, ExhaustError> {
        config.validate()?;
        Ok(Self {
            config,
            rules: Arc::new(rules),
            registry,
            broker,
            findings,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Start analysing a stream. No-op if a task is already running for it.
    ///
    /// The subscription is opened before the task is spawned so that no
    /// record published after this call returns can be missed.
    pub async fn start(&self, stream_id: &StreamId) {
        let mut tasks = self.tasks.lock().await;
        if tasks
            .get(stream_id)
            .and_then(|t| t.handle.as_ref())
            .is_some_and(|h| !h.is_finished())
        {
            return;
        }
        let analysis = match StreamAnalysis::new(stream_id.clone(), self.config.clone(), Arc::clone(&self.rules)) {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::error!(stream = %stream_id, error = %e, "Cannot start tail analysis");
                return;
            }
        };
        let subscription = self.broker.subscribe(stream_id, SubscriberKind::Analyzer).await;
        let status = Arc::new(RwLock::new(AnalysisStatus::idle()));
        let matcher = IncidentMatcher::new(stream_id.clone(), Arc::clone(&self.registry), Arc::clone(&self.findings));
        let handle = tokio::spawn(run_analysis(
            subscription,
            analysis,
            matcher,
            Arc::clone(&status),
            Arc::clone(&self.broker),
            Arc::clone(&self.findings),
        ));
        tasks.insert(stream_id.clone(), StreamTask { handle: Some(handle), status });
        tracing::debug!(stream = %stream_id, "Tail analysis started");
    }

    /// Let a stream's task finish on its own once it drains its closed
    /// subscription, so a later [`start`](Self::start) spawns a fresh one.
    pub async fn detach(&self, stream_id: &StreamId) {
        if let Some(task) = self.tasks.lock().await.get_mut(stream_id) {
            if task.handle.take().is_some() {
                tracing::debug!(stream = %stream_id, "Tail analysis detached");
            }
        }
    }

    /// Abort a stream's analysis task, if any. Its last status is kept.
    pub async fn stop(&self, stream_id: &StreamId) {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(stream_id) else {
            return;
        };
        if let Some(handle) = task.handle.take() {
            handle.abort();
            task.status.write().await.complete("analysis stopped");
            tracing::debug!(stream = %stream_id, "Tail analysis stopped");
        }
    }

    pub async fn is_running(&self, stream_id: &StreamId) -> bool {
        self.tasks
            .lock()
            .await
            .get(stream_id)
            .and_then(|t| t.handle.as_ref())
            .is_some_and(|h| !h.is_finished())
    }

    /// Current analysis status; idle for streams never analysed.
    pub async fn status(&self, stream_id: &StreamId) -> AnalysisStatus {
        let status = self.tasks.lock().await.get(stream_id).map(|t| Arc::clone(&t.status));
        match status {
            Some(status) => status.read().await.clone(),
            None => AnalysisStatus::idle(),
        }
    }

    /// Abort every task. Used on shutdown.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, task) in tasks.drain() {
            if let Some(handle) = task.handle {
                handle.abort();
            }
        }
    }
}

async fn run_analysis(
    mut subscription: Subscription,
    mut analysis: StreamAnalysis,
    mut matcher: IncidentMatcher,
    status: Arc<RwLock<AnalysisStatus>>,
    broker: Arc<Broker>,
    findings: Arc<FindingsStore>,
) {
    let stream_id = subscription.stream_id().clone();
    let why = loop {
        let record = match subscription.recv().await {
            Ok(StreamEvent::Record(record)) => record,
            Ok(StreamEvent::Finding(_)) => continue,
            Err(ExhaustError::StreamEnded) => break "stream ended",
            Err(e) => {
                tracing::warn!(stream = %stream_id, error = %e, "Analyzer subscription closed");
                break "subscription closed";
            }
        };
        let mut produced = analysis.observe(&record);
        let mut matched = Vec::new();
        for finding in &produced {
            if let Some(m) = matcher.related(finding).await {
                matched.push(m);
            }
        }
        produced.extend(matched);

        let mut stored = 0;
        for finding in produced {
            if let Err(e) = findings.append(&stream_id, finding.clone()).await {
                tracing::error!(stream = %stream_id, error = %e, "Failed to store finding");
                continue;
            }
            stored += 1;
            broker.publish_finding(&stream_id, finding).await;
        }
        status.write().await.record_analyzed(stored);
    };
    status.write().await.complete(why);
    tracing::debug!(
        stream = %stream_id,
        malformed = analysis.malformed_total(),
        reason = why,
        "Tail analysis finished"
    );
}
