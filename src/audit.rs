//! Fallback audit trail
//!
//! Every PQC→classical substitution produces one [`CryptoFallbackEvent`].
//! Events are handed to [`FallbackAuditRecorder::emit`], which never waits
//! more than `max_emit_wait` for queue capacity. A background task delivers
//! queued events to an append-only [`AuditSink`]; batches the sink refuses
//! stay buffered in-process and are retried every `retry_interval`.
//!
//! Alongside events the recorder keeps the compliance counters
//! ([`AuditCounter`]) and mirrors them into `metrics`.

use crate::config::AuditSettings;
use crate::engine::EngineFailure;
use crate::types::{AlgorithmId, FlowStage, OperationKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Buffered events beyond this are dropped oldest-first while the sink is down
const MAX_BUFFERED_EVENTS: usize = 65_536;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("audit recorder is shut down")]
    Closed,
}

/// Why a PQC operation was substituted with classical cryptography
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackReason {
    ExpiredCert,
    InvalidSignature,
    AlgoMismatch,
    CertNotFound,
    MalformedCert,
    UnsupportedPqcAlg,
    EngineTimeout,
    EngineUnavailable,
    CircuitOpen,
    Unknown,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::ExpiredCert => "EXPIRED_CERT",
            FallbackReason::InvalidSignature => "INVALID_SIGNATURE",
            FallbackReason::AlgoMismatch => "ALGO_MISMATCH",
            FallbackReason::CertNotFound => "CERT_NOT_FOUND",
            FallbackReason::MalformedCert => "MALFORMED_CERT",
            FallbackReason::UnsupportedPqcAlg => "UNSUPPORTED_PQC_ALG",
            FallbackReason::EngineTimeout => "ENGINE_TIMEOUT",
            FallbackReason::EngineUnavailable => "ENGINE_UNAVAILABLE",
            FallbackReason::CircuitOpen => "CIRCUIT_OPEN",
            FallbackReason::Unknown => "UNKNOWN",
        }
    }

    /// Classify an engine failure into an audit reason
    pub fn classify(failure: &EngineFailure) -> Self {
        match failure {
            EngineFailure::Timeout { .. } => FallbackReason::EngineTimeout,
            EngineFailure::SpawnFailed(_)
            | EngineFailure::Artifact(_)
            | EngineFailure::Exited { .. } => FallbackReason::EngineUnavailable,
            EngineFailure::Malformed(_) | EngineFailure::OutputTooLarge { .. } => {
                FallbackReason::Unknown
            }
            EngineFailure::Reported { code, message } => {
                if let Some(reason) = code.as_deref().and_then(Self::from_code) {
                    return reason;
                }
                let text = format!("{} {}", code.as_deref().unwrap_or(""), message)
                    .to_ascii_lowercase()
                    .replace('_', " ");
                Self::from_report(&text)
            }
        }
    }

    /// Exact mapping of well-known engine error codes
    fn from_code(code: &str) -> Option<Self> {
        let code = code.trim().to_ascii_lowercase().replace(&['-', ' '][..], "_");
        let reason = match code.as_str() {
            "invalid_signature" | "signature_invalid" | "bad_signature"
            | "signature_verification_failed" => FallbackReason::InvalidSignature,
            "algorithm_mismatch" | "algo_mismatch" | "alg_mismatch" => FallbackReason::AlgoMismatch,
            "cert_expired" | "certificate_expired" | "expired_cert" | "key_expired" => {
                FallbackReason::ExpiredCert
            }
            "cert_not_found" | "certificate_not_found" | "key_not_found" | "not_found" => {
                FallbackReason::CertNotFound
            }
            "malformed_cert" | "malformed_certificate" | "malformed_key" | "invalid_format" => {
                FallbackReason::MalformedCert
            }
            "unsupported_algorithm" | "unsupported_pqc_alg" | "unsupported_alg" => {
                FallbackReason::UnsupportedPqcAlg
            }
            _ => return None,
        };
        Some(reason)
    }

    /// Keyword fallback for unknown or missing codes
    fn from_report(text: &str) -> Self {
        if text.contains("unsupported") {
            FallbackReason::UnsupportedPqcAlg
        } else if text.contains("expired") {
            FallbackReason::ExpiredCert
        } else if text.contains("not found") || text.contains("missing") {
            FallbackReason::CertNotFound
        } else if text.contains("malformed") || text.contains("invalid format") {
            FallbackReason::MalformedCert
        } else if text.contains("algo") && text.contains("mismatch") {
            FallbackReason::AlgoMismatch
        } else if text.contains("signature") {
            FallbackReason::InvalidSignature
        } else {
            FallbackReason::Unknown
        }
    }
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of one fallback occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoFallbackEvent {
    pub event_id: Uuid,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub flow_stage: FlowStage,
    pub operation: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pqc_algorithm: Option<AlgorithmId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classical_algorithm: Option<AlgorithmId>,
    pub fallback_reason: FallbackReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl CryptoFallbackEvent {
    pub fn new(user_id: impl Into<String>, operation: OperationKind, reason: FallbackReason) -> Self {
        CryptoFallbackEvent {
            event_id: Uuid::new_v4(),
            user_id: user_id.into(),
            device_id: None,
            flow_stage: operation.flow_stage(),
            operation,
            pqc_algorithm: None,
            classical_algorithm: None,
            fallback_reason: reason,
            latency_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_device(mut self, device_id: Option<String>) -> Self {
        self.device_id = device_id;
        self
    }

    /// Record the algorithm pair: the PQC algorithm attempted and its classical substitute
    pub fn with_algorithms(
        mut self,
        pqc: Option<AlgorithmId>,
        classical: Option<AlgorithmId>,
    ) -> Self {
        self.pqc_algorithm = pqc;
        self.classical_algorithm = classical;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_secs_f64() * 1000.0);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Append-only destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Durably append `events`; on error nothing may be assumed delivered
    async fn append(&self, events: &[CryptoFallbackEvent]) -> Result<(), AuditError>;

    fn name(&self) -> &str;
}

/// One JSON document per line, opened in append mode and synced per batch
pub struct JsonLinesSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonLinesSink {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn write_lines(file: &mut tokio::fs::File, buf: &[u8]) -> std::io::Result<()> {
    file.write_all(buf).await?;
    file.flush().await?;
    file.sync_data().await
}

#[async_trait]
impl AuditSink for JsonLinesSink {
    async fn append(&self, events: &[CryptoFallbackEvent]) -> Result<(), AuditError> {
        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        let result = match guard.as_mut() {
            Some(file) => write_lines(file, &buf).await,
            None => return Err(AuditError::Closed),
        };
        if result.is_err() {
            // Reopen on the next batch
            *guard = None;
        }
        result.map_err(AuditError::from)
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

/// In-process sink, for embedding and tests
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<CryptoFallbackEvent>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CryptoFallbackEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate an unreachable sink
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn append(&self, events: &[CryptoFallbackEvent]) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("memory sink failing".to_string()));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(events);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Emits each event on the `pqc_audit` tracing target
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn append(&self, events: &[CryptoFallbackEvent]) -> Result<(), AuditError> {
        for event in events {
            info!(
                target: "pqc_audit",
                event_id = %event.event_id,
                user_id = %event.user_id,
                operation = %event.operation,
                reason = %event.fallback_reason,
                latency_ms = event.latency_ms,
                record = %event.to_json(),
                "Crypto fallback"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Compliance counters exposed next to fallback events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCounter {
    FallbackTriggered,
    ValidationSuccess,
    ReplayDetected,
    TrustDriftFlagged,
}

impl AuditCounter {
    pub fn metric_name(&self) -> &'static str {
        match self {
            AuditCounter::FallbackTriggered => "pqc_fallback_triggered_total",
            AuditCounter::ValidationSuccess => "pqc_validation_success_total",
            AuditCounter::ReplayDetected => "pqc_replay_detected_total",
            AuditCounter::TrustDriftFlagged => "pqc_trust_drift_flagged_total",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    fallback_triggered: AtomicU64,
    validation_success: AtomicU64,
    replay_detected: AtomicU64,
    trust_drift_flagged: AtomicU64,
    accepted: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    buffered: AtomicU64,
}

impl Counters {
    fn slot(&self, counter: AuditCounter) -> &AtomicU64 {
        match counter {
            AuditCounter::FallbackTriggered => &self.fallback_triggered,
            AuditCounter::ValidationSuccess => &self.validation_success,
            AuditCounter::ReplayDetected => &self.replay_detected,
            AuditCounter::TrustDriftFlagged => &self.trust_drift_flagged,
        }
    }

    fn drop_events(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("pqc_audit_dropped_total", n);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub fallback_triggered: u64,
    pub validation_success: u64,
    pub replay_detected: u64,
    pub trust_drift_flagged: u64,
    /// Events accepted into the delivery queue
    pub accepted: u64,
    /// Events acknowledged by the sink
    pub delivered: u64,
    /// Events lost to a full queue or an overflowing buffer
    pub dropped: u64,
    /// Events waiting for the sink to recover
    pub buffered: u64,
}

enum Command {
    Event(Box<CryptoFallbackEvent>),
    Flush(oneshot::Sender<()>),
}

pub struct FallbackAuditRecorder {
    tx: mpsc::Sender<Command>,
    max_emit_wait: Duration,
    counters: Arc<Counters>,
    sink_name: String,
    worker: JoinHandle<()>,
}

impl FallbackAuditRecorder {
    /// Start a recorder delivering to `sink`; must be called inside a Tokio runtime
    pub fn new(sink: Arc<dyn AuditSink>, settings: &AuditSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let sink_name = sink.name().to_string();
        let worker = tokio::spawn(deliver(
            rx,
            sink,
            settings.retry_interval,
            counters.clone(),
        ));
        FallbackAuditRecorder {
            tx,
            max_emit_wait: settings.max_emit_wait,
            counters,
            sink_name,
            worker,
        }
    }

    /// Recorder with the sink selected by `settings`: JSON lines when a log
    /// path is configured, the tracing target otherwise
    pub fn from_settings(settings: &AuditSettings) -> Self {
        let sink: Arc<dyn AuditSink> = match &settings.log_path {
            Some(path) => Arc::new(JsonLinesSink::new(path.clone())),
            None => Arc::new(TracingSink),
        };
        Self::new(sink, settings)
    }

    pub fn sink_name(&self) -> &str {
        &self.sink_name
    }

    /// Queue a fallback event; returns false if it had to be dropped
    pub async fn emit(&self, event: CryptoFallbackEvent) -> bool {
        metrics::increment_counter!(
            AuditCounter::FallbackTriggered.metric_name(),
            "reason" => event.fallback_reason.as_str(),
            "operation" => event.operation.as_str()
        );
        self.counters
            .slot(AuditCounter::FallbackTriggered)
            .fetch_add(1, Ordering::Relaxed);

        let event_id = event.event_id;
        match self
            .tx
            .send_timeout(Command::Event(Box::new(event)), self.max_emit_wait)
            .await
        {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(%event_id, "Audit event queued");
                true
            }
            Err(_) => {
                self.counters.drop_events(1);
                error!(%event_id, "Audit queue saturated, fallback event dropped");
                false
            }
        }
    }

    pub fn count(&self, counter: AuditCounter) {
        self.counters.slot(counter).fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!(counter.metric_name());
    }

    /// Wait until every event accepted so far has reached the sink
    pub async fn flush(&self) -> Result<(), AuditError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Flush(done))
            .await
            .map_err(|_| AuditError::Closed)?;
        wait.await.map_err(|_| AuditError::Closed)
    }

    pub fn stats(&self) -> AuditStats {
        let c = &self.counters;
        AuditStats {
            fallback_triggered: c.fallback_triggered.load(Ordering::Relaxed),
            validation_success: c.validation_success.load(Ordering::Relaxed),
            replay_detected: c.replay_detected.load(Ordering::Relaxed),
            trust_drift_flagged: c.trust_drift_flagged.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            buffered: c.buffered.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting events and wait for the final delivery attempt
    pub async fn shutdown(self) {
        let FallbackAuditRecorder { tx, worker, .. } = self;
        drop(tx);
        if let Err(e) = worker.await {
            error!(error = %e, "Audit delivery task failed");
        }
    }
}

async fn deliver(
    mut rx: mpsc::Receiver<Command>,
    sink: Arc<dyn AuditSink>,
    retry_interval: Duration,
    counters: Arc<Counters>,
) {
    let mut pending: VecDeque<CryptoFallbackEvent> = VecDeque::new();
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();
    let mut retry_at: Option<Instant> = None;

    let absorb = |command: Command,
                  pending: &mut VecDeque<CryptoFallbackEvent>,
                  waiters: &mut Vec<oneshot::Sender<()>>| match command {
        Command::Event(event) => {
            if pending.len() >= MAX_BUFFERED_EVENTS {
                pending.pop_front();
                counters.drop_events(1);
            }
            pending.push_back(*event);
        }
        Command::Flush(done) => waiters.push(done),
    };

    loop {
        let received = match retry_at {
            None => match rx.recv().await {
                Some(command) => Some(command),
                None => break,
            },
            Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                Ok(Some(command)) => Some(command),
                Ok(None) => break,
                Err(_) => None,
            },
        };
        if let Some(command) = received {
            absorb(command, &mut pending, &mut waiters);
            while let Ok(command) = rx.try_recv() {
                absorb(command, &mut pending, &mut waiters);
            }
        }

        let due = retry_at.map_or(true, |at| Instant::now() >= at);
        if !pending.is_empty() && due {
            match sink.append(pending.make_contiguous()).await {
                Ok(()) => {
                    counters
                        .delivered
                        .fetch_add(pending.len() as u64, Ordering::Relaxed);
                    pending.clear();
                    retry_at = None;
                }
                Err(e) => {
                    warn!(
                        sink = sink.name(),
                        buffered = pending.len(),
                        error = %e,
                        "Audit sink unavailable, keeping events buffered"
                    );
                    retry_at = Some(Instant::now() + retry_interval);
                }
            }
        }
        counters
            .buffered
            .store(pending.len() as u64, Ordering::Relaxed);

        if pending.is_empty() {
            for done in waiters.drain(..) {
                let _ = done.send(());
            }
        }
    }

    if !pending.is_empty() {
        match sink.append(pending.make_contiguous()).await {
            Ok(()) => {
                counters
                    .delivered
                    .fetch_add(pending.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                error!(
                    lost = pending.len(),
                    error = %e,
                    "Audit recorder shut down with undelivered events"
                );
                counters.drop_events(pending.len() as u64);
            }
        }
        counters.buffered.store(0, Ordering::Relaxed);
    }
    for done in waiters.drain(..) {
        let _ = done.send(());
    }
}
