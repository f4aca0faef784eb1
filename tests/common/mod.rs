//! Common test utilities for hybrid auth integration tests
//!
//! [`ScriptedEngine`] stands in for the external cryptographic engine so
//! orchestrator scenarios can be driven without a subprocess.

#![allow(dead_code)]

use async_trait::async_trait;
use pqc_hybrid_auth::orchestrator::OrchestratorBuilder;
use pqc_hybrid_auth::{
    AuditSettings, CryptoEngine, EngineFailure, EngineOutcome, EngineRequest, EngineResponse,
    FallbackAuditRecorder, HybridOrchestrator, MemorySink,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_USER: &str = "u1";

#[derive(Debug, Clone)]
pub enum Behavior {
    Respond(EngineResponse),
    Fail(EngineFailure),
    /// Never answer; only the orchestrator deadline ends the call
    Hang,
}

pub struct ScriptedEngine {
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
    requests: Mutex<Vec<EngineRequest>>,
}

impl ScriptedEngine {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(ScriptedEngine {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding(algorithm: &str) -> Arc<Self> {
        Self::new(Behavior::Respond(success(algorithm)))
    }

    pub fn failing(failure: EngineFailure) -> Arc<Self> {
        Self::new(Behavior::Fail(failure))
    }

    pub fn timing_out() -> Arc<Self> {
        Self::failing(EngineFailure::Timeout {
            after: Duration::from_secs(30),
        })
    }

    pub fn set(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CryptoEngine for ScriptedEngine {
    async fn invoke(&self, request: EngineRequest) -> EngineOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            Behavior::Respond(response) => Ok(response),
            Behavior::Fail(failure) => Err(failure),
            Behavior::Hang => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Engine response for a successful PQC operation
pub fn success(algorithm: &str) -> EngineResponse {
    EngineResponse {
        success: true,
        algorithm: Some(algorithm.to_string()),
        session_id: Some("pqc-session-1".to_string()),
        public_key_hash: Some("0123456789abcdef".to_string()),
        token: Some("pqc-token".to_string()),
        ..EngineResponse::default()
    }
}

pub struct Harness {
    pub orchestrator: HybridOrchestrator,
    pub engine: Arc<ScriptedEngine>,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    /// Flush the recorder and return the delivered fallback events
    pub async fn events(&self) -> Vec<pqc_hybrid_auth::CryptoFallbackEvent> {
        self.orchestrator.audit().flush().await.unwrap();
        self.sink.events()
    }
}

pub fn harness(engine: Arc<ScriptedEngine>) -> Harness {
    harness_with(engine, |builder| builder)
}

/// Build an orchestrator around `engine` with an in-memory audit sink; must run
/// inside a Tokio runtime
pub fn harness_with<F>(engine: Arc<ScriptedEngine>, configure: F) -> Harness
where
    F: FnOnce(OrchestratorBuilder) -> OrchestratorBuilder,
{
    let sink = Arc::new(MemorySink::new());
    let audit = Arc::new(FallbackAuditRecorder::new(
        sink.clone(),
        &AuditSettings {
            retry_interval: Duration::from_millis(20),
            ..AuditSettings::default()
        },
    ));
    let builder = HybridOrchestrator::builder(engine.clone(), audit);
    let orchestrator = configure(builder).build().unwrap();
    Harness {
        orchestrator,
        engine,
        sink,
    }
}
