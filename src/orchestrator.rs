//! Hybrid PQC/classical orchestration
//!
//! [`HybridOrchestrator::execute`] runs one authentication-related operation:
//!
//! 1. sanitize the engine parameters (every mode, before any other gate)
//! 2. resolve the route from the live config, the requested mode and the
//!    feature flags ([`resolve_route`])
//! 3. ask the circuit breaker; an open breaker means classical when a fallback
//!    is permitted and [`HybridAuthError::CircuitOpen`] otherwise
//! 4. call the engine under a hard deadline and [`assess`] the outcome
//! 5. on failure either propagate or fall back ([`decide_fallback`]), emitting
//!    exactly one audit event per fallback
//!
//! Steps 2, 4 and 5 are pure functions of their inputs.

use crate::audit::{AuditCounter, CryptoFallbackEvent, FallbackAuditRecorder, FallbackReason};
use crate::breaker::CircuitBreakerRegistry;
use crate::classical::{self, ClassicalError, ClassicalProvider};
use crate::config::{BreakerSettings, ConfigHandle, HybridAuthConfig, ServiceSettings};
use crate::engine::{CryptoEngine, EngineFailure, EngineOperation, EngineOutcome, EngineRequest};
use crate::error::HybridAuthError;
use crate::flags::FeatureFlags;
use crate::gateway::ProcessEngine;
use crate::sanitize::{SanitizedParams, Sanitizer};
use crate::session::{CacheLimits, SessionCache};
use crate::types::{
    AlgorithmId, AuthenticationMode, OperationKind, PqcAuthResult, SessionData, UserContext,
    UsedMode,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Slack on top of the gateway deadline before the orchestrator gives up itself
const ENGINE_TIMEOUT_GRACE: Duration = Duration::from_secs(1);

const VERIFICATION_FAILED: &str = "Verification failed";

/// One authentication-related cryptographic operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub kind: OperationKind,
    pub user: UserContext,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub requested_mode: Option<AuthenticationMode>,
    #[serde(default)]
    pub payload: Option<Value>,
    /// Token to verify; required for verification
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl AuthRequest {
    pub fn new(kind: OperationKind, user: UserContext) -> Self {
        AuthRequest {
            kind,
            user,
            device_id: None,
            requested_mode: None,
            payload: None,
            token: None,
            session_id: None,
        }
    }

    pub fn with_mode(mut self, mode: AuthenticationMode) -> Self {
        self.requested_mode = Some(mode);
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Execution path chosen by policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Classical,
    /// Attempt PQC; `fallback` says whether classical may take over on failure
    Pqc { fallback: bool },
}

/// Resolve the route for a request from policy alone
pub fn resolve_route(
    config: &HybridAuthConfig,
    requested: Option<AuthenticationMode>,
    pqc_flagged_on: bool,
) -> Result<Route, HybridAuthError> {
    match requested.unwrap_or(config.preferred_mode) {
        AuthenticationMode::Classical if config.enable_classical => Ok(Route::Classical),
        AuthenticationMode::Classical => Err(HybridAuthError::PolicyRejected(
            "classical authentication is disabled".to_string(),
        )),
        AuthenticationMode::Pqc if !config.enable_pqc => Err(HybridAuthError::PolicyRejected(
            "PQC authentication is disabled".to_string(),
        )),
        AuthenticationMode::Pqc if !pqc_flagged_on => Err(HybridAuthError::PolicyRejected(
            "PQC authentication is not enabled for this user or operation".to_string(),
        )),
        AuthenticationMode::Pqc => Ok(Route::Pqc { fallback: false }),
        AuthenticationMode::Hybrid if config.enable_pqc && pqc_flagged_on => Ok(Route::Pqc {
            fallback: config.classical_fallback && config.enable_classical,
        }),
        AuthenticationMode::Hybrid if config.enable_classical => Ok(Route::Classical),
        AuthenticationMode::Hybrid => Err(HybridAuthError::PolicyRejected(
            "no authentication family is permitted for this user or operation".to_string(),
        )),
    }
}

/// Meaning of an engine outcome for the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
    Accepted(PqcAuthResult),
    /// Legitimate negative verification result; not a failure
    Rejected(PqcAuthResult),
    Failed(EngineFailure),
}

pub fn assess(
    operation: EngineOperation,
    kind: OperationKind,
    outcome: EngineOutcome,
    config: &HybridAuthConfig,
) -> Assessment {
    let response = match outcome {
        Ok(response) => response,
        Err(EngineFailure::Reported { .. }) if operation.is_verification() => {
            return Assessment::Rejected(PqcAuthResult::rejected(
                UsedMode::Pqc,
                pqc_algorithm(kind),
                VERIFICATION_FAILED,
            ));
        }
        Err(failure) => return Assessment::Failed(failure),
    };

    let algorithm = match response.algorithm.as_deref().map(AlgorithmId::from) {
        Some(algorithm) if config.supports(&algorithm) => algorithm,
        Some(algorithm) => {
            return Assessment::Failed(EngineFailure::Reported {
                code: Some("unsupported_algorithm".to_string()),
                message: format!("engine answered with unsupported algorithm {}", algorithm),
            })
        }
        None => {
            return Assessment::Failed(EngineFailure::Malformed(
                "response without algorithm".to_string(),
            ))
        }
    };

    if operation.is_verification() && response.valid == Some(false) {
        return Assessment::Rejected(PqcAuthResult::rejected(
            UsedMode::Pqc,
            algorithm,
            VERIFICATION_FAILED,
        ));
    }

    let session = response.session_id.map(|session_id| SessionData {
        session_id,
        public_key_hash: response.public_key_hash.unwrap_or_default(),
    });
    Assessment::Accepted(
        PqcAuthResult::succeeded(UsedMode::Pqc, algorithm)
            .with_session(session)
            .with_token(response.token.or(response.signature)),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackDecision {
    Propagate,
    Fallback(FallbackReason),
}

pub fn decide_fallback(failure: &EngineFailure, fallback_permitted: bool) -> FallbackDecision {
    if fallback_permitted {
        FallbackDecision::Fallback(FallbackReason::classify(failure))
    } else {
        FallbackDecision::Propagate
    }
}

/// Engine operation performing `kind`
pub fn engine_operation(kind: OperationKind) -> EngineOperation {
    match kind {
        OperationKind::KeyGeneration | OperationKind::Handshake => {
            EngineOperation::GenerateSessionKey
        }
        OperationKind::Signing => EngineOperation::SignToken,
        OperationKind::Verification => EngineOperation::VerifyToken,
    }
}

/// PQC algorithm expected for `kind`
pub fn pqc_algorithm(kind: OperationKind) -> AlgorithmId {
    match kind {
        OperationKind::KeyGeneration | OperationKind::Handshake => {
            AlgorithmId::from(AlgorithmId::ML_KEM_768)
        }
        OperationKind::Signing | OperationKind::Verification => {
            AlgorithmId::from(AlgorithmId::ML_DSA_65)
        }
    }
}

/// Classical substitute for `kind`
pub fn classical_algorithm(kind: OperationKind) -> AlgorithmId {
    match kind {
        OperationKind::KeyGeneration | OperationKind::Handshake => {
            AlgorithmId::from(classical::SESSION_ALGORITHM)
        }
        OperationKind::Signing | OperationKind::Verification => {
            AlgorithmId::from(classical::SIGNATURE_ALGORITHM)
        }
    }
}

pub struct HybridOrchestrator {
    config: Arc<ConfigHandle>,
    flags: Arc<FeatureFlags>,
    breakers: Arc<CircuitBreakerRegistry>,
    engine: Arc<dyn CryptoEngine>,
    classical: ClassicalProvider,
    audit: Arc<FallbackAuditRecorder>,
    sessions: SessionCache,
    sanitizer: Sanitizer,
    engine_timeout: Duration,
}

pub struct OrchestratorBuilder {
    engine: Arc<dyn CryptoEngine>,
    audit: Arc<FallbackAuditRecorder>,
    config: HybridAuthConfig,
    breaker: BreakerSettings,
    flags: Option<Arc<FeatureFlags>>,
    engine_timeout: Duration,
    max_value_len: usize,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: HybridAuthConfig) -> Self {
        self.config = config;
        self
    }

    pub fn breaker(mut self, settings: BreakerSettings) -> Self {
        self.breaker = settings;
        self
    }

    pub fn flags(mut self, flags: Arc<FeatureFlags>) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Deadline applied around every engine call
    pub fn engine_timeout(mut self, timeout: Duration) -> Self {
        self.engine_timeout = timeout;
        self
    }

    pub fn max_value_len(mut self, max_value_len: usize) -> Self {
        self.max_value_len = max_value_len;
        self
    }

    pub fn build(self) -> Result<HybridOrchestrator, HybridAuthError> {
        if self.breaker.failure_threshold == 0 {
            return Err(crate::config::ConfigError::Invalid(
                "breaker failure_threshold must be at least 1".to_string(),
            )
            .into());
        }
        Ok(HybridOrchestrator {
            config: Arc::new(ConfigHandle::new(self.config)?),
            flags: self.flags.unwrap_or_default(),
            breakers: Arc::new(CircuitBreakerRegistry::new(self.breaker)),
            engine: self.engine,
            classical: ClassicalProvider::generate(),
            audit: self.audit,
            sessions: SessionCache::new(),
            sanitizer: Sanitizer::new(self.max_value_len),
            engine_timeout: self.engine_timeout,
        })
    }
}

impl HybridOrchestrator {
    pub fn builder(
        engine: Arc<dyn CryptoEngine>,
        audit: Arc<FallbackAuditRecorder>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            engine,
            audit,
            config: HybridAuthConfig::default(),
            breaker: BreakerSettings::default(),
            flags: None,
            engine_timeout: crate::config::GatewaySettings::default().timeout
                + ENGINE_TIMEOUT_GRACE,
            max_value_len: Sanitizer::default().max_value_len(),
        }
    }

    /// Subprocess engine and audit sink wired from `settings`; needs a Tokio runtime
    pub fn from_settings(settings: &ServiceSettings) -> Result<Self, HybridAuthError> {
        let engine = Arc::new(ProcessEngine::new(settings.gateway.clone()));
        let audit = Arc::new(FallbackAuditRecorder::from_settings(&settings.audit));
        Self::builder(engine, audit)
            .config(settings.auth.clone())
            .breaker(settings.breaker.clone())
            .engine_timeout(settings.gateway.timeout + ENGINE_TIMEOUT_GRACE)
            .max_value_len(settings.gateway.max_value_len)
            .build()
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn audit(&self) -> &FallbackAuditRecorder {
        &self.audit
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    /// Upper bound on a single engine call made by [`execute`](Self::execute)
    pub fn engine_deadline(&self) -> Duration {
        self.engine_timeout
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Health check through the engine boundary; does not touch the breakers
    pub async fn engine_status(&self) -> EngineOutcome {
        self.invoke_engine(EngineRequest::new(
            EngineOperation::GetStatus,
            SanitizedParams::default(),
        ))
        .await
    }

    /// Run one operation and report which cryptographic family protected it
    pub async fn execute(&self, request: AuthRequest) -> Result<PqcAuthResult, HybridAuthError> {
        let started = Instant::now();
        let config = self.config.snapshot();
        let kind = request.kind;

        if kind == OperationKind::Verification && request.token.is_none() {
            return Err(HybridAuthError::MissingParameter("token"));
        }
        let params = self.engine_params(&request)?;

        let pqc_flagged_on =
            self.flags
                .pqc_allowed(kind, &request.user.user_id, config.pqc_threshold);
        let route = resolve_route(&config, request.requested_mode, pqc_flagged_on)?;
        debug!(
            user_id = %request.user.user_id,
            operation = %kind,
            ?route,
            "Resolved authentication route"
        );

        let result = match route {
            Route::Classical => self
                .run_classical(&request, &config)
                .map_err(HybridAuthError::ClassicalFailed)?,
            Route::Pqc { fallback } => self.run_pqc(&request, params, &config, fallback).await?,
        };
        let result = result.with_elapsed(started.elapsed());

        info!(
            user_id = %request.user.user_id,
            operation = %kind,
            used_mode = %result.used_mode,
            success = result.success,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "Authentication operation completed"
        );
        Ok(result)
    }

    async fn run_pqc(
        &self,
        request: &AuthRequest,
        params: SanitizedParams,
        config: &HybridAuthConfig,
        fallback: bool,
    ) -> Result<PqcAuthResult, HybridAuthError> {
        let kind = request.kind;

        if !self.breakers.try_acquire(kind) {
            debug!(operation = %kind, fallback, "Circuit open, skipping PQC");
            if !fallback {
                return Err(HybridAuthError::CircuitOpen(kind));
            }
            return self
                .fall_back(
                    request,
                    config,
                    FallbackReason::CircuitOpen,
                    HybridAuthError::CircuitOpen(kind),
                    None,
                )
                .await;
        }

        let operation = engine_operation(kind);
        let attempt_started = Instant::now();
        let outcome = self
            .invoke_engine(EngineRequest::new(operation, params))
            .await;
        let latency = attempt_started.elapsed();

        match assess(operation, kind, outcome, config) {
            Assessment::Accepted(result) => {
                self.breakers.record_success(kind);
                if kind == OperationKind::Verification {
                    self.audit.count(AuditCounter::ValidationSuccess);
                }
                if let Some(session) = &result.session_data {
                    self.sessions.insert(session.clone(), CacheLimits::from(config));
                }
                Ok(result)
            }
            Assessment::Rejected(result) => {
                self.breakers.record_success(kind);
                debug!(
                    user_id = %request.user.user_id,
                    operation = %kind,
                    "PQC verification returned a negative result"
                );
                Ok(result)
            }
            Assessment::Failed(failure) => {
                self.breakers.record_failure(kind);
                match decide_fallback(&failure, fallback) {
                    FallbackDecision::Propagate => {
                        warn!(
                            user_id = %request.user.user_id,
                            operation = %kind,
                            failure = failure.kind(),
                            "PQC operation failed without fallback"
                        );
                        Err(failure.into())
                    }
                    FallbackDecision::Fallback(reason) => {
                        warn!(
                            user_id = %request.user.user_id,
                            operation = %kind,
                            reason = %reason,
                            "PQC operation failed, falling back to classical"
                        );
                        self.fall_back(request, config, reason, failure.into(), Some(latency))
                            .await
                    }
                }
            }
        }
    }

    async fn fall_back(
        &self,
        request: &AuthRequest,
        config: &HybridAuthConfig,
        reason: FallbackReason,
        primary: HybridAuthError,
        latency: Option<Duration>,
    ) -> Result<PqcAuthResult, HybridAuthError> {
        let kind = request.kind;
        let mut event = CryptoFallbackEvent::new(request.user.user_id.clone(), kind, reason)
            .with_device(request.device_id.clone())
            .with_algorithms(Some(pqc_algorithm(kind)), Some(classical_algorithm(kind)));
        if let Some(latency) = latency {
            event = event.with_latency(latency);
        }
        self.audit.emit(event).await;

        self.run_classical(request, config)
            .map_err(|classical| HybridAuthError::FallbackExhausted {
                primary: Box::new(primary),
                classical,
            })
    }

    fn run_classical(
        &self,
        request: &AuthRequest,
        config: &HybridAuthConfig,
    ) -> Result<PqcAuthResult, ClassicalError> {
        let user_id = request.user.user_id.as_str();
        let ttl = config.session_token_ttl;

        match request.kind {
            OperationKind::KeyGeneration | OperationKind::Handshake => {
                let issued = self.classical.generate_tokens(user_id, ttl)?;
                self.sessions
                    .insert(issued.session.clone(), CacheLimits::from(config));
                Ok(PqcAuthResult::succeeded(UsedMode::Classical, issued.algorithm)
                    .with_session(Some(issued.session))
                    .with_token(Some(issued.token)))
            }
            OperationKind::Signing => {
                let token = self.classical.sign(user_id, request.payload.clone(), ttl)?;
                Ok(
                    PqcAuthResult::succeeded(UsedMode::Classical, classical_algorithm(request.kind))
                        .with_token(Some(token)),
                )
            }
            OperationKind::Verification => {
                let token = request.token.as_deref().unwrap_or_default();
                match self.classical.verify(token, user_id) {
                    Ok(claims) => {
                        self.audit.count(AuditCounter::ValidationSuccess);
                        Ok(PqcAuthResult::succeeded(
                            UsedMode::Classical,
                            AlgorithmId::new(claims.algorithm),
                        ))
                    }
                    Err(e) if e.is_rejection() => {
                        debug!(user_id, reason = %e, "Classical verification returned a negative result");
                        Ok(PqcAuthResult::rejected(
                            UsedMode::Classical,
                            classical_algorithm(request.kind),
                            VERIFICATION_FAILED,
                        ))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn invoke_engine(&self, request: EngineRequest) -> EngineOutcome {
        match tokio::time::timeout(self.engine_timeout, self.engine.invoke(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineFailure::Timeout {
                after: self.engine_timeout,
            }),
        }
    }

    /// Wire parameters for the engine; structured values are base64 encoded
    /// so they survive the metacharacter filter intact
    fn engine_params(&self, request: &AuthRequest) -> Result<SanitizedParams, HybridAuthError> {
        let mut raw: Vec<(&str, String)> = vec![
            ("user_id", request.user.user_id.clone()),
            ("operation_id", uuid::Uuid::new_v4().to_string()),
            (
                "metadata",
                B64.encode(json!({ "kind": request.kind, "device_id": request.device_id }).to_string()),
            ),
        ];
        if let Some(email) = &request.user.email {
            raw.push(("email", email.clone()));
        }
        if let Some(session_id) = &request.session_id {
            raw.push(("session_id", session_id.clone()));
        }
        if let Some(payload) = &request.payload {
            raw.push(("payload", B64.encode(payload.to_string())));
        }
        if let Some(token) = &request.token {
            raw.push(("token", B64.encode(token)));
        }
        Ok(self.sanitizer.sanitize(raw)?)
    }
}
