mod error;

pub mod audit;
pub mod breaker;
pub mod classical;
pub mod config;
pub mod engine;
pub mod flags;
pub mod gateway;
pub mod orchestrator;
pub mod prelude;
pub mod sanitize;
pub mod session;
pub mod types;

pub use audit::{
    AuditCounter, AuditError, AuditSink, AuditStats, CryptoFallbackEvent, FallbackAuditRecorder,
    FallbackReason, JsonLinesSink, MemorySink, TracingSink,
};
pub use breaker::{BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
pub use classical::{ClassicalError, ClassicalProvider};
pub use config::{
    AuditSettings, BreakerSettings, ConfigError, ConfigHandle, GatewaySettings, HybridAuthConfig,
    ServiceSettings,
};
pub use engine::{
    CryptoEngine, EngineFailure, EngineOperation, EngineOutcome, EngineRequest, EngineResponse,
};
pub use error::HybridAuthError;
pub use flags::FeatureFlags;
pub use gateway::ProcessEngine;
pub use orchestrator::{AuthRequest, HybridOrchestrator, OrchestratorBuilder};
pub use sanitize::{ParamKey, SanitizeError, SanitizedParams, Sanitizer};
pub use session::{CacheStats, SessionCache};
pub use types::{
    AlgorithmId, AuthenticationMode, FlowStage, OperationKind, PqcAuthResult, SessionData,
    UserContext, UsedMode,
};
