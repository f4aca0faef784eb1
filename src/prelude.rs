//! Hybrid auth prelude
//!
//! The types needed to wire up and call the orchestrator in one import.
//!
//! # Example
//!
//! ```no_run
//! use pqc_hybrid_auth::prelude::*;
//!
//! # async fn example() -> Result<(), HybridAuthError> {
//! let settings = ServiceSettings::from_env()?;
//! let orchestrator = HybridOrchestrator::from_settings(&settings)?;
//!
//! let request = AuthRequest::new(OperationKind::Handshake, UserContext::new("u1"))
//!     .with_mode(AuthenticationMode::Hybrid);
//! let result = orchestrator.execute(request).await?;
//! println!("protected by {}", result.used_mode);
//! # Ok(())
//! # }
//! ```

// Orchestration entry points
pub use crate::orchestrator::{AuthRequest, HybridOrchestrator};
pub use crate::types::{
    AlgorithmId, AuthenticationMode, OperationKind, PqcAuthResult, UserContext, UsedMode,
};

// Configuration
pub use crate::config::{HybridAuthConfig, ServiceSettings};

// Errors
pub use crate::error::HybridAuthError;

// Extension seams
pub use crate::audit::{AuditSink, CryptoFallbackEvent, FallbackReason};
pub use crate::engine::{CryptoEngine, EngineFailure, EngineOutcome, EngineRequest};
