//! Unified error type for the hybrid authentication public API
//!
//! Internal modules keep their own error types ([`SanitizeError`],
//! [`EngineFailure`], [`ClassicalError`], ...) for precise handling; this type
//! is what callers of the orchestrator see.
//!
//! # Example
//!
//! ```no_run
//! use pqc_hybrid_auth::HybridAuthError;
//!
//! fn report(err: &HybridAuthError) -> String {
//!     // Safe to hand to an end user: no engine diagnostics, no key material
//!     err.client_message().to_string()
//! }
//! ```
//!
//! [`SanitizeError`]: crate::sanitize::SanitizeError
//! [`EngineFailure`]: crate::engine::EngineFailure
//! [`ClassicalError`]: crate::classical::ClassicalError

use crate::classical::ClassicalError;
use crate::config::ConfigError;
use crate::engine::EngineFailure;
use crate::sanitize::SanitizeError;
use crate::types::OperationKind;
use thiserror::Error;

/// Unified error type for all orchestrated operations
///
/// # Error Categories
///
/// - **PolicyRejected**: the requested mode is disallowed by the live config
/// - **EngineUnavailable**: the engine did not answer (timeout, spawn failure, ...)
/// - **EngineComputationFailed**: the engine ran and reported a failure
/// - **SanitizationRejected**: parameters failed the allow-list or content checks
/// - **FallbackExhausted**: PQC and classical both failed; PQC cause is primary
/// - **ClassicalFailed**: the classical-only path failed
#[derive(Debug, Error)]
pub enum HybridAuthError {
    #[error("Policy rejected: {0}")]
    PolicyRejected(String),

    #[error("Cryptographic engine unavailable: {0}")]
    EngineUnavailable(EngineFailure),

    #[error("Cryptographic engine computation failed: {0}")]
    EngineComputationFailed(EngineFailure),

    #[error("Sanitization rejected: {0}")]
    SanitizationRejected(#[from] SanitizeError),

    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    /// PQC skipped because the breaker for this operation kind is open
    #[error("Circuit open for {0}")]
    CircuitOpen(OperationKind),

    #[error("Fallback exhausted: {primary} (classical: {classical})")]
    FallbackExhausted {
        #[source]
        primary: Box<HybridAuthError>,
        classical: ClassicalError,
    },

    #[error("Classical cryptography failed: {0}")]
    ClassicalFailed(ClassicalError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Engine operation name outside the allow-list; a programming error
    #[error("Unknown engine operation: {0}")]
    UnknownOperation(String),
}

impl From<EngineFailure> for HybridAuthError {
    fn from(failure: EngineFailure) -> Self {
        if failure.is_unavailable() {
            HybridAuthError::EngineUnavailable(failure)
        } else {
            HybridAuthError::EngineComputationFailed(failure)
        }
    }
}

impl HybridAuthError {
    /// Returns true if a HYBRID request may recover from this error by
    /// switching to the classical provider
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            Self::EngineUnavailable(_) | Self::EngineComputationFailed(_) | Self::CircuitOpen(_)
        )
    }

    /// Returns true if this is a policy or configuration error
    pub fn is_policy_error(&self) -> bool {
        matches!(
            self,
            Self::PolicyRejected(_) | Self::InvalidConfig(_) | Self::UnknownOperation(_)
        )
    }

    /// Returns true if the caller's input was rejected
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::SanitizationRejected(_) | Self::MissingParameter(_)
        )
    }

    /// The PQC failure behind this error, if any
    pub fn engine_failure(&self) -> Option<&EngineFailure> {
        match self {
            Self::EngineUnavailable(f) | Self::EngineComputationFailed(f) => Some(f),
            Self::FallbackExhausted { primary, .. } => primary.engine_failure(),
            _ => None,
        }
    }

    /// Classified message that is safe to return to end users
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::PolicyRejected(_) => "Requested authentication mode is not permitted",
            Self::EngineUnavailable(_) | Self::CircuitOpen(_) => {
                "Post-quantum authentication is temporarily unavailable"
            }
            Self::EngineComputationFailed(_) => "Post-quantum authentication failed",
            Self::SanitizationRejected(_) | Self::MissingParameter(_) => {
                "Request contains invalid parameters"
            }
            Self::FallbackExhausted { .. } | Self::ClassicalFailed(_) => "Authentication failed",
            Self::InvalidConfig(_) | Self::UnknownOperation(_) => "Internal configuration error",
        }
    }
}
