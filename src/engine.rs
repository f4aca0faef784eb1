//! Cryptographic engine boundary
//!
//! The real PQC math lives outside this crate. [`CryptoEngine`] is the seam the
//! orchestrator talks to; [`crate::gateway::ProcessEngine`] realizes it with a
//! subprocess per call, but an FFI or network engine can be dropped in without
//! touching the orchestrator.
//!
//! Operation names are a closed enum ([`EngineOperation`]) everywhere inside the
//! crate and are only turned into strings at the wire boundary.

use crate::sanitize::SanitizedParams;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Allow-listed engine operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineOperation {
    GenerateSessionKey,
    SignToken,
    VerifyToken,
    VerifySignature,
    GetStatus,
}

impl EngineOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineOperation::GenerateSessionKey => "generate_session_key",
            EngineOperation::SignToken => "sign_token",
            EngineOperation::VerifyToken => "verify_token",
            EngineOperation::VerifySignature => "verify_signature",
            EngineOperation::GetStatus => "get_status",
        }
    }

    /// Operations whose negative answer is a legitimate result, not a failure
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            EngineOperation::VerifyToken | EngineOperation::VerifySignature
        )
    }
}

impl fmt::Display for EngineOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineOperation {
    type Err = crate::HybridAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate_session_key" => Ok(EngineOperation::GenerateSessionKey),
            "sign_token" => Ok(EngineOperation::SignToken),
            "verify_token" => Ok(EngineOperation::VerifyToken),
            "verify_signature" => Ok(EngineOperation::VerifySignature),
            "get_status" => Ok(EngineOperation::GetStatus),
            other => Err(crate::HybridAuthError::UnknownOperation(other.to_string())),
        }
    }
}

/// One engine invocation
#[derive(Debug, Clone, Serialize)]
pub struct EngineRequest {
    pub operation: EngineOperation,
    pub request_id: String,
    pub params: SanitizedParams,
}

impl EngineRequest {
    pub fn new(operation: EngineOperation, params: SanitizedParams) -> Self {
        EngineRequest {
            operation,
            request_id: uuid::Uuid::new_v4().to_string(),
            params,
        }
    }
}

/// Structured engine answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Verification verdict for `verify_*` operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Why an engine invocation did not produce a usable answer
///
/// Messages carried here have already been scrubbed by the gateway; raw
/// engine stderr is never stored.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineFailure {
    #[error("engine timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("engine process could not be started: {0}")]
    SpawnFailed(String),

    #[error("engine parameter artifact failed: {0}")]
    Artifact(String),

    #[error("engine exited with status {code:?} without a usable response")]
    Exited { code: Option<i32> },

    #[error("engine response was malformed: {0}")]
    Malformed(String),

    #[error("engine output exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },

    #[error("engine reported failure: {message}")]
    Reported {
        code: Option<String>,
        message: String,
    },
}

impl EngineFailure {
    /// True when the engine never ran to completion
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            EngineFailure::Timeout { .. }
                | EngineFailure::SpawnFailed(_)
                | EngineFailure::Artifact(_)
                | EngineFailure::Exited { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineFailure::Timeout { .. } => "timeout",
            EngineFailure::SpawnFailed(_) => "spawn_failed",
            EngineFailure::Artifact(_) => "artifact",
            EngineFailure::Exited { .. } => "exited",
            EngineFailure::Malformed(_) => "malformed",
            EngineFailure::OutputTooLarge { .. } => "output_too_large",
            EngineFailure::Reported { .. } => "reported",
        }
    }
}

/// Outcome of a single engine call, as a value rather than control flow
pub type EngineOutcome = Result<EngineResponse, EngineFailure>;

#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Execute one request; implementations must enforce their own deadline and
    /// release every transient resource before returning
    async fn invoke(&self, request: EngineRequest) -> EngineOutcome;

    /// Human readable engine name for logs
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_allow_list() {
        for op in [
            EngineOperation::GenerateSessionKey,
            EngineOperation::SignToken,
            EngineOperation::VerifyToken,
            EngineOperation::VerifySignature,
            EngineOperation::GetStatus,
        ] {
            assert_eq!(op.as_str().parse::<EngineOperation>().unwrap(), op);
        }
        let err = "rm_rf".parse::<EngineOperation>().unwrap_err();
        assert!(matches!(err, crate::HybridAuthError::UnknownOperation(_)));
        assert!(err.is_policy_error());
    }

    #[test]
    fn test_response_parsing_is_lenient_on_optional_fields() {
        let response: EngineResponse = serde_json::from_str(
            r#"{"success": true, "algorithm": "ML-KEM-768", "session_id": "s1", "extra": 1}"#,
        )
        .unwrap();
        assert!(response.success);
        assert_eq!(response.algorithm.as_deref(), Some("ML-KEM-768"));
        assert_eq!(response.valid, None);
    }

    #[test]
    fn test_failure_classes() {
        assert!(EngineFailure::Timeout {
            after: Duration::from_secs(1)
        }
        .is_unavailable());
        assert!(!EngineFailure::Malformed("eof".to_string()).is_unavailable());
        assert_eq!(
            EngineFailure::OutputTooLarge { limit: 10 }.kind(),
            "output_too_large"
        );
    }

    #[test]
    fn test_request_wire_shape() {
        let params = crate::sanitize::Sanitizer::default()
            .sanitize([("user_id", "u1")])
            .unwrap();
        let request = EngineRequest::new(EngineOperation::SignToken, params);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["operation"], "sign_token");
        assert_eq!(json["params"]["user_id"], "u1");
        assert!(uuid::Uuid::parse_str(json["request_id"].as_str().unwrap()).is_ok());
    }
}
