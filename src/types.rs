//! Core value types shared by the orchestrator, gateway and audit layers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Policy entry point for an authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthenticationMode {
    /// Conventional cryptography only, PQC is never attempted
    Classical,
    /// PQC only, failures are never masked by a classical fallback
    Pqc,
    /// Prefer PQC, fall back to classical when permitted
    Hybrid,
}

impl AuthenticationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthenticationMode::Classical => "CLASSICAL",
            AuthenticationMode::Pqc => "PQC",
            AuthenticationMode::Hybrid => "HYBRID",
        }
    }
}

impl fmt::Display for AuthenticationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthenticationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CLASSICAL" => Ok(AuthenticationMode::Classical),
            "PQC" => Ok(AuthenticationMode::Pqc),
            "HYBRID" => Ok(AuthenticationMode::Hybrid),
            other => Err(format!("unknown authentication mode: {}", other)),
        }
    }
}

/// Cryptographic family that actually protected an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsedMode {
    Classical,
    Pqc,
}

impl fmt::Display for UsedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsedMode::Classical => f.write_str("CLASSICAL"),
            UsedMode::Pqc => f.write_str("PQC"),
        }
    }
}

/// Class of cryptographic operation, tracked independently for circuit breaking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    KeyGeneration,
    Signing,
    Verification,
    Handshake,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::KeyGeneration,
        OperationKind::Signing,
        OperationKind::Verification,
        OperationKind::Handshake,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::KeyGeneration => "key-generation",
            OperationKind::Signing => "signing",
            OperationKind::Verification => "verification",
            OperationKind::Handshake => "handshake",
        }
    }

    /// Audit flow stage this operation belongs to
    pub fn flow_stage(&self) -> FlowStage {
        match self {
            OperationKind::KeyGeneration => FlowStage::Register,
            OperationKind::Verification => FlowStage::Validate,
            OperationKind::Signing | OperationKind::Handshake => FlowStage::Handshake,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown operation kind: {}", s))
    }
}

/// Stage of the authentication flow a fallback happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStage {
    Validate,
    Register,
    Handshake,
}

/// Algorithm identifier, e.g. `ML-KEM-768` or `ES256`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlgorithmId(String);

impl AlgorithmId {
    pub const ML_KEM_768: &'static str = "ML-KEM-768";
    pub const ML_DSA_65: &'static str = "ML-DSA-65";

    pub fn new(name: impl Into<String>) -> Self {
        AlgorithmId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AlgorithmId {
    fn from(s: &str) -> Self {
        AlgorithmId(s.to_string())
    }
}

/// Default PQC algorithm set (NIST FIPS 203 / FIPS 204)
pub fn default_pqc_algorithms() -> BTreeSet<AlgorithmId> {
    [AlgorithmId::ML_KEM_768, AlgorithmId::ML_DSA_65]
        .into_iter()
        .map(AlgorithmId::from)
        .collect()
}

/// Caller identity supplied by the CRUD layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        UserContext {
            user_id: user_id.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Session established by key generation or handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub session_id: String,
    pub public_key_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub elapsed_ms: f64,
}

/// Uniform result envelope returned to callers
///
/// `used_mode` is always set by the orchestrator at the point the path was
/// chosen; it is never reconstructed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PqcAuthResult {
    pub success: bool,
    pub used_mode: UsedMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<AlgorithmId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_data: Option<SessionData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_metrics: Option<PerformanceMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PqcAuthResult {
    pub(crate) fn succeeded(used_mode: UsedMode, algorithm: AlgorithmId) -> Self {
        PqcAuthResult {
            success: true,
            used_mode,
            algorithm: Some(algorithm),
            session_data: None,
            token: None,
            performance_metrics: None,
            error_message: None,
        }
    }

    /// Legitimate negative result (e.g. a signature that does not verify)
    pub(crate) fn rejected(used_mode: UsedMode, algorithm: AlgorithmId, message: &str) -> Self {
        PqcAuthResult {
            success: false,
            error_message: Some(message.to_string()),
            ..PqcAuthResult::succeeded(used_mode, algorithm)
        }
    }

    pub(crate) fn with_session(mut self, session: Option<SessionData>) -> Self {
        self.session_data = session;
        self
    }

    pub(crate) fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub(crate) fn with_elapsed(mut self, elapsed: std::time::Duration) -> Self {
        self.performance_metrics = Some(PerformanceMetrics {
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        });
        self
    }
}
