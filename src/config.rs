//! Runtime configuration
//!
//! [`HybridAuthConfig`] is the process-wide policy read on every authentication
//! attempt. It lives behind a [`ConfigHandle`]: readers take a cheap snapshot,
//! administrative writers go through a validated, locked update so the policy
//! invariants hold for every snapshot ever handed out.
//!
//! Static service wiring (engine program, breaker thresholds, audit sink) is
//! collected in [`ServiceSettings`], usually built with
//! [`ServiceSettings::from_env`].

use crate::types::{default_pqc_algorithms, AlgorithmId, AuthenticationMode};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid value for {var}: {reason}")]
    Env { var: &'static str, reason: String },
}

/// Hybrid authentication policy
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridAuthConfig {
    pub enable_classical: bool,
    pub enable_pqc: bool,
    /// Permit HYBRID requests to fall back to classical after a PQC failure
    pub classical_fallback: bool,
    pub preferred_mode: AuthenticationMode,
    /// Fraction of users inside the staged PQC rollout, in `[0, 1]`
    pub pqc_threshold: f64,
    pub supported_algorithms: BTreeSet<AlgorithmId>,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_session_ttl")]
    pub session_token_ttl: Duration,
    #[serde(default = "default_max_cached_sessions")]
    pub max_cached_sessions: usize,
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_cached_sessions() -> usize {
    1000
}

impl Default for HybridAuthConfig {
    fn default() -> Self {
        HybridAuthConfig {
            enable_classical: true,
            enable_pqc: true,
            classical_fallback: true,
            preferred_mode: AuthenticationMode::Hybrid,
            pqc_threshold: 1.0,
            supported_algorithms: default_pqc_algorithms(),
            session_token_ttl: default_session_ttl(),
            max_cached_sessions: default_max_cached_sessions(),
        }
    }
}

impl HybridAuthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enable_pqc && !self.enable_classical {
            return Err(ConfigError::Invalid(
                "at least one of PQC or classical must be enabled".to_string(),
            ));
        }
        if !self.enable_pqc && self.preferred_mode == AuthenticationMode::Pqc {
            return Err(ConfigError::Invalid(
                "preferred mode PQC requires PQC to be enabled".to_string(),
            ));
        }
        if !self.enable_classical && self.preferred_mode == AuthenticationMode::Classical {
            return Err(ConfigError::Invalid(
                "preferred mode CLASSICAL requires classical to be enabled".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pqc_threshold) {
            return Err(ConfigError::Invalid(format!(
                "pqc_threshold must be within [0, 1], got {}",
                self.pqc_threshold
            )));
        }
        if self.enable_pqc && self.supported_algorithms.is_empty() {
            return Err(ConfigError::Invalid(
                "PQC enabled with an empty algorithm set".to_string(),
            ));
        }
        if self.session_token_ttl.is_zero() {
            return Err(ConfigError::Invalid(
                "session_token_ttl must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn supports(&self, algorithm: &AlgorithmId) -> bool {
        self.supported_algorithms.contains(algorithm)
    }
}

/// Shared handle to the live [`HybridAuthConfig`]
#[derive(Debug)]
pub struct ConfigHandle {
    current: RwLock<Arc<HybridAuthConfig>>,
}

impl ConfigHandle {
    pub fn new(config: HybridAuthConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(ConfigHandle {
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Copy-on-read view; later updates do not affect the returned snapshot
    pub fn snapshot(&self) -> Arc<HybridAuthConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `change` to a copy of the current config and install it if valid
    pub fn update<F>(&self, change: F) -> Result<Arc<HybridAuthConfig>, ConfigError>
    where
        F: FnOnce(&mut HybridAuthConfig),
    {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = HybridAuthConfig::clone(&guard);
        change(&mut next);
        next.validate()?;
        let next = Arc::new(next);
        *guard = next.clone();
        tracing::info!(
            enable_pqc = next.enable_pqc,
            enable_classical = next.enable_classical,
            classical_fallback = next.classical_fallback,
            preferred_mode = %next.preferred_mode,
            pqc_threshold = next.pqc_threshold,
            "Hybrid auth config updated"
        );
        Ok(next)
    }

    pub fn replace(&self, config: HybridAuthConfig) -> Result<Arc<HybridAuthConfig>, ConfigError> {
        self.update(|current| *current = config)
    }
}

/// Circuit breaker thresholds
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cool_down: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        BreakerSettings {
            failure_threshold: 5,
            cool_down: Duration::from_secs(60),
        }
    }
}

/// External engine process settings
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    /// Per-value length cap applied after sanitization
    pub max_value_len: usize,
    pub max_output_bytes: usize,
    /// Directory for parameter artifacts; system temp dir when unset
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            program: PathBuf::from("pqc-engine"),
            args: Vec::new(),
            timeout: Duration::from_secs(30),
            max_value_len: 4096,
            max_output_bytes: 1024 * 1024,
            work_dir: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Append-only JSON lines file; events go to the tracing sink when unset
    pub log_path: Option<PathBuf>,
    pub channel_capacity: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_emit_wait: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_interval: Duration,
}

impl Default for AuditSettings {
    fn default() -> Self {
        AuditSettings {
            log_path: None,
            channel_capacity: 1024,
            max_emit_wait: Duration::from_millis(50),
            retry_interval: Duration::from_millis(500),
        }
    }
}

/// Everything needed to assemble a running service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub auth: HybridAuthConfig,
    pub breaker: BreakerSettings,
    pub gateway: GatewaySettings,
    pub audit: AuditSettings,
}

impl ServiceSettings {
    /// Defaults overlaid with `PQC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut settings = ServiceSettings::default();

        if let Some(program) = lookup("PQC_ENGINE_PROGRAM") {
            settings.gateway.program = PathBuf::from(program);
        }
        if let Some(ms) = lookup("PQC_ENGINE_TIMEOUT_MS") {
            settings.gateway.timeout = Duration::from_millis(parse_var("PQC_ENGINE_TIMEOUT_MS", &ms)?);
        }
        if let Some(n) = lookup("PQC_BREAKER_THRESHOLD") {
            settings.breaker.failure_threshold = parse_var("PQC_BREAKER_THRESHOLD", &n)?;
        }
        if let Some(ms) = lookup("PQC_BREAKER_COOLDOWN_MS") {
            settings.breaker.cool_down =
                Duration::from_millis(parse_var("PQC_BREAKER_COOLDOWN_MS", &ms)?);
        }
        if let Some(path) = lookup("PQC_AUDIT_LOG") {
            settings.audit.log_path = Some(PathBuf::from(path));
        }
        if let Some(mode) = lookup("PQC_PREFERRED_MODE") {
            settings.auth.preferred_mode = mode.parse().map_err(|reason| ConfigError::Env {
                var: "PQC_PREFERRED_MODE",
                reason,
            })?;
        }

        if settings.breaker.failure_threshold == 0 {
            return Err(ConfigError::Env {
                var: "PQC_BREAKER_THRESHOLD",
                reason: "must be at least 1".to_string(),
            });
        }
        settings.auth.validate()?;
        Ok(settings)
    }
}

fn parse_var<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var,
        reason: e.to_string(),
    })
}
