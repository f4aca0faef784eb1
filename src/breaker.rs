//! Per-operation circuit breakers guarding the PQC engine
//!
//! States:
//! - Closed: PQC attempted normally
//! - Open: PQC skipped, classical used directly
//! - HalfOpen: cool-down elapsed, a single trial request is let through
//!
//! Each [`OperationKind`] owns an independent breaker. Every transition for a
//! kind happens under that kind's lock, so concurrent outcomes are applied one
//! at a time and none are lost.

use crate::config::BreakerSettings;
use crate::types::OperationKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Observable breaker state for one operation kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    last_failure_time: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    // Monotonic clocks drive the cool-down; wall clock is only reported
    opened_instant: Option<Instant>,
    trial_started: Option<Instant>,
}

impl Breaker {
    fn closed() -> Self {
        Breaker {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            last_failure_time: None,
            opened_at: None,
            opened_instant: None,
            trial_started: None,
        }
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            last_failure_time: self.last_failure_time,
            opened_at: self.opened_at,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Utc::now());
        self.opened_instant = Some(Instant::now());
        self.trial_started = None;
    }
}

pub struct CircuitBreakerRegistry {
    settings: BreakerSettings,
    breakers: [Mutex<Breaker>; 4],
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        CircuitBreakerRegistry {
            settings,
            breakers: std::array::from_fn(|_| Mutex::new(Breaker::closed())),
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    fn lock(&self, kind: OperationKind) -> MutexGuard<'_, Breaker> {
        self.breakers[kind as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Gate a PQC attempt for `kind`
    ///
    /// Moves an expired OPEN breaker to HALF_OPEN and grants exactly one trial request.
    /// A trial whose outcome is never recorded (e.g. a cancelled request) is
    /// given up after another cool-down.
    pub fn try_acquire(&self, kind: OperationKind) -> bool {
        let mut breaker = self.lock(kind);
        let cool_down = self.settings.cool_down;
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let expired = breaker
                    .opened_instant
                    .map_or(true, |opened| opened.elapsed() >= cool_down);
                if expired {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.trial_started = Some(Instant::now());
                    info!(operation = %kind, "Circuit breaker half-open, probing engine");
                }
                expired
            }
            CircuitState::HalfOpen => match breaker.trial_started {
                Some(started) if started.elapsed() < cool_down => false,
                _ => {
                    breaker.trial_started = Some(Instant::now());
                    true
                }
            },
        }
    }

    /// Whether a PQC attempt for `kind` would currently be admitted; never
    /// changes state
    pub fn is_available(&self, kind: OperationKind) -> bool {
        let breaker = self.lock(kind);
        let cool_down = self.settings.cool_down;
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => breaker
                .opened_instant
                .map_or(true, |opened| opened.elapsed() >= cool_down),
            CircuitState::HalfOpen => breaker
                .trial_started
                .map_or(true, |started| started.elapsed() >= cool_down),
        }
    }

    pub fn record_success(&self, kind: OperationKind) {
        let mut breaker = self.lock(kind);
        breaker.consecutive_failures = 0;
        breaker.total_successes += 1;
        if breaker.state == CircuitState::HalfOpen {
            breaker.state = CircuitState::Closed;
            breaker.opened_at = None;
            breaker.opened_instant = None;
            breaker.trial_started = None;
            info!(operation = %kind, "Circuit breaker closed after successful trial");
        }
    }

    pub fn record_failure(&self, kind: OperationKind) {
        let mut breaker = self.lock(kind);
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        breaker.total_failures += 1;
        breaker.last_failure_time = Some(Utc::now());

        match breaker.state {
            CircuitState::Closed
                if breaker.consecutive_failures >= self.settings.failure_threshold =>
            {
                breaker.open();
                metrics::increment_counter!("pqc_circuit_opened_total", "operation" => kind.as_str());
                warn!(
                    operation = %kind,
                    failure_count = breaker.consecutive_failures,
                    threshold = self.settings.failure_threshold,
                    "Circuit breaker opened due to failures"
                );
            }
            CircuitState::HalfOpen => {
                breaker.open();
                metrics::increment_counter!("pqc_circuit_opened_total", "operation" => kind.as_str());
                warn!(operation = %kind, "Circuit breaker reopened after failed trial");
            }
            _ => {}
        }
    }

    pub fn snapshot(&self, kind: OperationKind) -> BreakerSnapshot {
        self.lock(kind).snapshot()
    }

    /// Snapshot of every breaker
    pub fn status(&self) -> BTreeMap<OperationKind, BreakerSnapshot> {
        OperationKind::ALL
            .into_iter()
            .map(|kind| (kind, self.snapshot(kind)))
            .collect()
    }

    pub fn reset(&self, kind: OperationKind) {
        *self.lock(kind) = Breaker::closed();
        info!(operation = %kind, "Circuit breaker reset");
    }

    pub fn reset_all(&self) {
        for kind in OperationKind::ALL {
            self.reset(kind);
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        CircuitBreakerRegistry::new(BreakerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry(threshold: u32, cool_down: Duration) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerSettings {
            failure_threshold: threshold,
            cool_down,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let registry = registry(3, Duration::from_secs(60));
        for _ in 0..2 {
            registry.record_failure(OperationKind::Signing);
        }
        assert!(registry.is_available(OperationKind::Signing));
        registry.record_failure(OperationKind::Signing);

        assert!(!registry.is_available(OperationKind::Signing));
        assert!(!registry.try_acquire(OperationKind::Signing));
        let snapshot = registry.snapshot(OperationKind::Signing);
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_failures, 3);
        assert!(snapshot.opened_at.is_some());
    }

    #[test]
    fn test_operation_kinds_are_isolated() {
        let registry = registry(1, Duration::from_secs(60));
        registry.record_failure(OperationKind::Signing);
        assert!(!registry.is_available(OperationKind::Signing));
        assert!(registry.is_available(OperationKind::KeyGeneration));
        assert_eq!(
            registry.snapshot(OperationKind::KeyGeneration).consecutive_failures,
            0
        );
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let registry = registry(10, Duration::from_secs(60));
        for _ in 0..7 {
            registry.record_failure(OperationKind::Handshake);
        }
        registry.record_success(OperationKind::Handshake);
        let snapshot = registry.snapshot(OperationKind::Handshake);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.total_failures, 7);
        assert_eq!(snapshot.total_successes, 1);
    }

    #[test]
    fn test_half_open_grants_single_trial() {
        let registry = registry(1, Duration::from_millis(20));
        registry.record_failure(OperationKind::KeyGeneration);
        assert!(!registry.try_acquire(OperationKind::KeyGeneration));

        std::thread::sleep(Duration::from_millis(40));
        assert!(registry.is_available(OperationKind::KeyGeneration));
        assert!(registry.try_acquire(OperationKind::KeyGeneration));
        assert_eq!(
            registry.snapshot(OperationKind::KeyGeneration).state,
            CircuitState::HalfOpen
        );
        // Trial outstanding: nobody else gets through
        assert!(!registry.try_acquire(OperationKind::KeyGeneration));

        registry.record_success(OperationKind::KeyGeneration);
        assert_eq!(
            registry.snapshot(OperationKind::KeyGeneration).state,
            CircuitState::Closed
        );
        assert!(registry.try_acquire(OperationKind::KeyGeneration));
    }

    #[test]
    fn test_failed_trial_reopens_and_restarts_cool_down() {
        let registry = registry(1, Duration::from_millis(20));
        registry.record_failure(OperationKind::Verification);
        let first_open = registry.snapshot(OperationKind::Verification).opened_at;

        std::thread::sleep(Duration::from_millis(40));
        assert!(registry.try_acquire(OperationKind::Verification));
        registry.record_failure(OperationKind::Verification);

        let snapshot = registry.snapshot(OperationKind::Verification);
        assert_eq!(snapshot.state, CircuitState::Open);
        assert!(snapshot.opened_at > first_open);
        assert!(!registry.is_available(OperationKind::Verification));
    }

    #[test]
    fn test_status_is_idempotent() {
        let registry = registry(2, Duration::from_secs(60));
        registry.record_failure(OperationKind::Signing);
        registry.record_failure(OperationKind::Signing);
        registry.record_success(OperationKind::Handshake);

        let first = registry.status();
        let second = registry.status();
        assert_eq!(first, second);
        assert_eq!(first.len(), OperationKind::ALL.len());
        assert!(!registry.is_available(OperationKind::Signing));
        assert_eq!(registry.status(), first);
    }

    #[test]
    fn test_reset() {
        let registry = registry(1, Duration::from_secs(60));
        registry.record_failure(OperationKind::Signing);
        registry.record_failure(OperationKind::Handshake);
        registry.reset(OperationKind::Signing);
        assert_eq!(
            registry.snapshot(OperationKind::Signing),
            Breaker::closed().snapshot()
        );
        assert!(!registry.is_available(OperationKind::Handshake));
        registry.reset_all();
        assert!(registry.is_available(OperationKind::Handshake));
    }

    #[test]
    fn test_concurrent_failures_are_not_lost() {
        let registry = std::sync::Arc::new(registry(1000, Duration::from_secs(60)));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.record_failure(OperationKind::Signing))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = registry.snapshot(OperationKind::Signing);
        assert_eq!(snapshot.consecutive_failures, 50);
        assert_eq!(snapshot.total_failures, 50);
    }

    #[test]
    fn test_status_json_shape() {
        let registry = registry(5, Duration::from_secs(60));
        let json = serde_json::to_value(registry.status()).unwrap();
        assert_eq!(json["key-generation"]["state"], "CLOSED");
        assert_eq!(json["signing"]["consecutive_failures"], 0);
    }
}
