//! Feature flags and staged PQC rollout
//!
//! Features are plain names: `pqc` is the master toggle and `pqc.<kind>`
//! toggles a single [`OperationKind`]. Unknown flags are enabled. Resolution
//! for PQC eligibility is:
//!
//! 1. a per-user override for `pqc` or `pqc.<kind>` (a disabling override wins)
//! 2. a global flag switched off
//! 3. the rollout bucket of the user against `pqc_threshold`

use crate::types::OperationKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

pub const PQC_FEATURE: &str = "pqc";

/// Flag name gating PQC for one operation kind
pub fn operation_feature(kind: OperationKind) -> String {
    format!("{}.{}", PQC_FEATURE, kind)
}

/// Stable rollout bucket in `0..100` for a user
pub fn rollout_bucket(user_id: &str) -> u8 {
    let digest = Sha256::digest(user_id.as_bytes());
    (u16::from_be_bytes([digest[0], digest[1]]) % 100) as u8
}

/// True when `user_id` falls inside a rollout covering `threshold` of users
pub fn in_rollout(user_id: &str, threshold: f64) -> bool {
    f64::from(rollout_bucket(user_id)) < threshold * 100.0
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSnapshot {
    pub global: BTreeMap<String, bool>,
    pub overrides: BTreeMap<String, BTreeMap<String, bool>>,
}

#[derive(Debug, Default)]
pub struct FeatureFlags {
    state: RwLock<FlagSnapshot>,
}

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, feature: &str, user_id: Option<&str>) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = user_id.and_then(|user| Self::override_of(&state, user, feature)) {
            return value;
        }
        state.global.get(feature).copied().unwrap_or(true)
    }

    /// Whether PQC may be attempted for `kind` on behalf of `user_id`
    pub fn pqc_allowed(&self, kind: OperationKind, user_id: &str, threshold: f64) -> bool {
        let features = [PQC_FEATURE.to_string(), operation_feature(kind)];
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        let overrides: Vec<bool> = features
            .iter()
            .filter_map(|f| Self::override_of(&state, user_id, f))
            .collect();
        if !overrides.is_empty() {
            return overrides.iter().all(|enabled| *enabled);
        }

        let globally_on = features
            .iter()
            .all(|f| state.global.get(f).copied().unwrap_or(true));
        globally_on && in_rollout(user_id, threshold)
    }

    pub fn set_global(&self, feature: &str, enabled: bool) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.global.insert(feature.to_string(), enabled);
        tracing::info!(feature, enabled, "Global feature flag set");
    }

    /// Set (`Some`) or clear (`None`) a per-user override
    pub fn set_override(&self, user_id: &str, feature: &str, enabled: Option<bool>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match enabled {
            Some(enabled) => {
                state
                    .overrides
                    .entry(user_id.to_string())
                    .or_default()
                    .insert(feature.to_string(), enabled);
            }
            None => {
                if let Some(user) = state.overrides.get_mut(user_id) {
                    user.remove(feature);
                    if user.is_empty() {
                        state.overrides.remove(user_id);
                    }
                }
            }
        }
        tracing::info!(user_id, feature, ?enabled, "Feature flag override set");
    }

    pub fn snapshot(&self) -> FlagSnapshot {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn override_of(state: &FlagSnapshot, user_id: &str, feature: &str) -> Option<bool> {
        state
            .overrides
            .get(user_id)
            .and_then(|user| user.get(feature))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_default_on() {
        let flags = FeatureFlags::new();
        assert!(flags.is_enabled(PQC_FEATURE, None));
        assert!(flags.is_enabled("pqc.signing", Some("u1")));
        assert!(flags.pqc_allowed(OperationKind::Signing, "u1", 1.0));
    }

    #[test]
    fn test_global_flag_off() {
        let flags = FeatureFlags::new();
        flags.set_global(&operation_feature(OperationKind::Signing), false);
        assert!(!flags.pqc_allowed(OperationKind::Signing, "u1", 1.0));
        assert!(flags.pqc_allowed(OperationKind::Handshake, "u1", 1.0));
    }

    #[test]
    fn test_user_override_beats_global_and_rollout() {
        let flags = FeatureFlags::new();
        flags.set_global(PQC_FEATURE, false);
        flags.set_override("beta-tester", PQC_FEATURE, Some(true));

        assert!(flags.pqc_allowed(OperationKind::Handshake, "beta-tester", 0.0));
        assert!(!flags.pqc_allowed(OperationKind::Handshake, "someone-else", 1.0));
        assert!(flags.is_enabled(PQC_FEATURE, Some("beta-tester")));
        assert!(!flags.is_enabled(PQC_FEATURE, None));

        flags.set_override("beta-tester", PQC_FEATURE, None);
        assert!(!flags.pqc_allowed(OperationKind::Handshake, "beta-tester", 1.0));
        assert!(flags.snapshot().overrides.is_empty());
    }

    #[test]
    fn test_disabling_override_wins() {
        let flags = FeatureFlags::new();
        flags.set_override("u1", PQC_FEATURE, Some(true));
        flags.set_override("u1", "pqc.key-generation", Some(false));
        assert!(!flags.pqc_allowed(OperationKind::KeyGeneration, "u1", 1.0));
        assert!(flags.pqc_allowed(OperationKind::Signing, "u1", 1.0));
    }

    #[test]
    fn test_rollout_bucket_is_stable_and_bounded() {
        for user in ["u1", "u2", "alice@example.com", ""] {
            let bucket = rollout_bucket(user);
            assert!(bucket < 100);
            assert_eq!(bucket, rollout_bucket(user));
        }
        assert!(in_rollout("u1", 1.0));
        assert!(!in_rollout("u1", 0.0));
    }

    #[test]
    fn test_rollout_fraction_is_roughly_respected() {
        let inside = (0..1000)
            .filter(|i| in_rollout(&format!("user-{}", i), 0.3))
            .count();
        assert!((200..400).contains(&inside), "inside = {}", inside);
    }
}
