//! Parameter sanitization for the engine boundary
//!
//! Every parameter crossing into the external engine goes through
//! [`Sanitizer::sanitize`]: keys must belong to the fixed allow-list
//! ([`ParamKey`]), values are stripped of markup tags, shell metacharacters,
//! NUL and control characters, then capped in length. A value that would lose
//! more than a fifth of its characters is treated as hostile and rejected
//! instead of being silently repaired.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum share of a value (in characters) sanitization may remove, as a ratio
/// of `MAX_ALTERED_NUM / MAX_ALTERED_DEN`
const MAX_ALTERED_NUM: usize = 1;
const MAX_ALTERED_DEN: usize = 5;

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '(', ')', '{', '}', '[', ']', '\\', '\'', '"', '!', '*',
    '?', '~', '#',
];

lazy_static! {
    static ref MARKUP_TAG: Regex = Regex::new(r"<[^<>]*>").expect("static regex");
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("parameter '{0}' is not allowed")]
    UnknownKey(String),

    #[error("parameter '{key}' rejected as suspicious: {removed} of {original_len} characters would be removed")]
    Suspicious {
        key: ParamKey,
        removed: usize,
        original_len: usize,
    },

    #[error("parameter '{key}' is {len} characters long, at most {max} allowed")]
    TooLong { key: ParamKey, len: usize, max: usize },
}

/// Allow-listed parameter names accepted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKey {
    UserId,
    Payload,
    Token,
    Metadata,
    OperationId,
    Email,
    SessionId,
}

impl ParamKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKey::UserId => "user_id",
            ParamKey::Payload => "payload",
            ParamKey::Token => "token",
            ParamKey::Metadata => "metadata",
            ParamKey::OperationId => "operation_id",
            ParamKey::Email => "email",
            ParamKey::SessionId => "session_id",
        }
    }

    /// Keys whose values are encoded byte strings; cutting them changes what
    /// the engine sees, so they are never truncated
    pub fn is_encoded(&self) -> bool {
        matches!(self, ParamKey::Payload | ParamKey::Token | ParamKey::Metadata)
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamKey {
    type Err = SanitizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_id" => Ok(ParamKey::UserId),
            "payload" => Ok(ParamKey::Payload),
            "token" => Ok(ParamKey::Token),
            "metadata" => Ok(ParamKey::Metadata),
            "operation_id" => Ok(ParamKey::OperationId),
            "email" => Ok(ParamKey::Email),
            "session_id" => Ok(ParamKey::SessionId),
            other => Err(SanitizeError::UnknownKey(other.to_string())),
        }
    }
}

/// Parameters that passed sanitization; only constructible through [`Sanitizer`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SanitizedParams(BTreeMap<ParamKey, String>);

impl SanitizedParams {
    pub fn get(&self, key: ParamKey) -> Option<&str> {
        self.0.get(&key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamKey, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sanitizer {
    max_value_len: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Sanitizer {
            max_value_len: 4096,
        }
    }
}

impl Sanitizer {
    pub fn new(max_value_len: usize) -> Self {
        Sanitizer { max_value_len }
    }

    pub fn max_value_len(&self) -> usize {
        self.max_value_len
    }

    pub fn sanitize<I, K, V>(&self, raw: I) -> Result<SanitizedParams, SanitizeError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = BTreeMap::new();
        for (key, value) in raw {
            let key: ParamKey = key.as_ref().parse()?;
            let clean = self.sanitize_value(key, value.as_ref())?;
            params.insert(key, clean);
        }
        Ok(SanitizedParams(params))
    }

    pub fn sanitize_value(&self, key: ParamKey, value: &str) -> Result<String, SanitizeError> {
        let original_len = value.chars().count();

        let untagged = MARKUP_TAG.replace_all(value, "");
        let mut clean: String = untagged
            .chars()
            .filter(|c| *c != '\0' && !c.is_control() && !SHELL_METACHARACTERS.contains(c))
            .collect();

        let clean_len = clean.chars().count();
        if clean_len > self.max_value_len {
            if key.is_encoded() {
                tracing::warn!(
                    parameter = %key,
                    len = clean_len,
                    max = self.max_value_len,
                    "Rejecting oversized engine parameter"
                );
                return Err(SanitizeError::TooLong {
                    key,
                    len: clean_len,
                    max: self.max_value_len,
                });
            }
            clean = clean.chars().take(self.max_value_len).collect();
        }

        let removed = original_len - clean.chars().count();
        if removed * MAX_ALTERED_DEN > original_len * MAX_ALTERED_NUM {
            tracing::warn!(
                parameter = %key,
                removed,
                original_len,
                "Rejecting suspicious engine parameter"
            );
            return Err(SanitizeError::Suspicious {
                key,
                removed,
                original_len,
            });
        }
        if removed > 0 {
            tracing::debug!(parameter = %key, removed, "Sanitized engine parameter");
        }
        Ok(clean)
    }
}
