//! Classical fallback provider
//!
//! Conventional primitives used when PQC is unavailable, disabled or refused
//! by policy. Everything runs in-process and there is no breaker in front of
//! it: this is the fallback of last resort.
//!
//! | Operation       | Algorithm     |
//! |-----------------|---------------|
//! | session tokens  | HMAC-SHA256   |
//! | signatures      | ECDSA P-256   |
//! | encryption      | AES-256-GCM   |
//!
//! Tokens are `base64url(claims-json) "." base64url(tag-or-signature)`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use p256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::types::{AlgorithmId, SessionData};

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_ALGORITHM: &str = "HS256";
pub const SIGNATURE_ALGORITHM: &str = "ES256";
pub const ENCRYPTION_ALGORITHM: &str = "AES-256-GCM";

const GCM_NONCE_SIZE: usize = 12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassicalError {
    #[error("malformed token: {0}")]
    MalformedToken(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("token was issued to a different user")]
    UserMismatch,

    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("token lifetime of {0:?} cannot be represented")]
    LifetimeOutOfRange(Duration),

    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
}

impl ClassicalError {
    /// True when the error is a verdict about the input rather than a
    /// malfunction of the provider
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            ClassicalError::Crypto(_) | ClassicalError::LifetimeOutOfRange(_)
        )
    }
}

/// Claims carried by classical tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub algorithm: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassicalSession {
    pub session: SessionData,
    pub token: String,
    pub algorithm: AlgorithmId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub algorithm: String,
    pub nonce: String,
    pub ciphertext: String,
}

pub struct ClassicalProvider {
    hmac_key: Zeroizing<[u8; 32]>,
    aes_key: Zeroizing<[u8; 32]>,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl ClassicalProvider {
    /// Create a provider with freshly generated keys
    pub fn generate() -> Self {
        let mut hmac_key = Zeroizing::new([0u8; 32]);
        let mut aes_key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(hmac_key.as_mut());
        OsRng.fill_bytes(aes_key.as_mut());
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);

        ClassicalProvider {
            hmac_key,
            aes_key,
            signing_key,
            verifying_key,
        }
    }

    /// Truncated SHA-256 of the signing public key, safe to log
    pub fn public_key_hash(&self) -> String {
        let encoded = self.verifying_key.to_encoded_point(true);
        let digest = Sha256::digest(encoded.as_bytes());
        digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
    }

    /// Issue a new HMAC-protected session token valid for `ttl`
    pub fn generate_tokens(
        &self,
        user_id: &str,
        ttl: Duration,
    ) -> Result<ClassicalSession, ClassicalError> {
        let mut raw_id = [0u8; 32];
        OsRng.fill_bytes(&mut raw_id);
        let session_id = B64.encode(raw_id);

        let claims = claims(user_id, SESSION_ALGORITHM, Some(session_id.clone()), None, ttl)?;
        let body = encode_claims(&claims)?;
        let tag = self.mac(body.as_bytes())?;

        Ok(ClassicalSession {
            session: SessionData {
                session_id,
                public_key_hash: self.public_key_hash(),
            },
            token: format!("{}.{}", body, B64.encode(tag)),
            algorithm: AlgorithmId::from(SESSION_ALGORITHM),
        })
    }

    /// Sign `payload` for `user_id` with ECDSA P-256
    pub fn sign(
        &self,
        user_id: &str,
        payload: Option<Value>,
        ttl: Duration,
    ) -> Result<String, ClassicalError> {
        let claims = claims(user_id, SIGNATURE_ALGORITHM, None, payload, ttl)?;
        let body = encode_claims(&claims)?;
        let signature: Signature = self.signing_key.sign(body.as_bytes());
        Ok(format!("{}.{}", body, B64.encode(signature.to_bytes())))
    }

    /// Verify a token produced by [`Self::sign`] or [`Self::generate_tokens`]
    pub fn verify(&self, token: &str, user_id: &str) -> Result<TokenClaims, ClassicalError> {
        let (body, tail) = token
            .split_once('.')
            .ok_or(ClassicalError::MalformedToken("missing separator"))?;
        let tail = B64
            .decode(tail)
            .map_err(|_| ClassicalError::MalformedToken("signature encoding"))?;
        let claims_json = B64
            .decode(body)
            .map_err(|_| ClassicalError::MalformedToken("claims encoding"))?;
        let claims: TokenClaims = serde_json::from_slice(&claims_json)
            .map_err(|_| ClassicalError::MalformedToken("claims structure"))?;

        match claims.algorithm.as_str() {
            SESSION_ALGORITHM => {
                let mut mac = self.hmac()?;
                mac.update(body.as_bytes());
                mac.verify_slice(&tail)
                    .map_err(|_| ClassicalError::InvalidSignature)?;
            }
            SIGNATURE_ALGORITHM => {
                let signature = Signature::from_slice(&tail)
                    .map_err(|_| ClassicalError::MalformedToken("signature length"))?;
                self.verifying_key
                    .verify(body.as_bytes(), &signature)
                    .map_err(|_| ClassicalError::InvalidSignature)?;
            }
            other => return Err(ClassicalError::UnsupportedAlgorithm(other.to_string())),
        }

        if claims.user_id != user_id {
            return Err(ClassicalError::UserMismatch);
        }
        if Utc::now().timestamp() > claims.exp {
            return Err(ClassicalError::Expired);
        }
        Ok(claims)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, ClassicalError> {
        let mut nonce = [0u8; GCM_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.aes_key.as_ref()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ClassicalError::Crypto("AES-GCM encryption failed".to_string()))?;
        Ok(EncryptedBlob {
            algorithm: ENCRYPTION_ALGORITHM.to_string(),
            nonce: B64.encode(nonce),
            ciphertext: B64.encode(ciphertext),
        })
    }

    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>, ClassicalError> {
        if blob.algorithm != ENCRYPTION_ALGORITHM {
            return Err(ClassicalError::UnsupportedAlgorithm(blob.algorithm.clone()));
        }
        let nonce = B64
            .decode(&blob.nonce)
            .map_err(|_| ClassicalError::MalformedToken("nonce encoding"))?;
        if nonce.len() != GCM_NONCE_SIZE {
            return Err(ClassicalError::MalformedToken("nonce length"));
        }
        let ciphertext = B64
            .decode(&blob.ciphertext)
            .map_err(|_| ClassicalError::MalformedToken("ciphertext encoding"))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.aes_key.as_ref()));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| ClassicalError::InvalidSignature)
    }

    fn hmac(&self) -> Result<HmacSha256, ClassicalError> {
        <HmacSha256 as Mac>::new_from_slice(self.hmac_key.as_ref())
            .map_err(|e| ClassicalError::Crypto(format!("HMAC key: {}", e)))
    }

    fn mac(&self, data: &[u8]) -> Result<Vec<u8>, ClassicalError> {
        let mut mac = self.hmac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn claims(
    user_id: &str,
    algorithm: &str,
    session_id: Option<String>,
    payload: Option<Value>,
    ttl: Duration,
) -> Result<TokenClaims, ClassicalError> {
    let iat = Utc::now().timestamp();
    let exp = i64::try_from(ttl.as_secs())
        .ok()
        .and_then(|secs| iat.checked_add(secs))
        .ok_or(ClassicalError::LifetimeOutOfRange(ttl))?;
    Ok(TokenClaims {
        user_id: user_id.to_string(),
        session_id,
        algorithm: algorithm.to_string(),
        iat,
        exp,
        payload,
    })
}

fn encode_claims(claims: &TokenClaims) -> Result<String, ClassicalError> {
    let json =
        serde_json::to_vec(claims).map_err(|e| ClassicalError::Crypto(format!("claims: {}", e)))?;
    Ok(B64.encode(json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(3600);

    fn provider() -> ClassicalProvider {
        ClassicalProvider::generate()
    }

    #[test]
    fn test_session_token_verifies() {
        let provider = provider();
        let session = provider.generate_tokens("u1", TTL).unwrap();
        assert_eq!(session.algorithm.as_str(), SESSION_ALGORITHM);
        assert_eq!(session.session.public_key_hash.len(), 16);

        let claims = provider.verify(&session.token, "u1").unwrap();
        assert_eq!(claims.session_id.as_deref(), Some(session.session.session_id.as_str()));
    }

    #[test]
    fn test_signed_token_binds_user_and_payload() {
        let provider = provider();
        let token = provider
            .sign("u1", Some(json!({"scope": "consent:read"})), TTL)
            .unwrap();

        let claims = provider.verify(&token, "u1").unwrap();
        assert_eq!(claims.algorithm, SIGNATURE_ALGORITHM);
        assert_eq!(claims.payload.unwrap()["scope"], "consent:read");

        assert_eq!(
            provider.verify(&token, "u2").unwrap_err(),
            ClassicalError::UserMismatch
        );
    }

    #[test]
    fn test_tampered_token_is_rejected() {
        let provider = provider();
        let token = provider.sign("u1", None, TTL).unwrap();
        let (_, signature) = token.split_once('.').unwrap();
        let forged_claims = B64.encode(
            serde_json::to_vec(&json!({
                "user_id": "admin", "algorithm": "ES256", "iat": 0, "exp": i64::MAX
            }))
            .unwrap(),
        );
        let forged = format!("{}.{}", forged_claims, signature);
        assert_eq!(
            provider.verify(&forged, "admin").unwrap_err(),
            ClassicalError::InvalidSignature
        );
    }

    #[test]
    fn test_tokens_from_another_provider_do_not_verify() {
        let token = provider().generate_tokens("u1", TTL).unwrap().token;
        let err = provider().verify(&token, "u1").unwrap_err();
        assert_eq!(err, ClassicalError::InvalidSignature);
        assert!(err.is_rejection());
    }

    #[test]
    fn test_expired_token() {
        let provider = provider();
        let mut expired = claims("u1", SESSION_ALGORITHM, None, None, TTL).unwrap();
        expired.exp = expired.iat - 10;
        let body = encode_claims(&expired).unwrap();
        let token = format!("{}.{}", body, B64.encode(provider.mac(body.as_bytes()).unwrap()));
        assert_eq!(
            provider.verify(&token, "u1").unwrap_err(),
            ClassicalError::Expired
        );
    }

    #[test]
    fn test_malformed_tokens() {
        let provider = provider();
        assert!(matches!(
            provider.verify("no-separator", "u1"),
            Err(ClassicalError::MalformedToken(_))
        ));
        assert!(matches!(
            provider.verify("!!!.???", "u1"),
            Err(ClassicalError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_unrepresentable_lifetime_is_an_error() {
        let provider = provider();
        let ttl = Duration::from_secs(u64::MAX);
        let err = provider.generate_tokens("u1", ttl).unwrap_err();
        assert_eq!(err, ClassicalError::LifetimeOutOfRange(ttl));
        assert!(!err.is_rejection());
        assert!(provider.sign("u1", None, ttl).is_err());
    }

    #[test]
    fn test_encrypt_decrypt() {
        let provider = provider();
        let blob = provider.encrypt(b"consent record 42").unwrap();
        assert_eq!(blob.algorithm, ENCRYPTION_ALGORITHM);
        assert_eq!(provider.decrypt(&blob).unwrap(), b"consent record 42");

        let mut tampered = blob.clone();
        tampered.ciphertext = B64.encode(b"garbage ciphertext bytes");
        assert!(provider.decrypt(&tampered).is_err());
    }
}
