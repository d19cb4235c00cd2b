//! Bearer credentials issued by the identity provider.
//!
//! An [`AccessToken`] binds an external identity (the provider's subject id)
//! to a validity window and is signed with the provider's Ed25519 key. The
//! server only ever holds the public half.
//!
//! Also home to channel join tokens, which are plain random strings.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::JOIN_TOKEN_BYTES;
use crate::error::TokenError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    /// External identity id as known by the provider.
    pub subject: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub signature: Vec<u8>,
}

// payload = subject || issued_at (rfc3339) || expires_at (rfc3339)
fn signing_payload(subject: &str, issued_at: &DateTime<Utc>, expires_at: &DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(subject.as_bytes());
    payload.extend_from_slice(issued_at.to_rfc3339().as_bytes());
    payload.extend_from_slice(expires_at.to_rfc3339().as_bytes());
    payload
}

impl AccessToken {
    /// Mint a token. Used by provider tooling and tests; the server never signs.
    pub fn create(subject: &str, ttl: Duration, provider_key: &SigningKey) -> Self {
        let issued_at = Utc::now();
        let expires_at = issued_at + ttl;
        let signature = provider_key.sign(&signing_payload(subject, &issued_at, &expires_at));

        Self {
            subject: subject.to_string(),
            issued_at,
            expires_at,
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Encode as a base64url string suitable for an `Authorization` header.
    pub fn encode(&self) -> String {
        // Serializing plain strings/timestamps/bytes cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn decode(encoded: &str) -> Result<Self, TokenError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| TokenError::InvalidFormat)?;
        serde_json::from_slice(&bytes).map_err(|_| TokenError::InvalidFormat)
    }

    /// Check expiry and the provider signature.
    pub fn verify_with_key(&self, provider_pubkey: &[u8; 32]) -> Result<(), TokenError> {
        if Utc::now() > self.expires_at {
            return Err(TokenError::Expired);
        }

        let verifying_key =
            VerifyingKey::from_bytes(provider_pubkey).map_err(|_| TokenError::InvalidKey)?;

        let signature =
            Signature::from_slice(&self.signature).map_err(|_| TokenError::InvalidSignature)?;

        verifying_key
            .verify(
                &signing_payload(&self.subject, &self.issued_at, &self.expires_at),
                &signature,
            )
            .map_err(|_| TokenError::InvalidSignature)
    }
}

/// Verify a detached provider signature (hex) over an arbitrary body.
/// Used for identity webhooks.
pub fn verify_provider_signature(
    provider_pubkey: &[u8; 32],
    body: &[u8],
    signature_hex: &str,
) -> Result<(), TokenError> {
    let verifying_key =
        VerifyingKey::from_bytes(provider_pubkey).map_err(|_| TokenError::InvalidKey)?;
    let bytes = hex::decode(signature_hex.trim()).map_err(|_| TokenError::InvalidFormat)?;
    let signature = Signature::from_slice(&bytes).map_err(|_| TokenError::InvalidSignature)?;
    verifying_key
        .verify(body, &signature)
        .map_err(|_| TokenError::InvalidSignature)
}

/// Generate an unguessable channel join token.
pub fn generate_join_token() -> String {
    let mut bytes = [0u8; JOIN_TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
