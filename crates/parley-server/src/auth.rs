//! Session authentication.
//!
//! Bearer credentials are issued by the identity provider. The
//! [`SignedTokenVerifier`] checks them against the provider's Ed25519 key
//! and caches successful verifications until the token expires. The
//! [`SessionAuthenticator`] then resolves the external identity to a local
//! user and admits connections into the registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Uri};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use parley_shared::token::AccessToken;
use parley_store::{ChatStore, User};

use crate::error::ServerError;
use crate::registry::{ConnectionHandle, ConnectionRegistry, OutboundTx};

// ---------------------------------------------------------------------------
// Identity verification
// ---------------------------------------------------------------------------

/// Turns a presented credential into the provider's subject id.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<String, ServerError>;
}

/// A cached verification result.
#[derive(Debug, Clone)]
struct CachedIdentity {
    subject: String,
    expires_at: DateTime<Utc>,
}

impl CachedIdentity {
    fn is_fresh(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

/// Verifies [`AccessToken`]s signed by the identity provider.
#[derive(Clone)]
pub struct SignedTokenVerifier {
    provider_pubkey: [u8; 32],
    /// Cache: blake3(credential) -> verified identity.
    cache: Arc<RwLock<HashMap<[u8; 32], CachedIdentity>>>,
}

impl SignedTokenVerifier {
    pub fn new(provider_pubkey: [u8; 32]) -> Self {
        Self {
            provider_pubkey,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Evict expired entries from the cache.
    pub async fn purge_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh());
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "Purged expired credential cache entries");
        }
    }

    #[cfg(test)]
    async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[async_trait]
impl IdentityVerifier for SignedTokenVerifier {
    async fn verify(&self, credential: &str) -> Result<String, ServerError> {
        let key = *blake3::hash(credential.as_bytes()).as_bytes();

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                if entry.is_fresh() {
                    return Ok(entry.subject.clone());
                }
            }
        }

        let token = AccessToken::decode(credential)?;
        if let Err(e) = token.verify_with_key(&self.provider_pubkey) {
            debug!(error = %e, "Credential rejected");
            return Err(e.into());
        }

        self.cache.write().await.insert(
            key,
            CachedIdentity {
                subject: token.subject.clone(),
                expires_at: token.expires_at,
            },
        );

        Ok(token.subject)
    }
}

// ---------------------------------------------------------------------------
// Session authenticator
// ---------------------------------------------------------------------------

pub struct SessionAuthenticator {
    verifier: Arc<dyn IdentityVerifier>,
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
}

impl SessionAuthenticator {
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            verifier,
            store,
            registry,
        }
    }

    /// Resolve a credential to the local user record.
    ///
    /// An identity the provider knows but the webhook has not synced yet is
    /// `NotFound`, never retried.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<User, ServerError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(ServerError::Unauthenticated)?;

        let subject = self.verifier.verify(credential).await?;

        self.store
            .find_user_by_external_id(&subject)
            .await?
            .ok_or_else(|| ServerError::NotFound("User".into()))
    }

    /// Bind a new connection to `user` and register it.
    pub fn admit(&self, user: &User, tx: OutboundTx) -> ConnectionHandle {
        let handle = ConnectionHandle::new(user.id, tx);
        self.registry.register(handle.clone());
        info!(user = %user.id, connection = %handle.id.short(), "Session admitted");
        handle
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Credential from `Authorization: Bearer ...`, else the `token` query parameter.
pub fn extract_credential(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    bearer.or_else(|| {
        Query::<TokenQuery>::try_from_uri(uri)
            .ok()
            .and_then(|Query(q)| q.token)
    })
}

// ---------------------------------------------------------------------------
// Axum extractor
// ---------------------------------------------------------------------------

/// The authenticated caller of an HTTP route.
pub struct AuthUser(pub User);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<SessionAuthenticator>: FromRef<S>,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let authenticator = Arc::<SessionAuthenticator>::from_ref(state);
        let credential = extract_credential(&parts.headers, &parts.uri);
        let user = authenticator.authenticate(credential.as_deref()).await?;
        Ok(AuthUser(user))
    }
}
