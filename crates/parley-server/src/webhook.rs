//! Identity provider webhook.
//!
//! The provider pushes user create/update/delete events. This is the only
//! writer of local user records; realtime operations for an identity that
//! has not been synced yet fail with `NotFound`.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use parley_shared::token::verify_provider_signature;
use parley_store::{ChatStore, User, UserUpsert};

use crate::api::AppState;
use crate::error::ServerError;
use crate::registry::ConnectionRegistry;

/// Header carrying the hex Ed25519 signature of the raw body.
pub const SIGNATURE_HEADER: &str = "x-identity-signature";

#[derive(Debug, Deserialize)]
pub struct IdentityEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: IdentityData,
}

#[derive(Debug, Deserialize)]
pub struct IdentityData {
    pub id: String,
    #[serde(default)]
    pub email_addresses: Vec<EmailAddress>,
    pub primary_email_address_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmailAddress {
    pub id: String,
    pub email_address: String,
}

impl IdentityData {
    fn primary_email(&self) -> Option<&str> {
        let primary = self.primary_email_address_id.as_deref()?;
        self.email_addresses
            .iter()
            .find(|e| e.id == primary)
            .map(|e| e.email_address.as_str())
    }

    fn to_upsert(&self) -> Result<UserUpsert, ServerError> {
        let email = self
            .primary_email()
            .ok_or_else(|| ServerError::BadRequest("primary email not found".into()))?;
        Ok(UserUpsert {
            external_id: self.id.clone(),
            email: email.to_string(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            image: self.image_url.clone(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Upserted(User),
    Deleted { evicted: bool },
    Missing,
    Ignored,
}

/// Apply one verified event to the store and the live registry.
pub async fn apply_event(
    store: &dyn ChatStore,
    registry: &ConnectionRegistry,
    event: &IdentityEvent,
) -> Result<SyncOutcome, ServerError> {
    match event.kind.as_str() {
        // An update for a user we never saw creates it.
        "user.created" | "user.updated" => {
            let user = store.upsert_user(event.data.to_upsert()?).await?;
            info!(user = %user.id, external = %event.data.id, kind = %event.kind, "Identity synced");
            Ok(SyncOutcome::Upserted(user))
        }
        "user.deleted" => match store.delete_user_by_external_id(&event.data.id).await? {
            Some(user) => {
                let evicted = registry.evict(&user.id);
                info!(user = %user.id, evicted, "Identity deleted");
                Ok(SyncOutcome::Deleted { evicted })
            }
            None => {
                warn!(external = %event.data.id, "Delete for unknown identity");
                Ok(SyncOutcome::Missing)
            }
        },
        other => {
            info!(kind = %other, external = %event.data.id, "Unhandled identity event");
            Ok(SyncOutcome::Ignored)
        }
    }
}

#[derive(Serialize)]
pub struct WebhookResponse {
    success: bool,
    message: &'static str,
}

pub async fn identity_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ServerError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::BadRequest("missing webhook signature".into()))?;

    verify_provider_signature(&state.config.identity_provider_pubkey, &body, signature)
        .map_err(|e| {
            warn!(error = %e, "Webhook signature rejected");
            ServerError::BadRequest("invalid webhook signature".into())
        })?;

    let event: IdentityEvent = serde_json::from_slice(&body)
        .map_err(|e| ServerError::BadRequest(format!("invalid webhook body: {e}")))?;

    apply_event(state.store.as_ref(), &state.registry, &event).await?;

    Ok(Json(WebhookResponse {
        success: true,
        message: "Webhook processed",
    }))
}
