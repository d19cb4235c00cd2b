use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, FromRef, Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use parley_shared::protocol::{ChannelView, MessageView, UserProfile};
use parley_shared::types::{ChannelId, MessageId, UserId};
use parley_store::{ChatStore, NewChannel, ProfileUpdate, User};

use crate::auth::{AuthUser, SessionAuthenticator, SignedTokenVerifier};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::fanout::FanoutEngine;
use crate::gateway::{ws_handler, Realtime};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::registry::ConnectionRegistry;
use crate::signaling::SignalingRelay;
use crate::uploads::{StoredUpload, UploadStore};
use crate::webhook::identity_webhook;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub authenticator: Arc<SessionAuthenticator>,
    pub token_verifier: Arc<SignedTokenVerifier>,
    pub fanout: FanoutEngine,
    pub realtime: Realtime,
    pub uploads: Arc<UploadStore>,
    pub rate_limiter: RateLimiter,
    pub event_limiter: RateLimiter<UserId>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component around one store and one registry.
    pub fn new(config: ServerConfig, store: Arc<dyn ChatStore>, uploads: UploadStore) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let token_verifier = Arc::new(SignedTokenVerifier::new(config.identity_provider_pubkey));
        let authenticator = Arc::new(SessionAuthenticator::new(
            token_verifier.clone(),
            store.clone(),
            registry.clone(),
        ));
        let fanout = FanoutEngine::new(store.clone(), registry.clone());
        let realtime = Realtime::new(
            fanout.clone(),
            SignalingRelay::new(registry.clone()),
            registry.clone(),
        );

        Self {
            store,
            registry,
            authenticator,
            token_verifier,
            fanout,
            realtime,
            uploads: Arc::new(uploads),
            rate_limiter: RateLimiter::default(),
            event_limiter: RateLimiter::new(config.events_per_second, config.event_burst),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

impl FromRef<AppState> for Arc<SessionAuthenticator> {
    fn from_ref(state: &AppState) -> Self {
        state.authenticator.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let origin = match state.config.allowed_origin.as_deref().map(HeaderValue::from_str) {
        Some(Ok(origin)) => AllowOrigin::exact(origin),
        Some(Err(e)) => {
            warn!(error = %e, "Invalid ALLOWED_ORIGIN, allowing any origin");
            AllowOrigin::any()
        }
        None => AllowOrigin::any(),
    };
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_handler))
        .route("/api/users/me", get(current_user))
        .route("/api/users/me/dm-settings", put(update_dm_settings))
        .route("/api/users/me/profile", put(update_profile))
        .route(
            "/api/users/me/image",
            post(add_profile_image).delete(remove_profile_image),
        )
        .route("/api/contacts", get(all_contacts))
        .route("/api/contacts/search", post(search_contacts))
        .route("/api/contacts/recent", get(recent_contacts))
        .route("/api/channels", post(create_channel).get(list_channels))
        .route("/api/channels/join/{token}", post(join_channel))
        .route("/api/channels/{id}/members", post(add_channel_members))
        .route("/api/channels/{id}/pin", put(pin_message))
        .route("/api/channels/{id}/messages", get(channel_messages))
        .route("/api/messages/direct/{user_id}", get(direct_messages))
        .route(
            "/api/messages/{id}",
            patch(edit_message).delete(delete_message),
        )
        .route("/api/uploads", post(upload_file))
        .route("/api/uploads/{id}/{name}", get(download_file))
        .route("/api/webhooks/identity", post(identity_webhook))
        .route("/admin/status", get(admin_status))
        .layer(DefaultBodyLimit::max(state.config.max_upload_size))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    connected: usize,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    connected: usize,
    persistent: bool,
    uptime_secs: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserResponse {
    #[serde(flatten)]
    profile: UserProfile,
    profile_setup: bool,
    allow_direct_messages: bool,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            profile: user.profile(),
            profile_setup: user.profile_setup,
            allow_direct_messages: user.allow_direct_messages,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRequest {
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    color: Option<i64>,
}

#[derive(Serialize)]
struct ImageResponse {
    image: Option<String>,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Serialize)]
struct ContactsResponse<T> {
    contacts: Vec<T>,
}

/// Entry for a contact picker.
#[derive(Serialize)]
struct ContactOption {
    label: String,
    value: UserId,
    image: Option<String>,
    color: Option<i64>,
}

impl From<&User> for ContactOption {
    fn from(user: &User) -> Self {
        let name = user.display_name();
        let label = if name == user.email {
            name
        } else {
            format!("{name} ({})", user.email)
        };
        Self {
            label,
            value: user.id,
            image: user.image.clone(),
            color: user.color,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecentContact {
    #[serde(flatten)]
    profile: UserProfile,
    last_message_time: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    #[serde(default)]
    search_term: Option<String>,
}

#[derive(Deserialize)]
struct CreateChannelRequest {
    name: String,
    #[serde(default)]
    members: Vec<UserId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMembersRequest {
    member_ids: Vec<UserId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PinRequest {
    #[serde(default)]
    message_id: Option<MessageId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditRequest {
    new_content: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        connected: state.registry.len(),
    })
}

// ─── Users ───

async fn current_user(AuthUser(user): AuthUser) -> Json<UserResponse> {
    Json(UserResponse::from(&user))
}

async fn update_dm_settings(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<UserResponse>, ServerError> {
    let allow = body
        .get("allowDms")
        .or_else(|| body.get("allowDMs"))
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| ServerError::BadRequest("allowDms must be a boolean".into()))?;

    let updated = state.store.set_allow_direct_messages(user.id, allow).await?;
    info!(user = %user.id, allow, "Direct message setting updated");
    Ok(Json(UserResponse::from(&updated)))
}

async fn update_profile(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<ProfileRequest>,
) -> Result<Json<UserResponse>, ServerError> {
    let required = |value: Option<String>| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let (Some(first_name), Some(last_name)) = (required(req.first_name), required(req.last_name))
    else {
        return Err(ServerError::BadRequest(
            "first name and last name are required".into(),
        ));
    };

    let updated = state
        .store
        .update_profile(
            user.id,
            ProfileUpdate {
                first_name,
                last_name,
                color: req.color,
            },
        )
        .await?;
    info!(user = %user.id, "Profile updated");
    Ok(Json(UserResponse::from(&updated)))
}

async fn add_profile_image(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    mut multipart: Multipart,
) -> Result<Json<ImageResponse>, ServerError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("profile-image") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("profile").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

        let stored = state.uploads.store(&file_name, &data).await?;
        let updated = state
            .store
            .set_user_image(user.id, Some(stored.file_url))
            .await?;
        if let Some(previous) = &user.image {
            discard_image(&state, previous).await;
        }
        info!(user = %user.id, size = stored.size, "Profile image updated");
        return Ok(Json(ImageResponse {
            image: updated.image,
        }));
    }

    Err(ServerError::BadRequest(
        "Missing 'profile-image' field in multipart form".to_string(),
    ))
}

async fn remove_profile_image(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<MessageResponse>, ServerError> {
    state.store.set_user_image(user.id, None).await?;
    if let Some(previous) = &user.image {
        discard_image(&state, previous).await;
    }
    info!(user = %user.id, "Profile image removed");
    Ok(Json(MessageResponse {
        message: "Profile image removed",
    }))
}

/// Best effort: the user record no longer points at the file.
async fn discard_image(state: &AppState, url: &str) {
    if let Err(e) = state.uploads.remove_by_url(url).await {
        warn!(url, error = %e, "Failed to delete old profile image");
    }
}

// ─── Contacts ───

async fn all_contacts(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<ContactsResponse<ContactOption>>, ServerError> {
    let users = state.store.list_users(user.id).await?;
    Ok(Json(ContactsResponse {
        contacts: users.iter().map(ContactOption::from).collect(),
    }))
}

async fn search_contacts(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<SearchRequest>,
) -> Result<Json<ContactsResponse<UserProfile>>, ServerError> {
    let term = req
        .search_term
        .ok_or_else(|| ServerError::BadRequest("searchTerm is required".into()))?;
    let users = state.store.search_users(user.id, &term).await?;
    Ok(Json(ContactsResponse {
        contacts: users.iter().map(User::profile).collect(),
    }))
}

/// Direct-message partners, most recent conversation first. Partners whose
/// record was deleted are left out.
async fn recent_contacts(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<ContactsResponse<RecentContact>>, ServerError> {
    let recent = state.store.direct_contacts(user.id).await?;
    let ids: Vec<UserId> = recent.iter().map(|c| c.user).collect();
    let users: HashMap<UserId, User> = state
        .store
        .users_by_ids(&ids)
        .await?
        .into_iter()
        .map(|u| (u.id, u))
        .collect();

    let contacts = recent
        .iter()
        .filter_map(|c| {
            users.get(&c.user).map(|u| RecentContact {
                profile: u.profile(),
                last_message_time: c.last_message_time,
            })
        })
        .collect();
    Ok(Json(ContactsResponse { contacts }))
}

// ─── Channels ───

async fn create_channel(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateChannelRequest>,
) -> Result<(StatusCode, Json<ChannelView>), ServerError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ServerError::BadRequest("channel name is required".into()));
    }

    let mut members = req.members;
    members.retain(|m| *m != user.id);
    members.sort();
    members.dedup();
    let known = state.store.users_by_ids(&members).await?;
    if known.len() != members.len() {
        return Err(ServerError::BadRequest("some member ids are not valid users".into()));
    }

    let channel = state
        .store
        .create_channel(NewChannel {
            name: name.to_string(),
            admin: user.id,
            members,
        })
        .await?;
    info!(channel = %channel.id, admin = %user.id, members = channel.members.len(), "Channel created");

    let view = state.fanout.views().channel(&channel).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_channels(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<ChannelView>>, ServerError> {
    let channels = state.store.channels_for_user(user.id).await?;
    let mut views = Vec::with_capacity(channels.len());
    for channel in &channels {
        views.push(state.fanout.views().channel(channel).await?);
    }
    Ok(Json(views))
}

async fn join_channel(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(token): Path<String>,
) -> Result<Json<ChannelView>, ServerError> {
    let channel = state.fanout.join(user.id, &token).await?;
    Ok(Json(state.fanout.views().channel(&channel).await?))
}

async fn add_channel_members(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<ChannelId>,
    Json(req): Json<AddMembersRequest>,
) -> Result<Json<ChannelView>, ServerError> {
    let channel = state.fanout.add_members(user.id, id, &req.member_ids).await?;
    Ok(Json(state.fanout.views().channel(&channel).await?))
}

async fn pin_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<ChannelId>,
    Json(req): Json<PinRequest>,
) -> Result<Json<ChannelView>, ServerError> {
    let channel = state.fanout.pin_message(user.id, id, req.message_id).await?;
    Ok(Json(state.fanout.views().channel(&channel).await?))
}

async fn channel_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<ChannelId>,
) -> Result<Json<Vec<MessageView>>, ServerError> {
    let channel = state
        .store
        .find_channel(id)
        .await?
        .ok_or_else(|| ServerError::NotFound("Channel".into()))?;
    if !channel.is_member(&user.id) {
        return Err(ServerError::Forbidden("not a member of this channel".into()));
    }

    let messages = state.store.channel_messages(id).await?;
    Ok(Json(state.fanout.views().messages(&messages).await?))
}

// ─── Messages ───

async fn direct_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(other): Path<UserId>,
) -> Result<Json<Vec<MessageView>>, ServerError> {
    let messages = state.store.direct_history(user.id, other).await?;
    Ok(Json(state.fanout.views().messages(&messages).await?))
}

async fn edit_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<MessageId>,
    Json(req): Json<EditRequest>,
) -> Result<Json<MessageView>, ServerError> {
    let message = state.fanout.edit_message(user.id, id, &req.new_content).await?;
    Ok(Json(state.fanout.views().message(&message).await?))
}

async fn delete_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<MessageId>,
) -> Result<Json<MessageView>, ServerError> {
    let message = state.fanout.delete_message(user.id, id).await?;
    Ok(Json(state.fanout.views().message(&message).await?))
}

// ─── Uploads ───

async fn upload_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    mut multipart: Multipart,
) -> Result<Json<StoredUpload>, ServerError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("file").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

        let stored = state.uploads.store(&file_name, &data).await?;
        info!(id = %stored.id, user = %user.id, size = stored.size, "File uploaded");
        return Ok(Json(stored));
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn download_file(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((id, name)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ServerError> {
    let data = state.uploads.read(id, &name).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data))
}

// ─── Admin ───

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        connected: state.registry.len(),
        persistent: state.config.database_path.is_some(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::SendOutcome;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use parley_shared::protocol::MessageBody;
    use parley_shared::token::AccessToken;
    use parley_store::{MemoryStore, UserUpsert};
    use rand::rngs::OsRng;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        state: AppState,
        provider: SigningKey,
        _uploads: TempDir,
    }

    impl TestApp {
        async fn new(admin_token: Option<&str>) -> Self {
            let provider = SigningKey::generate(&mut OsRng);
            let dir = TempDir::new().unwrap();
            let config = ServerConfig {
                identity_provider_pubkey: provider.verifying_key().to_bytes(),
                upload_path: dir.path().to_path_buf(),
                admin_token: admin_token.map(str::to_string),
                ..ServerConfig::default()
            };
            let uploads = UploadStore::new(config.upload_path.clone(), config.max_upload_size)
                .await
                .unwrap();
            let state = AppState::new(config, Arc::new(MemoryStore::new()), uploads);
            Self {
                state,
                provider,
                _uploads: dir,
            }
        }

        async fn user(&self, external_id: &str) -> (User, String) {
            let user = self
                .state
                .store
                .upsert_user(UserUpsert {
                    external_id: external_id.into(),
                    email: format!("{external_id}@example.com"),
                    first_name: Some(external_id.into()),
                    last_name: None,
                    image: None,
                })
                .await
                .unwrap();
            let token = AccessToken::create(external_id, Duration::hours(1), &self.provider);
            (user, token.encode())
        }

        async fn request(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
            }
            let body = match body {
                Some(json) => {
                    builder = builder.header(header::CONTENT_TYPE, "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };

            self.send(builder.body(body).unwrap()).await
        }

        /// POST a single-file multipart form.
        async fn upload(
            &self,
            uri: &str,
            token: &str,
            field: &str,
            file_name: &str,
            data: &[u8],
        ) -> (StatusCode, Value) {
            let boundary = "parley-test-boundary";
            let mut body = format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .into_bytes();
            body.extend_from_slice(data);
            body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

            let request = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap();
            self.send(request).await
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = build_router(self.state.clone())
                .oneshot(request)
                .await
                .unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, value)
        }
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = TestApp::new(None).await;
        let (status, body) = app.request(Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_routes_require_credential() {
        let app = TestApp::new(None).await;
        let (status, _) = app.request(Method::GET, "/api/users/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = app
            .request(Method::GET, "/api/users/me", Some("garbage"), None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unsynced_identity_is_not_found() {
        let app = TestApp::new(None).await;
        let token = AccessToken::create("ghost", Duration::hours(1), &app.provider).encode();
        let (status, _) = app
            .request(Method::GET, "/api/users/me", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dm_settings_validation() {
        let app = TestApp::new(None).await;
        let (_, token) = app.user("alice").await;

        let (status, _) = app
            .request(
                Method::PUT,
                "/api/users/me/dm-settings",
                Some(&token),
                Some(json!({ "allowDms": "no" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .request(
                Method::PUT,
                "/api/users/me/dm-settings",
                Some(&token),
                Some(json!({ "allowDms": false })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowDirectMessages"], false);
    }

    #[tokio::test]
    async fn test_channel_lifecycle() {
        let app = TestApp::new(None).await;
        let (_admin, admin_token) = app.user("admin").await;
        let (member, member_token) = app.user("member").await;
        let (outsider, outsider_token) = app.user("outsider").await;

        let (status, _) = app
            .request(
                Method::POST,
                "/api/channels",
                Some(&admin_token),
                Some(json!({ "name": "general", "members": [UserId::new()] })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, channel) = app
            .request(
                Method::POST,
                "/api/channels",
                Some(&admin_token),
                Some(json!({ "name": "general", "members": [member.id] })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let channel_id = channel["id"].as_str().unwrap().to_string();
        let join_token = channel["joinToken"].as_str().unwrap().to_string();

        let (_, listed) = app
            .request(Method::GET, "/api/channels", Some(&member_token), None)
            .await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let history = format!("/api/channels/{channel_id}/messages");
        let (status, _) = app
            .request(Method::GET, &history, Some(&outsider_token), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, joined) = app
            .request(
                Method::POST,
                &format!("/api/channels/join/{join_token}"),
                Some(&outsider_token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let member_ids: Vec<&str> = joined["members"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|m| m["id"].as_str())
            .collect();
        assert!(member_ids.contains(&outsider.id.to_string().as_str()));

        let (status, _) = app
            .request(Method::GET, &history, Some(&outsider_token), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = app
            .request(
                Method::PUT,
                &format!("/api/channels/{channel_id}/pin"),
                Some(&member_token),
                Some(json!({ "messageId": null })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_profile_update() {
        let app = TestApp::new(None).await;
        let (_, token) = app.user("ada").await;

        let (status, _) = app
            .request(
                Method::PUT,
                "/api/users/me/profile",
                Some(&token),
                Some(json!({ "firstName": "Ada", "lastName": "  " })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .request(
                Method::PUT,
                "/api/users/me/profile",
                Some(&token),
                Some(json!({ "firstName": "Ada", "lastName": "Lovelace", "color": 3 })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lastName"], "Lovelace");
        assert_eq!(body["color"], 3);
        assert_eq!(body["profileSetup"], true);
    }

    #[tokio::test]
    async fn test_contacts() {
        let app = TestApp::new(None).await;
        let (me, token) = app.user("me").await;
        let (ada, _) = app.user("ada").await;
        let (bob, _) = app.user("bob").await;

        let (status, all) = app
            .request(Method::GET, "/api/contacts", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let all = all["contacts"].as_array().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|c| c["value"] != json!(me.id)));
        assert!(all.iter().any(|c| c["label"] == "ada (ada@example.com)"));

        let (status, found) = app
            .request(
                Method::POST,
                "/api/contacts/search",
                Some(&token),
                Some(json!({ "searchTerm": "ADA@" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found["contacts"], json!([ada.profile()]));

        let (status, _) = app
            .request(Method::POST, "/api/contacts/search", Some(&token), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let text = |s: &str| MessageBody::Text(s.into());
        app.state.fanout.send_direct(bob.id, me.id, text("1"), None).await.unwrap();
        app.state.fanout.send_direct(me.id, ada.id, text("2"), None).await.unwrap();

        let (_, recent) = app
            .request(Method::GET, "/api/contacts/recent", Some(&token), None)
            .await;
        let ids: Vec<&Value> = recent["contacts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| &c["id"])
            .collect();
        assert_eq!(ids, vec![&json!(ada.id), &json!(bob.id)]);
        assert!(recent["contacts"][0]["lastMessageTime"].is_string());

        app.state.store.delete_user_by_external_id("bob").await.unwrap();
        let (_, recent) = app
            .request(Method::GET, "/api/contacts/recent", Some(&token), None)
            .await;
        assert_eq!(recent["contacts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_profile_image_lifecycle() {
        let app = TestApp::new(None).await;
        let (_, token) = app.user("ada").await;

        let (status, _) = app
            .upload("/api/users/me/image", &token, "file", "me.png", b"png")
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .upload("/api/users/me/image", &token, "profile-image", "me.png", b"png")
            .await;
        assert_eq!(status, StatusCode::OK);
        let url = body["image"].as_str().unwrap().to_string();
        assert!(url.starts_with("/api/uploads/"));

        let (status, _) = app.request(Method::GET, &url, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = app
            .request(Method::DELETE, "/api/users/me/image", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (_, me) = app.request(Method::GET, "/api/users/me", Some(&token), None).await;
        assert!(me["image"].is_null());
        let (status, _) = app.request(Method::GET, &url, Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_edit_and_double_delete() {
        let app = TestApp::new(None).await;
        let (alice, alice_token) = app.user("alice").await;
        let (bob, bob_token) = app.user("bob").await;

        let SendOutcome::Sent { message, .. } = app
            .state
            .fanout
            .send_direct(alice.id, bob.id, MessageBody::Text("hi".into()), None)
            .await
            .unwrap()
        else {
            panic!("expected the message to be sent");
        };
        let uri = format!("/api/messages/{}", message.id);

        let (status, _) = app
            .request(
                Method::PATCH,
                &uri,
                Some(&bob_token),
                Some(json!({ "newContent": "hijacked" })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .request(
                Method::PATCH,
                &uri,
                Some(&alice_token),
                Some(json!({ "newContent": "" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, edited) = app
            .request(
                Method::PATCH,
                &uri,
                Some(&alice_token),
                Some(json!({ "newContent": "hello" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(edited["content"], "hello");
        assert_eq!(edited["isEdited"], true);

        let (status, _) = app.request(Method::DELETE, &uri, Some(&alice_token), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.request(Method::DELETE, &uri, Some(&alice_token), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, history) = app
            .request(
                Method::GET,
                &format!("/api/messages/direct/{}", alice.id),
                Some(&bob_token),
                None,
            )
            .await;
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["isDeleted"], true);
    }

    #[tokio::test]
    async fn test_identity_webhook_signature() {
        use ed25519_dalek::Signer;

        let app = TestApp::new(None).await;
        let payload = json!({
            "type": "user.created",
            "data": {
                "id": "user_2abc",
                "email_addresses": [{ "id": "em_1", "email_address": "ada@example.com" }],
                "primary_email_address_id": "em_1",
                "first_name": "Ada"
            }
        })
        .to_string();

        let send = |signature: String| {
            let request = Request::builder()
                .method(Method::POST)
                .uri("/api/webhooks/identity")
                .header(header::CONTENT_TYPE, "application/json")
                .header(crate::webhook::SIGNATURE_HEADER, signature)
                .body(Body::from(payload.clone()))
                .unwrap();
            build_router(app.state.clone()).oneshot(request)
        };

        let forged = SigningKey::generate(&mut OsRng).sign(payload.as_bytes());
        let response = send(hex::encode(forged.to_bytes())).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(app
            .state
            .store
            .find_user_by_external_id("user_2abc")
            .await
            .unwrap()
            .is_none());

        let signature = app.provider.sign(payload.as_bytes());
        let response = send(hex::encode(signature.to_bytes())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let user = app
            .state
            .store
            .find_user_by_external_id("user_2abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.email, "ada@example.com");
    }

    #[tokio::test]
    async fn test_admin_status_requires_token() {
        let app = TestApp::new(Some("s3cret")).await;
        let (status, _) = app.request(Method::GET, "/admin/status", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .request(Method::GET, "/admin/status", Some("s3cret"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Parley");
        assert_eq!(body["connected"], 0);
    }
}
