mod coordinator;
mod http;
mod llm;
mod marketplace;
mod metrics;
mod models;
mod security;
mod store;
mod sync;
mod textnorm;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use coordinator::{SyncCoordinator, SyncStatus};
use llm::{LlmClient, LlmConfig, LlmError, LlmMessage};
use marketplace::conversations::{
    self, Channel, MarketplaceClient, normalize_attachments, parse_marketplace_timestamp,
};
use marketplace::{MarketplaceError, auth, config as market_config};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, DraftRequest, DraftResponse, FlagRequest, FlagResponse, MessageResponse,
    SendRequest, SendResponse, SyncParams, ThreadDetail, ThreadListParams, ThreadSummary,
};
use security::{AuthContext, AuthState, require_api_auth};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use store::{MessageStore, NewMessage, SenderClass, StoreError, ThreadFilter};
use sync::{SellerIdentity, SyncConfig, SyncEngine, SyncError, SyncReport};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "sellerdesk.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();
    let store = MessageStore::connect(&database_url_from_env()).await?;
    let engine = SyncEngine::new(
        store.clone(),
        MarketplaceClient,
        SellerIdentity::from_env(),
        SyncConfig::from_env(),
    );
    let coordinator = Arc::new(SyncCoordinator::new(engine));
    let llm = Arc::new(LlmClient::new(LlmConfig::from_env()));
    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(serde_json::json!({"openapi": "3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre::eyre!("install prometheus recorder: {err}"))?;

    spawn_background_sync(coordinator.clone());

    let state = AppState {
        store,
        coordinator,
        llm,
        openapi: Arc::new(openapi),
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/messages/sync", post(sync_messages))
        .route("/messages/sync-status", get(sync_status))
        .route("/messages/threads", get(list_threads))
        .route("/messages/threads/{id}", get(get_thread))
        .route("/messages/threads/{id}/refresh", post(refresh_thread))
        .route("/messages/threads/{id}/mark-read", post(mark_thread_read))
        .route("/messages/threads/{id}/flag", patch(toggle_thread_flag))
        .route("/messages/threads/{id}/send", post(send_reply))
        .route("/messages/threads/{id}/draft", post(draft_reply))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "sellerdesk.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: MessageStore,
    coordinator: Arc<SyncCoordinator<MarketplaceClient>>,
    llm: Arc<LlmClient>,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

/// Periodic incremental sync driven by `SYNC_INTERVAL_MINUTES`; disabled when
/// unset. "Already running" ticks are skipped, not queued.
fn spawn_background_sync(coordinator: Arc<SyncCoordinator<MarketplaceClient>>) {
    let Some(minutes) = std::env::var("SYNC_INTERVAL_MINUTES")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
    else {
        return;
    };
    info!(
        target = "sellerdesk.sync",
        interval_minutes = minutes,
        "background sync enabled"
    );
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(minutes * 60));
        interval.tick().await;
        loop {
            interval.tick().await;
            match coordinator.sync(false).await {
                Ok(report) => info!(
                    target = "sellerdesk.sync",
                    threads = report.threads_synced + report.system_threads_synced,
                    messages = report.messages_synced + report.system_messages_synced,
                    "background sync done"
                ),
                Err(SyncError::AlreadyRunning) => {
                    debug!(target = "sellerdesk.sync", "background tick skipped")
                }
                Err(err) => warn!(target = "sellerdesk.sync", error = %err, "background sync failed"),
            }
        }
    });
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "sellerdesk-api-rs",
    }))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap_or_default();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap_or_default()
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::BadRequest("unauthorized".to_string()));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Sellerdesk API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap_or_default()
}

/// Run a message sync.
///
/// - Method: `POST`
/// - Path: `/messages/sync?full=bool`
/// - Auth: `Authorization: Bearer <key>` or `X-Sellerdesk-Key: <key>`
///
/// Idempotent and safe to call repeatedly; only one sync runs at a time and a
/// concurrent call receives 503.
async fn sync_messages(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(params): Query<SyncParams>,
) -> Result<Json<SyncReport>, AppError> {
    crate::metrics::inc_requests("/messages/sync");
    info!(
        target = "sellerdesk.api",
        account = %context.account_id,
        api_key = %context.api_key_id,
        full = params.full,
        "sync invoked",
    );
    let report = state.coordinator.sync(params.full).await?;
    Ok(Json(report))
}

/// Lightweight status for polling: last sync time, whether a sync is running,
/// and the total unread count.
async fn sync_status(State(state): State<AppState>) -> Result<Json<SyncStatus>, AppError> {
    let status = state.coordinator.status().await?;
    Ok(Json(status))
}

async fn list_threads(
    State(state): State<AppState>,
    Query(params): Query<ThreadListParams>,
) -> Result<Json<Vec<ThreadSummary>>, AppError> {
    crate::metrics::inc_requests("/messages/threads");
    let filter = match params.filter.as_deref() {
        Some("unread") => ThreadFilter::Unread,
        Some("flagged") => ThreadFilter::Flagged,
        _ => ThreadFilter::All,
    };
    let rows = state.store.list_threads(filter).await?;
    Ok(Json(rows.into_iter().map(ThreadSummary::from).collect()))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ThreadDetail>, AppError> {
    let thread = state
        .store
        .get_thread(&id)
        .await?
        .ok_or(AppError::NotFound("Thread not found"))?;
    let messages = state.store.thread_messages(&id).await?;
    Ok(Json(ThreadDetail {
        summary: ThreadSummary::from(thread),
        messages: messages.into_iter().map(MessageResponse::from).collect(),
    }))
}

/// Refetch messages for a single conversation and upsert. Use after a send
/// instead of a full sync.
async fn refresh_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    crate::metrics::inc_requests("/messages/threads/refresh");
    state
        .store
        .get_thread(&id)
        .await?
        .ok_or(AppError::NotFound("Thread not found"))?;
    state.coordinator.refresh_thread(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Mark a thread read on the marketplace and locally. The remote update is
/// best effort; local state converges either way.
async fn mark_thread_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .get_thread(&id)
        .await?
        .ok_or(AppError::NotFound("Thread not found"))?;
    match auth::get_user_access_token().await {
        Ok(token) => {
            if let Err(err) =
                conversations::update_conversation_read(&token, &id, Channel::Member, true).await
            {
                warn!(
                    target = "sellerdesk.api",
                    thread = %id,
                    error = %err,
                    "marketplace read-state update failed"
                );
            }
        }
        Err(err) => warn!(
            target = "sellerdesk.api",
            thread = %id,
            error = %err,
            "token unavailable for read-state update"
        ),
    }
    state.store.mark_thread_read(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_thread_flag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FlagRequest>,
) -> Result<Json<FlagResponse>, AppError> {
    let found = state.store.set_thread_flag(&id, body.is_flagged).await?;
    if !found {
        return Err(AppError::NotFound("Thread not found"));
    }
    Ok(Json(FlagResponse {
        thread_id: id,
        is_flagged: body.is_flagged,
    }))
}

/// Send a reply in the thread through the marketplace message API, then store
/// the seller message locally and refresh the thread rollup.
async fn send_reply(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SendRequest>,
) -> Result<Json<SendResponse>, AppError> {
    crate::metrics::inc_requests("/messages/threads/send");
    let content = body.content.trim().to_string();
    if content.is_empty() && body.attachments.is_empty() {
        return Err(AppError::BadRequest(
            "Provide message text and/or at least one attachment.".to_string(),
        ));
    }
    if content.chars().count() > 2000 {
        return Err(AppError::BadRequest(format!(
            "Message exceeds 2000 character limit ({} chars).",
            content.chars().count()
        )));
    }
    if body.attachments.len() > 5 {
        return Err(AppError::BadRequest(
            "At most 5 attachments per message.".to_string(),
        ));
    }
    for attachment in &body.attachments {
        let https = attachment
            .url
            .as_deref()
            .map(|url| url.trim().starts_with("https://"))
            .unwrap_or(false);
        if !https {
            return Err(AppError::BadRequest(
                "All attachment URLs must be HTTPS.".to_string(),
            ));
        }
    }

    let thread = state
        .store
        .get_thread(&id)
        .await?
        .ok_or(AppError::NotFound("Thread not found"))?;
    let token = auth::get_user_access_token().await?;

    // The marketplace requires a body even for attachment-only messages.
    let message_text = if content.is_empty() { " " } else { &content };
    let sent = conversations::send_message(
        &token,
        &id,
        message_text,
        thread.reference_item_id.as_deref(),
        &body.attachments,
    )
    .await?;

    let message_id = sent
        .message_id
        .clone()
        .unwrap_or_else(|| format!("sent-{}", Uuid::new_v4().simple()));
    let external_created_at =
        parse_marketplace_timestamp(sent.created_date.as_deref()).unwrap_or_else(chrono::Utc::now);
    let sender_name = if market_config::SELLER_USERNAME.is_empty() {
        sent.sender_username
            .clone()
            .unwrap_or_else(|| "seller".to_string())
    } else {
        market_config::SELLER_USERNAME.clone()
    };
    let attachments = if sent.message_media.is_empty() {
        body.attachments.clone()
    } else {
        normalize_attachments(&sent.message_media)
    };

    let row = NewMessage {
        message_id: message_id.clone(),
        thread_id: id.clone(),
        sender_class: SenderClass::Seller,
        sender_name: Some(sender_name),
        subject: None,
        content: if content.is_empty() {
            "(attachment)".to_string()
        } else {
            content
        },
        attachments,
        is_read: true,
        external_created_at,
    };
    let mut tx = state.store.begin().await?;
    MessageStore::insert_message(&mut tx, &row).await?;
    MessageStore::recompute_thread_rollup(&mut tx, &id).await?;
    tx.commit().await.map_err(StoreError::from)?;

    Ok(Json(SendResponse {
        success: true,
        message: format!("Message sent. ID: {message_id}"),
    }))
}

/// Generate an AI draft reply from the thread's linear history.
async fn draft_reply(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DraftRequest>,
) -> Result<Json<DraftResponse>, AppError> {
    crate::metrics::inc_requests("/messages/threads/draft");
    state
        .store
        .get_thread(&id)
        .await?
        .ok_or(AppError::NotFound("Thread not found"))?;
    let messages = state.store.thread_messages(&id).await?;
    if messages.is_empty() {
        return Err(AppError::BadRequest(
            "Thread has no messages to reply to.".to_string(),
        ));
    }

    let mut instruction = String::from(
        "Draft a reply to the latest customer message on behalf of the seller. \
         Be professional, helpful, and concise.",
    );
    if let Some(extra) = body
        .extra_instructions
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        instruction.push_str("\n\nAdditional instructions: ");
        instruction.push_str(extra);
    }

    let mut chat = vec![LlmMessage {
        role: "system".into(),
        content: instruction,
    }];
    for message in &messages {
        let role = if message.sender_class == "seller" {
            "assistant"
        } else {
            "user"
        };
        let mut content = String::new();
        if let Some(subject) = &message.subject {
            content.push_str(subject);
            content.push('\n');
        }
        content.push_str(&message.content);
        chat.push(LlmMessage {
            role: role.into(),
            content,
        });
    }

    let response = state.llm.chat(&chat).await?;
    Ok(Json(DraftResponse {
        draft: response.text,
    }))
}

#[derive(Debug)]
enum AppError {
    Sync(SyncError),
    Market(MarketplaceError),
    Store(StoreError),
    Llm(LlmError),
    NotFound(&'static str),
    BadRequest(String),
}

impl From<SyncError> for AppError {
    fn from(value: SyncError) -> Self {
        Self::Sync(value)
    }
}

impl From<MarketplaceError> for AppError {
    fn from(value: MarketplaceError) -> Self {
        Self::Market(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<LlmError> for AppError {
    fn from(value: LlmError) -> Self {
        Self::Llm(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::Sync(err) => {
                let status = match &err {
                    SyncError::NotConnected => StatusCode::BAD_REQUEST,
                    SyncError::Forbidden => StatusCode::FORBIDDEN,
                    SyncError::AlreadyRunning => StatusCode::SERVICE_UNAVAILABLE,
                    SyncError::Conflict => StatusCode::CONFLICT,
                    SyncError::Transport(_) => StatusCode::BAD_GATEWAY,
                    SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, "sync_failed", err.to_string())
            }
            AppError::Market(err) => {
                let status = match &err {
                    MarketplaceError::NotConnected => StatusCode::BAD_REQUEST,
                    MarketplaceError::Forbidden => StatusCode::FORBIDDEN,
                    _ => StatusCode::BAD_GATEWAY,
                };
                (status, "marketplace_error", err.to_string())
            }
            AppError::Store(err) => {
                let status = match &err {
                    StoreError::Conflict => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, "storage_error", err.to_string())
            }
            AppError::Llm(err) => (StatusCode::BAD_GATEWAY, "ai_provider_error", err.to_string()),
            AppError::NotFound(detail) => {
                (StatusCode::NOT_FOUND, "not_found", detail.to_string())
            }
            AppError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "invalid_request", detail),
        };
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

fn database_url_from_env() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://sellerdesk.db".to_string())
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}
