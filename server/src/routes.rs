//! HTTP route handlers for the Chatter server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /ws` - WebSocket chat endpoint
//! - `GET /health` - Health check endpoint
//! - `GET /members` - Identities currently connected
//! - `GET /messages` - Recent chat history
//! - `GET /images/*` - Avatar images
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - A [`HubHandle`] for talking to the hub task
//! - The [`Authenticator`] that resolves WebSocket requests to identities
//! - The optional [`MessageStore`] backing `/messages`
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use chatter_server::config::Config;
//! use chatter_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let (state, _tasks) = AppState::new(config).expect("failed to start hub");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:5050").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, Query, State, WebSocketUpgrade},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{Authenticator, ConnectRequest, GuestAuthenticator, Roster, TokenAuthenticator};
use crate::config::{Config, ConfigError};
use crate::connection;
use crate::error::ServerError;
use crate::hub::{Hub, HubError, HubHandle};
use crate::store::{spawn_archiver, MemoryStore, MessageStore, DEFAULT_ARCHIVE_BACKLOG};
use crate::types::{Identity, Message};

// ============================================================================
// Constants
// ============================================================================

/// Messages returned by `/messages` when no limit is given.
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Upper bound on the `/messages` limit.
const MAX_HISTORY_LIMIT: usize = 500;

/// How long shutdown waits for the archiver to drain its backlog.
const ARCHIVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// Cloned for each request handler; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Handle to the hub task.
    pub hub: HubHandle,

    /// Resolves WebSocket requests to identities.
    pub authenticator: Arc<dyn Authenticator>,

    /// Chat history, if persistence is enabled.
    pub store: Option<Arc<dyn MessageStore>>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

/// Tasks spawned alongside the application state.
#[derive(Debug)]
pub struct BackgroundTasks {
    hub: JoinHandle<()>,
    archiver: Option<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Stops the hub, then gives the archiver a bounded amount of time to
    /// persist what it already accepted.
    pub async fn shutdown(self) {
        self.hub.abort();
        let _ = self.hub.await;
        info!("Hub task stopped");

        if let Some(archiver) = self.archiver {
            // The hub held the last archiver handle, so the task is draining.
            if tokio::time::timeout(ARCHIVER_DRAIN_TIMEOUT, archiver)
                .await
                .is_err()
            {
                warn!(
                    timeout_secs = ARCHIVER_DRAIN_TIMEOUT.as_secs(),
                    "Archiver did not drain in time"
                );
            }
        }
    }
}

impl AppState {
    /// Creates the application state and spawns the hub (and, when history
    /// is enabled, the archiver).
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] if the authenticator cannot be built from the
    /// configuration.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use chatter_server::routes::AppState;
    /// use chatter_server::config::Config;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let config = Config::from_env().expect("failed to load config");
    /// let (state, tasks) = AppState::new(config).expect("failed to build state");
    /// # }
    /// ```
    pub fn new(config: Config) -> Result<(Self, BackgroundTasks), ServerError> {
        let authenticator = build_authenticator(&config)?;

        let (store, archiver, archiver_task) = if config.persistence_enabled() {
            let store = Arc::new(MemoryStore::new(config.history_capacity));
            let (archiver, task) = spawn_archiver(store.clone(), DEFAULT_ARCHIVE_BACKLOG);
            (
                Some(store as Arc<dyn MessageStore>),
                Some(archiver),
                Some(task),
            )
        } else {
            info!("Chat history disabled");
            (None, None, None)
        };

        let (hub, hub_task) = Hub::spawn(config.hub_capacity, archiver);

        let state = Self::with_components(config, hub, authenticator, store);
        let tasks = BackgroundTasks {
            hub: hub_task,
            archiver: archiver_task,
        };
        Ok((state, tasks))
    }

    /// Creates application state around an already running hub.
    ///
    /// Useful for testing or when the hub is owned elsewhere.
    #[must_use]
    pub fn with_components(
        config: Config,
        hub: HubHandle,
        authenticator: Arc<dyn Authenticator>,
        store: Option<Arc<dyn MessageStore>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            hub,
            authenticator,
            store,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("hub", &self.hub)
            .field("authenticator", &"<Authenticator>")
            .field("store", &self.store.as_ref().map(|_| "<MessageStore>"))
            .field("start_time", &self.start_time)
            .finish()
    }
}

/// Picks the authenticator for the configured mode.
fn build_authenticator(config: &Config) -> Result<Arc<dyn Authenticator>, ServerError> {
    if config.unsafe_no_auth {
        let roster = Roster::load(&config.avatar_dir);
        info!(entries = roster.len(), "Accepting guests");
        return Ok(Arc::new(GuestAuthenticator::new(roster)));
    }

    let key = config.identity_public_key.as_deref().ok_or_else(|| {
        ConfigError::MissingEnvVar("CHATTER_IDENTITY_PUBLIC_KEY".to_string())
    })?;
    Ok(Arc::new(TokenAuthenticator::from_base64(key)?))
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// # Returns
///
/// An axum `Router` with the following routes:
/// - `GET /ws` - WebSocket chat endpoint
/// - `GET /health` - Health check endpoint
/// - `GET /members` - Connected identities
/// - `GET /messages` - Recent chat history
/// - `GET /images/*` - Static avatar files
pub fn create_router(state: AppState) -> Router {
    let avatars = ServeDir::new(&state.config.avatar_dir);
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .route("/members", get(get_members))
        .route("/messages", get(get_messages))
        .nest_service("/images", avatars)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Builds the CORS layer. An empty origin list allows any origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any);

    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

fn hub_unavailable(err: HubError) -> Response {
    error!(error = %err, "Hub unavailable");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse::new(err.to_string()).with_code("hub_unavailable")),
    )
        .into_response()
}

// ============================================================================
// GET /ws - WebSocket Chat
// ============================================================================

/// Query parameters for WebSocket connections.
#[derive(Debug, Deserialize)]
pub struct WsQueryParams {
    /// Identity token (required unless guests are accepted).
    pub token: Option<String>,
}

impl WsQueryParams {
    /// Converts the query into what an authenticator sees. An empty token
    /// counts as absent.
    fn into_request(self) -> ConnectRequest {
        ConnectRequest {
            token: self.token.filter(|token| !token.is_empty()),
        }
    }
}

/// GET /ws - WebSocket chat endpoint.
///
/// The request is authenticated before the upgrade; on success the socket
/// is handed to [`connection::serve`].
///
/// # Query Parameters
///
/// - `token` - Identity token (ignored when guests are accepted)
///
/// # Responses
///
/// - `101 Switching Protocols` - WebSocket upgrade successful
/// - `401 Unauthorized` - Missing, invalid or expired token
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match state.authenticator.authenticate(&params.into_request()) {
        Ok(identity) => identity,
        Err(err) if err.is_server_error() => {
            error!(error = %err, "Authenticator misconfigured");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("server configuration error").with_code(err.code())),
            )
                .into_response();
        }
        Err(err) => {
            debug!(error = %err, "Rejected WebSocket connection");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new(err.to_string()).with_code(err.code())),
            )
                .into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(user_id = %identity.id, name = %identity.name, "WebSocket client connecting");

    let hub = state.hub.clone();
    let queue_capacity = state.config.queue_capacity;
    ws.on_upgrade(move |socket| connection::serve(socket, identity, hub, queue_capacity))
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"ok"` while the hub is running.
    pub status: String,

    /// Number of registered WebSocket connections.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// # Response
///
/// ```json
/// {
///   "status": "ok",
///   "connections": 42,
///   "uptime_seconds": 3600
/// }
/// ```
///
/// Returns `503` with status `"unavailable"` if the hub has stopped.
async fn get_health(State(state): State<AppState>) -> Response {
    let uptime_seconds = state.start_time.elapsed().as_secs();

    match state.hub.connection_count().await {
        Ok(connections) => Json(HealthResponse {
            status: "ok".to_string(),
            connections,
            uptime_seconds,
        })
        .into_response(),
        Err(err) => {
            error!(error = %err, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable".to_string(),
                    connections: 0,
                    uptime_seconds,
                }),
            )
                .into_response()
        }
    }
}

// ============================================================================
// GET /members - Connected Identities
// ============================================================================

/// Response body for the members endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct MembersResponse {
    /// Registered identities, sorted by id.
    pub members: Vec<Identity>,
}

async fn get_members(State(state): State<AppState>) -> Response {
    match state.hub.members().await {
        Ok(members) => Json(MembersResponse { members }).into_response(),
        Err(err) => hub_unavailable(err),
    }
}

// ============================================================================
// GET /messages - Chat History
// ============================================================================

/// Query parameters for the history endpoint.
#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    /// Number of messages to return (default 50, capped at 500).
    pub limit: Option<usize>,
}

impl MessagesQuery {
    fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .min(MAX_HISTORY_LIMIT)
    }
}

/// Response body for the history endpoint.
#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    /// Messages in wire format, oldest first.
    pub messages: Vec<Message>,
}

/// GET /messages - Recent chat messages.
///
/// # Responses
///
/// - `200 OK` - `{"messages": [...]}`, oldest first
/// - `503 Service Unavailable` - History is disabled or the store failed
async fn get_messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    let Some(store) = &state.store else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("chat history is disabled").with_code("history_disabled")),
        )
            .into_response();
    };

    match store.recent(query.limit()).await {
        Ok(messages) => Json(MessagesResponse { messages }).into_response(),
        Err(err) => {
            warn!(error = %err, "Failed to load chat history");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new(err.to_string()).with_code("store_unavailable")),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
