use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cloudplay_protocol::{CloudplayConfig, ErrorResponse, NewGameResponse};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

use crate::broker::{Broker, BrokerError};
use crate::signaling;

/// Shared application state.
pub struct AppState {
    pub config: CloudplayConfig,
    pub broker: Arc<Broker>,
    pub started_at: Instant,
}

impl AppState {
    fn answer_timeout(&self) -> Option<Duration> {
        match self.config.signaling.answer_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// JSON error body with a status code.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        let status = match &err {
            BrokerError::InvalidArgument(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BrokerError::MetadataNotFound(_) => StatusCode::NOT_FOUND,
            _ => {
                tracing::error!("New game failed: {err}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

/// Build the player-facing Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/newgame", post(new_game_without_id))
        .route("/newgame/", post(new_game_without_id))
        .route("/newgame/{game_id}", post(new_game))
        .route("/signaling", get(signaling_ws_upgrade))
        .route("/healthz", get(health_check))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .with_state(Arc::clone(&state));

    if state.config.server.cors_allow_any_origin {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    }
}

/// Wrap a router with per-request tracing spans keyed by `x-request-id`.
pub fn with_request_tracing(router: Router) -> Router {
    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::DEBUG, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>, latency: Duration, _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// POST /newgame/:game_id - allocate a host and create a session
async fn new_game(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> Result<Json<NewGameResponse>, ApiError> {
    let session = state.broker.new_game(&game_id).await?;
    Ok(Json(NewGameResponse {
        session_id: session.id,
    }))
}

async fn new_game_without_id() -> ApiError {
    ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "game id must not be empty")
}

/// GET /signaling - player WebSocket for offer/answer/candidate exchange
async fn signaling_ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let broker = Arc::clone(&state.broker);
    let answer_timeout = state.answer_timeout();
    ws.max_message_size(65_536) // 64KB max for signaling messages
        .on_upgrade(move |socket| signaling::handle_player_ws(socket, broker, answer_timeout))
}

/// GET /healthz - liveness plus session and channel counts
async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let sessions = match state.broker.list_sessions().await {
        Ok(s) => s.len(),
        Err(e) => {
            tracing::error!("Health check failed: {e}");
            return ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": sessions,
        "channels": state.broker.channels().len().await,
    }))
    .into_response()
}
