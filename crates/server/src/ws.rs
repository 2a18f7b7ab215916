use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use talkwire_protocol::{ClientEvent, IceServerInfo, ServerEvent, TalkwireConfig};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth;
use crate::coordinator::Coordinator;
use crate::presence::PresenceDirectory;

/// Shared application state.
pub struct AppState {
    pub config: TalkwireConfig,
    pub presence: PresenceDirectory,
    pub coordinator: Coordinator,
    pub jwt_secret: String,
    pub started_at: std::time::Instant,
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/health", get(health_check))
        .route("/api/ice-config", get(ice_config))
        .route("/api/calls", get(call_history))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
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
            }),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(axum::middleware::from_fn(security_headers))
        .with_state(state)
}

/// Query parameters for WebSocket upgrade
#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Extract and validate JWT from Authorization header or query parameter.
/// Prefers the Authorization header (Bearer token) when available.
fn extract_claims_from_headers(
    headers: &HeaderMap,
    query: &WsQuery,
    jwt_secret: &str,
) -> Result<auth::Claims, (StatusCode, String)> {
    // Try Authorization: Bearer <token> header first
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        // Fall back to query parameter
        .or(query.token.as_deref())
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "Missing token".to_string()))?;

    auth::validate_jwt(token, jwt_secret).map_err(|e| {
        tracing::warn!("Invalid JWT: {e}");
        (
            StatusCode::UNAUTHORIZED,
            "Invalid or expired token".to_string(),
        )
    })
}

/// GET /ws - WebSocket upgrade for the signaling connection (requires JWT).
/// The authenticated subject becomes the connection's user identity; the
/// client never supplies its own id.
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let claims = match extract_claims_from_headers(&headers, &query, &state.jwt_secret) {
        Ok(c) => c,
        Err((status, msg)) => return (status, msg).into_response(),
    };

    tracing::info!(user = %claims.sub, "WebSocket upgrade");
    let max_message_size = state.config.call.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_connection(socket, claims.sub, state))
        .into_response()
}

/// Per-connection loop: register in the presence directory, pump events in
/// both directions, and unregister (with disconnect cascade) on the way out.
async fn handle_connection(mut socket: WebSocket, user_id: String, state: Arc<AppState>) {
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerEvent>();

    let first = state.presence.register(&user_id, conn_id, tx.clone()).await;
    if first {
        state.coordinator.handle_connect(&user_id).await;
    }
    tracing::info!(%user_id, %conn_id, first, "Signaling connection established");

    loop {
        tokio::select! {
            // Outbound: events routed to this connection
            outbound = rx.recv() => {
                let Some(event) = outbound else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!(%user_id, "Failed to serialize event: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    tracing::debug!(%user_id, %conn_id, "WebSocket send failed");
                    break;
                }
            }
            // Inbound: signaling events from this client
            inbound = socket.recv() => {
                let Some(result) = inbound else { break };
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                state.coordinator.handle_event(&user_id, event, &tx).await;
                            }
                            Err(e) => {
                                tracing::warn!(%user_id, "Invalid message: {e}");
                                let err = ServerEvent::Error {
                                    message: format!("Invalid message format: {e}"),
                                };
                                let json = serde_json::to_string(&err).unwrap_or_default();
                                let _ = socket.send(Message::Text(json.into())).await;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::debug!(%user_id, %conn_id, "WebSocket closed by client");
                        break;
                    }
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => {}
                    Err(e) => {
                        tracing::debug!(%user_id, %conn_id, "WebSocket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    let went_offline = state.presence.unregister(&user_id, conn_id).await;
    tracing::info!(%user_id, %conn_id, went_offline, "Signaling connection closed");
    if went_offline {
        state.coordinator.handle_disconnect(&user_id).await;
    }
}

/// GET /api/health - health check (no auth, minimal info for load balancers)
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /api/ice-config - return ICE/TURN server configuration (requires JWT)
async fn ice_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if let Err((status, msg)) = extract_claims_from_headers(&headers, &query, &state.jwt_secret) {
        return (status, Json(json!({ "error": msg }))).into_response();
    }

    let ice = &state.config.ice;
    let mut servers = Vec::new();

    if !ice.stun_urls.is_empty() {
        servers.push(IceServerInfo {
            urls: ice.stun_urls.clone(),
            username: None,
            credential: None,
        });
    }

    if !ice.turn_urls.is_empty() {
        servers.push(IceServerInfo {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone(),
            credential: ice.turn_credential.clone(),
        });
    }

    Json(json!({ "ice_servers": servers })).into_response()
}

/// GET /api/calls - the authenticated user's call history, most recent first
/// (requires JWT, returns only calls the caller participated in)
async fn call_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let claims = match extract_claims_from_headers(&headers, &query, &state.jwt_secret) {
        Ok(c) => c,
        Err((status, msg)) => {
            return (status, Json(json!({ "error": msg }))).into_response();
        }
    };

    let calls = state
        .coordinator
        .registry()
        .calls_for_user(&claims.sub)
        .await;
    Json(calls).into_response()
}
