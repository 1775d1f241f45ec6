//! The small HTTP boundary the core consumes: challenge-token minting,
//! auth status, and the `GET /ssh` upgrade handler, plus the ambient
//! operational endpoints (`/api/health`, `/api/health/detailed`,
//! `/metrics`) every service in this codebase exposes alongside its
//! primary API.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Extension, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use gateway_protocol::{AuthStatusResponse, ServerMessage, TurnstileVerifyRequest, TurnstileVerifyResponse};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;

use crate::host_guard::HostGuard;
use crate::metrics::Metrics;
use crate::protection::ProtectionState;
use crate::relay;
use crate::session;
use crate::session_store::SessionStore;
use crate::supervisor::Shutdown;
use crate::token::TokenIssuer;
use crate::turnstile::{TurnstileClient, TurnstileError};

/// Max WebSocket frame size for the `/ssh` upgrade (spec §6).
const WS_MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;
/// Max HTTP request body size for everything else.
const HTTP_BODY_LIMIT: usize = 64 * 1024;

pub struct AppState {
    pub config: gateway_protocol::GatewayConfig,
    pub host_guard: Arc<HostGuard>,
    pub protection: Arc<ProtectionState>,
    pub session_store: Arc<dyn SessionStore>,
    pub tokens: Arc<TokenIssuer>,
    pub turnstile: Arc<TurnstileClient>,
    pub metrics: Arc<Metrics>,
    pub shutdown: Shutdown,
    pub allowed_hosts: Option<Vec<IpAddr>>,
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
    headers.insert("x-xss-protection", HeaderValue::from_static("0"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:; media-src 'self' blob:",
        ),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );

    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/turnstile-verify", post(turnstile_verify))
        .route("/auth/status", get(auth_status))
        .route("/ssh", get(ssh_upgrade))
        .route("/api/health", get(health_check))
        .route("/api/health/detailed", get(health_check_detailed))
        .route("/metrics", get(metrics_handler))
        .layer(RequestBodyLimitLayer::new(HTTP_BODY_LIMIT))
        .layer(axum::middleware::from_fn(security_headers))
        .with_state(state)
}

/// Resolve the client IP the rest of the gateway should trust. Behind a
/// reverse proxy, the accepted TCP peer is the proxy itself — the
/// operator opts into trusting its `X-Forwarded-For` header instead via
/// `server.behind_proxy`. Not behind a proxy, the TCP peer is the
/// browser and is always used.
fn resolve_client_ip(headers: &HeaderMap, peer_addr: SocketAddr, behind_proxy: bool) -> IpAddr {
    if behind_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim())
            .and_then(|v| v.parse::<IpAddr>().ok())
        {
            return forwarded;
        }
    }
    peer_addr.ip()
}

async fn turnstile_verify(
    State(state): State<Arc<AppState>>,
    Extension(peer_addr): Extension<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<TurnstileVerifyRequest>,
) -> impl IntoResponse {
    if body.token.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(TurnstileVerifyResponse::failure("missing client token")),
        )
            .into_response();
    }

    if !state.turnstile.is_configured() {
        tracing::error!("turnstile-verify called with no provider secret configured");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(TurnstileVerifyResponse::failure("challenge provider misconfigured")),
        )
            .into_response();
    }

    let client_ip = resolve_client_ip(&headers, peer_addr, state.config.server.behind_proxy);
    let (jar, session_id) = session::ensure_session(jar, state.session_store.as_ref()).await;

    match state.turnstile.verify(&body.token).await {
        Ok(()) => {
            let (token, ttl) = state.tokens.issue(&session_id, client_ip).await;
            tracing::info!(target: "audit", %client_ip, %session_id, "challenge token issued");
            (
                jar,
                Json(TurnstileVerifyResponse::success(token, ttl.as_millis() as u64)),
            )
                .into_response()
        }
        Err(TurnstileError::Rejected(message)) => {
            state.metrics.turnstile_failure();
            (jar, StatusCode::BAD_REQUEST, Json(TurnstileVerifyResponse::failure(message))).into_response()
        }
        Err(TurnstileError::Malformed(e)) => {
            state.metrics.turnstile_failure();
            tracing::error!(error = %e, "turnstile provider returned a malformed response");
            (
                jar,
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TurnstileVerifyResponse::failure("challenge provider misconfigured")),
            )
                .into_response()
        }
        Err(TurnstileError::Transport(e)) => {
            state.metrics.turnstile_failure();
            tracing::warn!(error = %e, "turnstile provider unreachable");
            (
                jar,
                StatusCode::BAD_GATEWAY,
                Json(TurnstileVerifyResponse::failure("challenge provider unavailable")),
            )
                .into_response()
        }
        Err(TurnstileError::ServerError(status)) => {
            state.metrics.turnstile_failure();
            tracing::warn!(%status, "turnstile provider returned a server error");
            (
                jar,
                StatusCode::BAD_GATEWAY,
                Json(TurnstileVerifyResponse::failure("challenge provider unavailable")),
            )
                .into_response()
        }
    }
}

async fn auth_status(State(state): State<Arc<AppState>>, jar: CookieJar) -> impl IntoResponse {
    let Some(session_id) = session::session_id(&jar) else {
        return Json(AuthStatusResponse {
            authenticated: false,
            user: None,
        });
    };

    let user = state
        .session_store
        .get(&session_id)
        .await
        .and_then(|record| record.user);

    Json(AuthStatusResponse {
        authenticated: user.is_some(),
        user,
    })
}

#[derive(Deserialize)]
struct UpgradeQuery {
    ts: Option<String>,
}

async fn ssh_upgrade(
    State(state): State<Arc<AppState>>,
    Extension(peer_addr): Extension<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<UpgradeQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let client_ip = resolve_client_ip(&headers, peer_addr, state.config.server.behind_proxy);

    let Some(session_id) = session::session_id(&jar) else {
        return (StatusCode::UNAUTHORIZED, "no session").into_response();
    };

    let store_timeout = Duration::from_millis(state.config.protection.session_store_get_timeout_ms);
    let record = match tokio::time::timeout(store_timeout, state.session_store.get(&session_id)).await {
        Ok(Some(record)) => record,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "no session").into_response(),
        Err(_) => return (StatusCode::UNAUTHORIZED, "session lookup timed out").into_response(),
    };

    let Some(user) = record.user else {
        return (StatusCode::UNAUTHORIZED, "not logged in").into_response();
    };

    let Some(presented_token) = query.ts.filter(|t| !t.is_empty()) else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    if !state.tokens.consume(&session_id, &presented_token, client_ip).await {
        return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response();
    }

    let new_count = state.protection.increment_ip(client_ip).await;
    if new_count > state.protection.concurrent_per_ip_limit() {
        state.protection.decrement_ip(client_ip).await;
        tracing::info!(target: "audit", %client_ip, "rejected upgrade: concurrent-per-ip limit exceeded");
        return ws
            .on_upgrade(|mut socket| async move {
                let _ = socket
                    .send(Message::Text(
                        ServerMessage::error("too many concurrent connections").to_json().into(),
                    ))
                    .await;
                let _ = socket.send(Message::Close(None)).await;
            })
            .into_response();
    }

    tracing::info!(target: "audit", %client_ip, user = %user.id, "ssh upgrade accepted");

    let host_guard = state.host_guard.clone();
    let protection = state.protection.clone();
    let allowed_hosts = state.allowed_hosts.clone();
    let idle_timeout = Duration::from_secs(state.config.session.idle_timeout);
    let metrics = state.metrics.clone();
    let shutdown_rx = state.shutdown.subscribe();

    ws.max_message_size(WS_MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| {
            relay::run(
                socket,
                client_ip,
                user.id,
                presented_token,
                host_guard,
                protection,
                allowed_hosts,
                idle_timeout,
                metrics,
                shutdown_rx,
            )
        })
        .into_response()
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn health_check_detailed(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> impl IntoResponse {
    if !is_authenticated(&state, &jar).await {
        return (StatusCode::UNAUTHORIZED, "authentication required").into_response();
    }

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>, jar: CookieJar) -> impl IntoResponse {
    if state.config.server.metrics_require_auth && !is_authenticated(&state, &jar).await {
        return (StatusCode::UNAUTHORIZED, "authentication required").into_response();
    }

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

async fn is_authenticated(state: &AppState, jar: &CookieJar) -> bool {
    let Some(session_id) = session::session_id(jar) else {
        return false;
    };
    matches!(
        state.session_store.get(&session_id).await,
        Some(record) if record.user.is_some()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gateway_protocol::{
        GatewayConfig, ProtectionConfig, ServerConfig, SessionConfig, TurnstileConfig, UserProfile,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::session_store::{MemorySessionStore, SessionRecord};

    const TEST_SECRET: &str = "test-secret";

    fn default_config() -> GatewayConfig {
        GatewayConfig {
            server: ServerConfig::default(),
            protection: ProtectionConfig::default(),
            turnstile: TurnstileConfig::default(),
            session: SessionConfig::default(),
        }
    }

    fn state_with(config: GatewayConfig) -> Arc<AppState> {
        Arc::new(AppState {
            session_store: Arc::new(MemorySessionStore::new()),
            host_guard: Arc::new(HostGuard::new()),
            protection: Arc::new(ProtectionState::new(
                config.protection.concurrent_per_ip,
                config.protection.max_ssh_attempts_per_user,
            )),
            tokens: Arc::new(TokenIssuer::new(
                Arc::new(MemorySessionStore::new()),
                Duration::from_millis(config.turnstile.token_ttl_ms),
            )),
            turnstile: Arc::new(TurnstileClient::new(config.turnstile.clone()).unwrap()),
            metrics: Arc::new(Metrics::new()),
            shutdown: Shutdown::new(),
            allowed_hosts: None,
            started_at: std::time::Instant::now(),
            config,
        })
    }

    fn test_state() -> Arc<AppState> {
        let mut config = default_config();
        config.turnstile.secret = Some(TEST_SECRET.to_string());
        state_with(config)
    }

    fn test_router(state: Arc<AppState>) -> Router {
        build_router(state).layer(Extension(SocketAddr::from(([127, 0, 0, 1], 12345))))
    }

    fn request_with_peer(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok_unauthenticated() {
        let app = test_router(test_state());
        let response = app.oneshot(request_with_peer("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn health_detailed_requires_auth() {
        let app = test_router(test_state());
        let response = app
            .oneshot(request_with_peer("/api/health/detailed"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn metrics_requires_auth_by_default() {
        let app = test_router(test_state());
        let response = app.oneshot(request_with_peer("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn metrics_open_when_config_disables_auth() {
        let mut config = default_config();
        config.turnstile.secret = Some(TEST_SECRET.to_string());
        config.server.metrics_require_auth = false;
        let app = test_router(state_with(config));
        let response = app.oneshot(request_with_peer("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_status_unauthenticated_without_cookie() {
        let app = test_router(test_state());
        let response = app.oneshot(request_with_peer("/auth/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["authenticated"], false);
        assert!(json["user"].is_null());
    }

    #[tokio::test]
    async fn auth_status_authenticated_with_session() {
        let state = test_state();
        state
            .session_store
            .set(
                "sess-1",
                SessionRecord {
                    user: Some(UserProfile {
                        id: "u1".to_string(),
                        email: "u1@example.com".to_string(),
                        display_name: "User One".to_string(),
                    }),
                    challenge_token: None,
                },
                Duration::from_secs(60),
            )
            .await;

        let app = test_router(state);
        let request = Request::builder()
            .uri("/auth/status")
            .header("cookie", format!("{}=sess-1", session::SESSION_COOKIE))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["authenticated"], true);
        assert_eq!(json["user"]["id"], "u1");
    }

    #[tokio::test]
    async fn ssh_upgrade_without_session_is_unauthorized() {
        let app = test_router(test_state());
        let request = Request::builder()
            .uri("/ssh?ts=whatever")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn turnstile_verify_rejects_empty_token() {
        let app = test_router(test_state());
        let request = Request::builder()
            .method("POST")
            .uri("/turnstile-verify")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json!({ "token": "" })).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let app = test_router(test_state());
        let response = app.oneshot(request_with_peer("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-frame-options"));
        assert!(response.headers().contains_key("strict-transport-security"));
    }
}
