mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::ws::rejection::WebSocketUpgradeRejection,
    extract::{Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_api::middleware::{decode_token, require_auth};
use courier_api::{auth, contacts, messages, users, AppState, SharedState};
use courier_cache::ExpiringCache;
use courier_gateway::{session, GatewayConfig, SessionManager};
use courier_services::auth::AuthService;
use courier_services::message::MessageService;
use courier_services::presence::PresenceService;
use courier_services::user::UserService;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::load();
    info!(
        server_id = %config.server_id,
        environment = %config.environment,
        "Starting courier server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = Arc::new(courier_db::Database::open(&config.database_path)?);

    let presence_cache = ExpiringCache::new(config.cache_ttl, config.cache_cleanup_interval);
    let message_service = MessageService::new(db.clone());
    let presence_service = PresenceService::new(db.clone(), presence_cache);
    let auth_service = AuthService::new(db.clone(), config.jwt_secret.clone(), config.jwt_expiry);
    let user_service = UserService::new(db.clone());

    let manager = SessionManager::new(
        db.clone(),
        message_service.clone(),
        presence_service,
        GatewayConfig {
            server_id: config.server_id.clone(),
            heartbeat_interval: config.ws_heartbeat_interval,
            connection_timeout: config.ws_connection_timeout,
        },
    );

    // Store-side TTL enforcement for active_connections and message_queue
    tokio::spawn(courier_db::sweep::run_expiry_loop(
        db.clone(),
        config.sweep_interval.as_secs(),
    ));

    let state: SharedState = Arc::new(AppState {
        auth: auth_service,
        users: user_service,
        messages: message_service,
        manager: manager.clone(),
        jwt_secret: config.jwt_secret.clone(),
        auth_rate_limiter: auth::AuthRateLimiter::new(),
    });

    let cors = build_cors_layer(&config.cors_origins);

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/api/users/me", get(users::get_me).put(users::update_me))
        .route("/api/users/search", get(users::search))
        .route("/api/users/{id}", get(users::get_by_id))
        .route("/api/contacts", get(contacts::list).post(contacts::add))
        .route("/api/contacts/{id}", axum::routing::delete(contacts::remove))
        .route("/api/messages", post(messages::send))
        .route("/api/messages/conversations", get(messages::get_conversations))
        .route(
            "/api/messages/conversations/{id}",
            get(messages::get_messages),
        )
        .route("/api/messages/{id}/status", put(messages::update_status))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state.clone());

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Courier server listening on {}", addr);

    // Create the listener via socket2 so TCP_NODELAY is set on the listening
    // socket and inherited by accepted connections; small WebSocket frames
    // must not sit behind Nagle's algorithm.
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(socket.into())?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(manager))
    .await?;

    info!("Server exited");
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn shutdown_signal(manager: SessionManager) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {e}");
        return;
    }
    info!("Server shutting down...");
    manager.shutdown().await;
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

/// `GET /ws` -- bearer token via `Authorization` header or `?token=`.
/// Invalid token is 401; a plain HTTP request that is not an upgrade is 426.
async fn ws_upgrade(
    State(state): State<SharedState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(ws) = ws else {
        return (
            StatusCode::UPGRADE_REQUIRED,
            Json(serde_json::json!({ "error": "websocket upgrade required" })),
        )
            .into_response();
    };

    let token = query.token.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    });
    let Some(token) = token else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "missing token" })),
        )
            .into_response();
    };

    let claims = match decode_token(&token, &state.jwt_secret) {
        Ok(claims) => claims,
        Err(_) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "invalid token" })),
            )
                .into_response();
        }
    };

    let manager = state.manager.clone();
    ws.max_frame_size(1_048_576) // 1 MiB max frame
        .max_message_size(1_048_576)
        .on_upgrade(move |socket| session::serve_socket(socket, manager, claims.user_id))
}
