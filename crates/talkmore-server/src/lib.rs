pub mod config;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection},
    http::HeaderMap,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use talkmore_api::auth::{self, AppState, AppStateInner};
use talkmore_api::messages;
use talkmore_api::middleware::{bearer_token, require_auth};
use talkmore_api::tokens::INVALID_ACCESS_TOKEN;
use talkmore_api::{ApiError, TokenService};
use talkmore_db::{Database, FanOut, Store};
use talkmore_gateway::{ConnectionRegistry, Gateway};
use talkmore_types::api::ApiResponse;

use crate::config::Config;

#[derive(Clone)]
pub struct ServerState {
    pub app: AppState,
    pub gateway: Gateway,
}

/// Wire the services together. Cancelling `shutdown` closes every socket.
pub fn build_state(db: Arc<Database>, config: &Config, shutdown: CancellationToken) -> ServerState {
    let store = Store::new(db, config.store_timeout);
    let fanout = FanOut::new(store.clone());
    let tokens = TokenService::new(store.clone(), &config.jwt_secret, config.auth_mode);

    let app: AppState = Arc::new(AppStateInner {
        store,
        fanout: fanout.clone(),
        tokens,
        logout_policy: config.stateless_logout,
    });

    let gateway = Gateway::new(
        ConnectionRegistry::new(),
        fanout,
        config.heartbeat_interval,
        shutdown,
    );

    ServerState { app, gateway }
}

pub fn build_router(state: ServerState) -> Router {
    let app_state = state.app.clone();

    let public_routes = Router::new()
        .route("/signup", post(auth::signup))
        .route("/signin", post(auth::signin))
        .route("/refreshtoken", post(auth::refresh_token))
        .route("/health", get(health))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/api/message", post(messages::send_message))
        .route("/api/chatlist", post(messages::chat_list))
        .route("/api/getmessages", post(messages::get_messages))
        .route("/api/myprofile", post(auth::my_profile))
        .route("/api/logout", post(auth::logout))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/ws/messages", get(ws_upgrade))
        .route("/ws/chats", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<ApiResponse<Value>> {
    Json(ApiResponse::ok("ok", json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Browsers cannot set headers on a socket upgrade.
    token: Option<String>,
}

/// Authenticate, then upgrade. Nothing is upgraded without a valid identity.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers)
        .or(query.token)
        .ok_or(ApiError::Unauthorized(INVALID_ACCESS_TOKEN))?;
    let user = state.app.authenticate(&token).await?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let gateway = state.gateway.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        gateway.handle_connection(socket, user.profile).await;
    }))
}
