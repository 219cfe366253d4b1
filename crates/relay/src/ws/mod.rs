// WebSocket attach endpoint.

mod session;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::QueryRejection, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::warn;

use crate::broadcast::Broadcaster;
use crate::config::RelayConfig;
use crate::error::current_request_id;
use crate::origin::OriginPolicy;

pub use session::{DisconnectReason, SessionState};

pub const CONNECT_PATH: &str = "/ws/connect";

/// Per-connection timing and size limits.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl SessionSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            write_timeout: config.write_timeout,
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

#[derive(Clone)]
pub struct RelayState {
    broadcaster: Broadcaster,
    origin_policy: Arc<OriginPolicy>,
    settings: SessionSettings,
    shutdown: watch::Receiver<bool>,
}

impl RelayState {
    pub fn new(
        broadcaster: Broadcaster,
        origin_policy: OriginPolicy,
        settings: SessionSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { broadcaster, origin_policy: Arc::new(origin_policy), settings, shutdown }
    }
}

/// Query parameters of the attach request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

pub fn router(state: RelayState) -> Router {
    Router::new().route(CONNECT_PATH, get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<RelayState>,
    query: Result<Query<ConnectParams>, QueryRejection>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // An undecodable query carries no usable identity; the session closes
    // it like any other attach without an id.
    let params = match query {
        Ok(Query(params)) => params,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "ignoring undecodable attach query");
            ConnectParams::default()
        }
    };
    if let Err(error) = state.origin_policy.check(&headers) {
        warn!(user_id = ?params.id, "rejecting websocket upgrade from disallowed origin");
        return error.into_response();
    }

    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let max_bytes = state.settings.max_frame_bytes;
    ws.max_frame_size(max_bytes)
        .max_message_size(max_bytes)
        .on_upgrade(move |socket| session::run(state, socket, params, request_id))
}
