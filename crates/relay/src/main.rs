mod broadcast;
mod config;
mod dispatch;
mod error;
mod metrics;
mod origin;
mod presence;
mod registry;
mod ws;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broadcast::Broadcaster;
use crate::config::{LogFormat, RelayConfig};
use crate::error::{
    attach_request_id_header, current_request_id, request_id_from_headers_or_generate,
    with_request_id_scope, ErrorCode, RelayError, REQUEST_ID_HEADER,
};
use crate::metrics::RelayMetrics;
use crate::origin::OriginPolicy;
use crate::presence::spawn_presence_announcer;
use crate::registry::ConnectionRegistry;
use crate::ws::{RelayState, SessionSettings};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config)?;

    let metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&metrics));

    let registry = ConnectionRegistry::default();
    let broadcaster = Broadcaster::new(registry.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let presence = spawn_presence_announcer(broadcaster.clone(), config.presence_interval);

    let state = RelayState::new(
        broadcaster,
        OriginPolicy::from_config(config.allowed_origins.clone()),
        SessionSettings::from_config(&config),
        shutdown_rx,
    );
    let app = build_router(state, metrics, registry.clone());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;
    info!(
        listen_addr = %config.listen_addr,
        presence_interval_ms = config.presence_interval.as_millis() as u64,
        heartbeat_interval_ms = config.heartbeat_interval.as_millis() as u64,
        "starting relay server"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("relay server exited unexpectedly");

    presence.shutdown().await;
    drain_sessions(&registry, config.write_timeout).await;
    info!("relay stopped");
    served
}

fn init_tracing(config: &RelayConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid log filter `{}`", config.log_filter))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|error| anyhow::anyhow!("failed to install tracing subscriber: {error}"))
}

/// Gives open sessions up to `grace` to send their close frames and leave.
async fn drain_sessions(registry: &ConnectionRegistry, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let remaining = registry.size().await;
        if remaining == 0 {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(remaining, "sessions still open at shutdown");
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn build_router(state: RelayState, metrics: Arc<RelayMetrics>, registry: ConnectionRegistry) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(state))
            .merge(metrics::router(metrics, registry))
            .fallback(not_found),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn not_found() -> RelayError {
    let error = RelayError::from_code(ErrorCode::NotFound);
    match current_request_id() {
        Some(request_id) => error.with_request_id(request_id),
        None => error,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(mut request: Request<Body>, next: Next) -> Response {
    // Pin the id here so a panic response carries the same one the inner
    // middleware would have logged.
    let request_id = request_id_from_headers_or_generate(request.headers());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, request_id = %request_id, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError)
                .with_request_id(request_id)
                .into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
