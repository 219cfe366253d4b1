use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
};

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::registry::ConnectionRegistry;

/// Why an inbound frame produced no broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The outer envelope did not decode.
    Malformed,
    /// The envelope decoded but its payload did not fit the declared type.
    InvalidPayload,
    /// Unknown or server-only type.
    Ignored,
}

impl DropReason {
    pub const ALL: [DropReason; 3] = [Self::Malformed, Self::InvalidPayload, Self::Ignored];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::InvalidPayload => "invalid_payload",
            Self::Ignored => "ignored",
        }
    }
}

#[derive(Default)]
pub struct RelayMetrics {
    connections_accepted_total: AtomicU64,
    connections_rejected_total: AtomicU64,
    connections_superseded_total: AtomicU64,
    broadcasts_total: AtomicU64,
    broadcast_write_failures_total: AtomicU64,
    chat_messages_relayed_total: AtomicU64,
    dropped_malformed_total: AtomicU64,
    dropped_invalid_payload_total: AtomicU64,
    dropped_ignored_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_connection_accepted() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_accepted_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_connection_rejected() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_rejected_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_connection_superseded() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_superseded_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_broadcast(failed_writes: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.record_broadcast(failed_writes);
    }
}

pub fn record_chat_relayed() {
    if let Some(metrics) = global_metrics() {
        metrics.chat_messages_relayed_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_message_dropped(reason: DropReason) {
    if let Some(metrics) = global_metrics() {
        metrics.record_message_dropped(reason);
    }
}

impl RelayMetrics {
    pub fn record_broadcast(&self, failed_writes: usize) {
        self.broadcasts_total.fetch_add(1, Ordering::Relaxed);
        self.broadcast_write_failures_total.fetch_add(failed_writes as u64, Ordering::Relaxed);
    }

    pub fn record_message_dropped(&self, reason: DropReason) {
        self.dropped_counter(reason).fetch_add(1, Ordering::Relaxed);
    }

    fn dropped_counter(&self, reason: DropReason) -> &AtomicU64 {
        match reason {
            DropReason::Malformed => &self.dropped_malformed_total,
            DropReason::InvalidPayload => &self.dropped_invalid_payload_total,
            DropReason::Ignored => &self.dropped_ignored_total,
        }
    }

    pub fn render_prometheus(&self, active_connections: usize) -> String {
        let mut output = String::new();

        append_counter(
            &mut output,
            "relay_connections_accepted_total",
            "Connections that joined with an identity.",
            &self.connections_accepted_total,
        );
        append_counter(
            &mut output,
            "relay_connections_rejected_total",
            "Connections closed for a missing identity.",
            &self.connections_rejected_total,
        );
        append_counter(
            &mut output,
            "relay_connections_superseded_total",
            "Connections evicted by a newer connection under the same identity.",
            &self.connections_superseded_total,
        );
        append_counter(
            &mut output,
            "relay_broadcasts_total",
            "Broadcast fan-outs issued.",
            &self.broadcasts_total,
        );
        append_counter(
            &mut output,
            "relay_broadcast_write_failures_total",
            "Per-connection writes that failed during a broadcast.",
            &self.broadcast_write_failures_total,
        );
        append_counter(
            &mut output,
            "relay_chat_messages_relayed_total",
            "Chat envelopes validated and relayed.",
            &self.chat_messages_relayed_total,
        );

        output.push_str(
            "# HELP relay_messages_dropped_total Inbound messages dropped without a broadcast.\n",
        );
        output.push_str("# TYPE relay_messages_dropped_total counter\n");
        for reason in DropReason::ALL {
            output.push_str(&format!(
                "relay_messages_dropped_total{{reason=\"{}\"}} {}\n",
                reason.as_str(),
                self.dropped_counter(reason).load(Ordering::Relaxed)
            ));
        }

        output.push_str("# HELP relay_active_connections Currently registered connections.\n");
        output.push_str("# TYPE relay_active_connections gauge\n");
        output.push_str(&format!("relay_active_connections {active_connections}\n"));

        output
    }
}

fn append_counter(output: &mut String, name: &str, help: &str, counter: &AtomicU64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} counter\n"));
    output.push_str(&format!("{name} {}\n", counter.load(Ordering::Relaxed)));
}

#[derive(Clone)]
struct MetricsState {
    metrics: Arc<RelayMetrics>,
    registry: ConnectionRegistry,
}

pub fn router(metrics: Arc<RelayMetrics>, registry: ConnectionRegistry) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(MetricsState { metrics, registry })
}

async fn render_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    let active_connections = state.registry.size().await;
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(active_connections),
    )
}
