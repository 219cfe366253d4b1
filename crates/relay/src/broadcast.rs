// Fan-out of one serialized envelope to every registered connection.

use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use huddle_common::{protocol::ws::WsMessage, types::UserId};
use tracing::warn;

use crate::metrics;
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// Outcome of one fan-out. Callers are free to ignore it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: Vec<UserId>,
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
}

impl Broadcaster {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Writes `text` to every handle registered at the moment of the call.
    ///
    /// The registry lock is released before any write. A failed write is
    /// logged and skipped; the failing handle stays registered until its
    /// own session notices the broken channel.
    pub async fn broadcast(&self, text: Utf8Bytes) -> BroadcastReport {
        let recipients = self.registry.snapshot().await;
        fan_out(&recipients, text).await
    }

    /// Encodes a server-originated envelope and broadcasts it.
    pub async fn broadcast_message(
        &self,
        message: &WsMessage,
    ) -> Result<BroadcastReport, serde_json::Error> {
        let encoded = message.to_json()?;
        Ok(self.broadcast(Utf8Bytes::from(encoded)).await)
    }
}

/// Delivers `text` to each recipient in turn, each under its own write lock.
pub async fn fan_out(recipients: &[Arc<ConnectionHandle>], text: Utf8Bytes) -> BroadcastReport {
    let mut report = BroadcastReport::default();

    for recipient in recipients {
        report.attempted += 1;
        match recipient.send_text(text.clone()).await {
            Ok(()) => report.delivered += 1,
            Err(error) => {
                warn!(
                    user_id = %recipient.user().id,
                    connection_id = %recipient.connection_id(),
                    error = %error,
                    "failed to deliver broadcast"
                );
                report.failed.push(recipient.user().id.clone());
            }
        }
    }

    metrics::record_broadcast(report.failed.len());
    report
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use axum::extract::ws::Utf8Bytes;
    use huddle_common::protocol::ws::{ActiveUsersPayload, WsMessage};
    use huddle_common::types::UserId;
    use tokio::time;

    use super::Broadcaster;
    use crate::registry::{
        handle::test_support::{
            broken_handle, counting_broken_handle, drain_text, recording_handle, stalled_handle,
        },
        ConnectionRegistry,
    };

    fn user_id(raw: &str) -> UserId {
        UserId::parse(raw).expect("test identity should parse")
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_handle() {
        let registry = ConnectionRegistry::default();
        let mut receivers = Vec::new();
        for n in 0..5 {
            let (handle, frames) = recording_handle(&format!("u{n}"));
            registry.add(handle).await;
            receivers.push(frames);
        }

        let report = Broadcaster::new(registry).broadcast(Utf8Bytes::from("ping-all")).await;

        assert_eq!(report.attempted, 5);
        assert_eq!(report.delivered, 5);
        assert!(report.failed.is_empty());
        for frames in &mut receivers {
            assert_eq!(drain_text(frames), vec!["ping-all".to_string()]);
        }
    }

    #[tokio::test]
    async fn broadcast_to_empty_registry_is_a_noop() {
        let report = Broadcaster::new(ConnectionRegistry::default())
            .broadcast(Utf8Bytes::from("nobody"))
            .await;
        assert_eq!(report.attempted, 0);
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn failing_handle_does_not_abort_fan_out() {
        let registry = ConnectionRegistry::default();
        let (first, mut first_frames) = recording_handle("u1");
        let (last, mut last_frames) = recording_handle("u3");
        registry.add(first).await;
        registry.add(broken_handle("u2")).await;
        registry.add(last).await;

        let report = Broadcaster::new(registry.clone()).broadcast(Utf8Bytes::from("hello")).await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec![user_id("u2")]);
        assert_eq!(drain_text(&mut first_frames), vec!["hello".to_string()]);
        assert_eq!(drain_text(&mut last_frames), vec!["hello".to_string()]);
        // Removal is left to the failing connection's own session.
        assert!(registry.get(&user_id("u2")).await.is_some());
    }

    #[tokio::test]
    async fn each_report_counts_the_writes_it_tried() {
        let registry = ConnectionRegistry::default();
        let (healthy, mut healthy_frames) = recording_handle("u1");
        let (broken, write_attempts) = counting_broken_handle("u2");
        registry.add(healthy).await;
        registry.add(broken).await;
        let broadcaster = Broadcaster::new(registry);

        for text in ["first", "second"] {
            let report = broadcaster.broadcast(Utf8Bytes::from(text)).await;
            assert_eq!(report.attempted, 2);
            assert_eq!(report.delivered, 1);
            assert_eq!(report.failed, vec![user_id("u2")]);
        }

        assert_eq!(write_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(drain_text(&mut healthy_frames), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn stalled_handle_times_out_without_blocking_others() {
        time::pause();
        let registry = ConnectionRegistry::default();
        let (healthy, mut healthy_frames) = recording_handle("u1");
        registry.add(stalled_handle("u0")).await;
        registry.add(healthy).await;

        let report = Broadcaster::new(registry).broadcast(Utf8Bytes::from("tick")).await;

        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec![user_id("u0")]);
        assert_eq!(drain_text(&mut healthy_frames), vec!["tick".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_broadcasts_deliver_whole_frames() {
        let registry = ConnectionRegistry::default();
        let (handle, mut frames) = recording_handle("u1");
        registry.add(handle).await;
        let broadcaster = Arc::new(Broadcaster::new(registry));

        let mut tasks = Vec::new();
        for n in 0..20 {
            let broadcaster = Arc::clone(&broadcaster);
            tasks.push(tokio::spawn(async move {
                broadcaster.broadcast(Utf8Bytes::from(format!("message-{n}"))).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.expect("broadcast task should finish").delivered, 1);
        }

        let mut received = drain_text(&mut frames);
        received.sort();
        let mut expected = (0..20).map(|n| format!("message-{n}")).collect::<Vec<_>>();
        expected.sort();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn broadcast_message_encodes_envelope() {
        let registry = ConnectionRegistry::default();
        let (handle, mut frames) = recording_handle("u1");
        registry.add(handle).await;

        Broadcaster::new(registry)
            .broadcast_message(&WsMessage::ActiveUsers(ActiveUsersPayload { total: 1 }))
            .await
            .expect("active users message should encode");

        assert_eq!(
            drain_text(&mut frames),
            vec![r#"{"type":"activeUsers","payload":{"total":1}}"#.to_string()]
        );
    }
}
