// Periodic `activeUsers` announcements.

use std::time::Duration;

use huddle_common::protocol::ws::{ActiveUsersPayload, WsMessage};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::broadcast::Broadcaster;

/// Broadcasts the current connection count if anyone is connected.
/// Returns whether a broadcast went out.
pub async fn announce_once(broadcaster: &Broadcaster) -> bool {
    let total = broadcaster.registry().size().await;
    if total == 0 {
        return false;
    }

    match broadcaster.broadcast_message(&WsMessage::ActiveUsers(ActiveUsersPayload { total })).await
    {
        Ok(report) => {
            debug!(total, delivered = report.delivered, "announced active users");
            true
        }
        Err(error) => {
            error!(error = %error, "failed to encode active users message");
            false
        }
    }
}

/// Starts the announcer. The first announcement happens one full `period`
/// after the call.
pub fn spawn_presence_announcer(broadcaster: Broadcaster, period: Duration) -> PresenceHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(presence_loop(broadcaster, period, shutdown_rx));
    PresenceHandle { shutdown_tx, task: Some(task) }
}

/// Handle for the announcer task. Dropping it stops the loop.
pub struct PresenceHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PresenceHandle {
    /// Stops the loop and waits for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(join_error) = task.await {
                warn!(?join_error, "presence announcer ended abnormally");
            }
        }
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn presence_loop(
    broadcaster: Broadcaster,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                debug!("presence announcer shutting down");
                break;
            }
            _ = ticker.tick() => {
                announce_once(&broadcaster).await;
            }
        }
    }
}
