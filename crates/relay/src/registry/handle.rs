// One attached client's outbound channel.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use futures_util::{Sink, SinkExt};
use huddle_common::types::User;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::HandleError;

/// Write half of a duplex message channel.
pub type BoxedSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

struct Writer {
    sink: BoxedSink,
    closed: bool,
}

/// Exclusive owner of one connection's write half.
///
/// All writers (the session's own heartbeat, every broadcast) go through
/// [`ConnectionHandle::send`], which holds the per-handle lock for the whole
/// frame so concurrent writers never interleave on one channel.
pub struct ConnectionHandle {
    connection_id: Uuid,
    user: User,
    writer: Mutex<Writer>,
    write_timeout: Duration,
    evicted: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub fn new(user: User, sink: BoxedSink, write_timeout: Duration) -> Self {
        let (evicted, _) = watch::channel(false);
        Self {
            connection_id: Uuid::new_v4(),
            user,
            writer: Mutex::new(Writer { sink, closed: false }),
            write_timeout,
            evicted,
        }
    }

    pub fn from_sink<S>(user: User, sink: S, write_timeout: Duration) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        Self::new(user, Box::pin(sink), write_timeout)
    }

    /// Distinguishes successive connections made under the same identity.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Writes one frame, waiting at most the configured write timeout.
    pub async fn send(&self, message: Message) -> Result<(), HandleError> {
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(HandleError::Closed);
        }

        match timeout(self.write_timeout, writer.sink.send(message)).await {
            Ok(result) => result.map_err(HandleError::from),
            Err(_) => Err(HandleError::TimedOut(self.write_timeout)),
        }
    }

    pub async fn send_text(&self, text: Utf8Bytes) -> Result<(), HandleError> {
        self.send(Message::Text(text)).await
    }

    /// Sends an optional close frame and shuts the write half. Idempotent;
    /// later sends fail with [`HandleError::Closed`].
    pub async fn close(&self, frame: Option<CloseFrame>) {
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return;
        }
        writer.closed = true;

        if let Some(frame) = frame {
            let _ = timeout(self.write_timeout, writer.sink.send(Message::Close(Some(frame)))).await;
        }
        let _ = timeout(self.write_timeout, writer.sink.close()).await;
    }

    #[cfg(test)]
    pub(crate) async fn is_closed(&self) -> bool {
        self.writer.lock().await.closed
    }

    /// Tells the owning session that a newer connection took over its identity.
    pub fn evict(&self) {
        self.evicted.send_replace(true);
    }

    pub fn is_evicted(&self) -> bool {
        *self.evicted.borrow()
    }

    /// Resolves once [`ConnectionHandle::evict`] has been called, including
    /// when it was called before this future was created.
    pub fn evicted(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.evicted.subscribe();
        async move {
            let _ = receiver.wait_for(|evicted| *evicted).await;
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.connection_id)
            .field("user", &self.user)
            .field("evicted", &self.is_evicted())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes};
    use tokio::time;

    use super::test_support::{broken_handle, drain_text, recording_handle, stalled_handle};
    use crate::error::HandleError;

    #[tokio::test]
    async fn send_text_writes_one_frame() {
        let (handle, mut frames) = recording_handle("u1");
        handle.send_text(Utf8Bytes::from("hello")).await.expect("send should succeed");
        assert_eq!(drain_text(&mut frames), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_writers_never_lose_frames() {
        let (handle, mut frames) = recording_handle("u1");
        let mut tasks = Vec::new();
        for writer in 0..16 {
            let handle = Arc::clone(&handle);
            tasks.push(tokio::spawn(async move {
                for seq in 0..25 {
                    handle
                        .send_text(Utf8Bytes::from(format!("{writer}:{seq}")))
                        .await
                        .expect("send should succeed");
                }
            }));
        }
        for task in tasks {
            task.await.expect("writer task should finish");
        }

        let received = drain_text(&mut frames);
        assert_eq!(received.len(), 16 * 25);
        // Frames from one writer keep their relative order.
        for writer in 0..16 {
            let own: Vec<_> =
                received.iter().filter(|frame| frame.starts_with(&format!("{writer}:"))).collect();
            let expected: Vec<_> = (0..25).map(|seq| format!("{writer}:{seq}")).collect();
            assert_eq!(own.into_iter().cloned().collect::<Vec<_>>(), expected);
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_later_sends() {
        let (handle, mut frames) = recording_handle("u1");
        let frame = CloseFrame { code: close_code::POLICY, reason: Utf8Bytes::from("bye") };
        handle.close(Some(frame.clone())).await;
        handle.close(Some(frame)).await;

        let mut close_frames = 0;
        while let Ok(message) = frames.try_recv() {
            if let Message::Close(Some(frame)) = message {
                assert_eq!(frame.code, close_code::POLICY);
                close_frames += 1;
            }
        }
        assert_eq!(close_frames, 1);
        assert!(handle.is_closed().await);
        assert!(matches!(
            handle.send_text(Utf8Bytes::from("late")).await,
            Err(HandleError::Closed)
        ));
    }

    #[tokio::test]
    async fn broken_channel_reports_transport_error() {
        let handle = broken_handle("u1");
        let error = handle.send_text(Utf8Bytes::from("hi")).await.expect_err("send should fail");
        assert!(matches!(error, HandleError::Transport(_)));
        // A second attempt fails the same way rather than panicking.
        assert!(handle.send_text(Utf8Bytes::from("again")).await.is_err());
    }

    #[tokio::test]
    async fn stalled_channel_times_out() {
        time::pause();
        let handle = stalled_handle("u1");
        let error = handle.send_text(Utf8Bytes::from("hi")).await.expect_err("send should time out");
        assert!(matches!(error, HandleError::TimedOut(_)));
    }

    #[tokio::test]
    async fn eviction_is_observed_even_when_signalled_first() {
        let (handle, _frames) = recording_handle("u1");
        assert!(!handle.is_evicted());
        handle.evict();
        assert!(handle.is_evicted());
        time::timeout(std::time::Duration::from_secs(1), handle.evicted())
            .await
            .expect("eviction future should resolve");
    }

    #[tokio::test]
    async fn each_handle_gets_a_distinct_connection_id() {
        let (first, _a) = recording_handle("u1");
        let (second, _b) = recording_handle("u1");
        assert_ne!(first.connection_id(), second.connection_id());
        assert_eq!(first.user().id, second.user().id);
    }
}
