// Inbound message routing.

use axum::extract::ws::Utf8Bytes;
use huddle_common::protocol::ws::{ChatPayload, EnvelopeError, MessageType, RawEnvelope};
use tracing::{debug, warn};

use crate::broadcast::{BroadcastReport, Broadcaster};
use crate::metrics::{self, DropReason};

#[derive(Debug)]
pub enum DispatchOutcome {
    /// A valid chat envelope was forwarded untouched.
    Relayed(BroadcastReport),
    /// Structurally valid, but not something clients may send.
    Ignored { kind: String },
    /// Envelope or payload failed to decode.
    Rejected(EnvelopeError),
}

/// Routes one inbound text frame. Never fails the session: bad input is
/// logged and dropped.
///
/// A valid chat message is rebroadcast as the original frame, so every
/// client sees exactly the bytes the sender wrote.
pub async fn dispatch(broadcaster: &Broadcaster, raw: Utf8Bytes) -> DispatchOutcome {
    let envelope = match RawEnvelope::decode(raw.as_str()) {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(error = %error, bytes = raw.len(), "dropping malformed envelope");
            metrics::record_message_dropped(DropReason::Malformed);
            return DispatchOutcome::Rejected(error);
        }
    };

    match envelope.message_type() {
        Some(MessageType::Chat) => match envelope.payload_as::<ChatPayload>(MessageType::Chat) {
            Ok(_) => {
                metrics::record_chat_relayed();
                DispatchOutcome::Relayed(broadcaster.broadcast(raw).await)
            }
            Err(error) => {
                warn!(error = %error, bytes = raw.len(), "dropping chat message with invalid payload");
                metrics::record_message_dropped(DropReason::InvalidPayload);
                DispatchOutcome::Rejected(error)
            }
        },
        Some(kind) => {
            debug!(kind = kind.as_str(), "ignoring server-only message type from client");
            metrics::record_message_dropped(DropReason::Ignored);
            DispatchOutcome::Ignored { kind: envelope.kind }
        }
        None => {
            debug!(kind = %envelope.kind, "ignoring unrecognized message type");
            metrics::record_message_dropped(DropReason::Ignored);
            DispatchOutcome::Ignored { kind: envelope.kind }
        }
    }
}
