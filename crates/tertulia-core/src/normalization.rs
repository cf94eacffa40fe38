use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    error::ChatError,
    types::{Author, ChatEvent, DeliveryState, Message, MessageContent, RemoteMessage, SendAck},
};

/// Helper describing a remote write outcome before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Write succeeded and produced a server id.
    Success { message_id: String },
    /// Write failed with error details.
    Failure { error: ChatError },
}

/// Current wall-clock time in milliseconds since Unix epoch.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Convert a backend row into a confirmed [`Message`].
///
/// Rows without a timestamp sort by `received_at_ms`.
pub fn normalize_remote_message(remote: RemoteMessage, received_at_ms: u64) -> Message {
    Message {
        id: remote.id,
        room: remote.room,
        author: Author::new(remote.author_id, remote.author_name),
        content: remote.content,
        created_at_ms: remote.created_at_ms.unwrap_or(received_at_ms),
        client_txn_id: remote.client_txn_id,
        delivery: DeliveryState::Confirmed,
    }
}

/// Convert a write outcome to a stable `ChatEvent::SendAck`.
pub fn normalize_send_outcome(
    client_txn_id: impl Into<String>,
    room: impl Into<String>,
    outcome: SendOutcome,
) -> ChatEvent {
    let client_txn_id = client_txn_id.into();
    let room = room.into();
    match outcome {
        SendOutcome::Success { message_id } => ChatEvent::SendAck(SendAck {
            client_txn_id,
            room,
            message_id: Some(message_id),
            error_code: None,
        }),
        SendOutcome::Failure { error } => ChatEvent::SendAck(SendAck {
            client_txn_id,
            room,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Convert an error into a `RuntimeError` event.
pub fn normalize_runtime_error(error: ChatError) -> ChatEvent {
    let recoverable = error.is_recoverable();
    ChatEvent::RuntimeError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

/// System-authored notice shown when room history could not be loaded.
pub fn history_diagnostic(room: &str, error: &ChatError, now_ms: u64) -> Message {
    Message {
        id: format!("sys-history-{room}-{now_ms}"),
        room: room.to_owned(),
        author: Author::system(),
        content: MessageContent::System {
            body: format!(
                "⚠️ ERROR DB: no se pudo cargar el historial de #{room} ({})",
                error.message
            ),
        },
        created_at_ms: now_ms,
        client_txn_id: None,
        delivery: DeliveryState::Confirmed,
    }
}
