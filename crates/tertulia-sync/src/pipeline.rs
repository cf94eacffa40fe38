//! Building blocks of the send pipeline: validation, the optimistic entry and
//! the remote draft.

use tertulia_core::{
    ChatError, ChatErrorCategory, DeliveryState, Message, OutgoingContent, ValidationError,
    ViewerContext, validate_outgoing,
};
use uuid::Uuid;

use crate::backend::MessageDraft;

/// Prefix of client-generated provisional message ids.
pub const PROVISIONAL_ID_PREFIX: &str = "opt-";

pub fn new_client_txn_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_provisional_id() -> String {
    format!("{PROVISIONAL_ID_PREFIX}{}", Uuid::new_v4())
}

/// Validate `content` and build the optimistic entry shown before any I/O.
pub fn prepare_pending(
    viewer: &ViewerContext,
    room: &str,
    client_txn_id: String,
    content: OutgoingContent,
    max_len: usize,
    now_ms: u64,
) -> Result<Message, ValidationError> {
    let content = validate_outgoing(content, max_len)?;
    Ok(Message {
        id: new_provisional_id(),
        room: room.to_owned(),
        author: viewer.author(),
        content: content.into_message_content(),
        created_at_ms: now_ms,
        client_txn_id: Some(client_txn_id),
        delivery: DeliveryState::Pending,
    })
}

/// Remote write for a pending entry. Reused verbatim on retry.
pub fn draft_for(message: &Message) -> MessageDraft {
    MessageDraft {
        room: message.room.clone(),
        author: message.author.clone(),
        content: message.content.clone(),
        created_at_ms: message.created_at_ms,
        client_txn_id: message.client_txn_id.clone(),
    }
}

pub fn validation_error(err: &ValidationError) -> ChatError {
    let code = match err {
        ValidationError::Empty => "empty_message",
        ValidationError::TooLong { .. } => "message_too_long",
        ValidationError::InvalidMediaUrl(_) => "invalid_media_url",
    };
    ChatError::new(ChatErrorCategory::Validation, code, err.to_string())
}
