//! Core contract of the Tertulia chat synchronization layer.
//!
//! This crate defines the message model, the command/event protocol, the room
//! session state machine, the merged timeline and common error/channel
//! abstractions. It performs no I/O.

/// Async command/event channel primitives.
pub mod channel;
/// Stable error types.
pub mod error;
/// Backend row, send outcome and diagnostic normalization helpers.
pub mod normalization;
/// Room session lifecycle state machine.
pub mod state_machine;
/// Deduplicating merge of pending, history and live messages.
pub mod timeline;
/// Message model and protocol types (commands, events, payloads).
pub mod types;
/// Outgoing content validation.
pub mod validation;

pub use channel::{ChatChannelError, ChatChannels, EventStream};
pub use error::{ChatError, ChatErrorCategory};
pub use normalization::{
    SendOutcome, history_diagnostic, normalize_remote_message, normalize_runtime_error,
    normalize_send_outcome, unix_time_ms,
};
pub use state_machine::{RoomSessionMachine, RoomSessionState, SessionToken};
pub use timeline::{MergeOutcome, MergedTimeline};
pub use types::{
    AutoReplyConfig, Author, ChatCommand, ChatEvent, DeliveryState, MediaKind, Message,
    MessageContent, OutgoingContent, RemoteMessage, RoomStatus, RuntimeConfig,
    SYSTEM_AUTHOR_ID, SYSTEM_AUTHOR_NAME, SendAck, ViewerContext,
};
pub use validation::{MAX_BODY_LEN, ValidationError, validate_outgoing};
