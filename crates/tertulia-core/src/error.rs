use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::RoomSessionState;

/// Broad error category used for degraded-mode handling and user-facing text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Rejected outgoing content.
    Validation,
    /// Transient network or backend failure.
    Network,
    /// Live feed could not be opened or was closed.
    Subscription,
    /// Local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ChatErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ChatError {
    /// Construct a new error.
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// History fetch failure.
    pub fn fetch_failed(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Network, "fetch_failed", message)
    }

    /// Remote write failure.
    pub fn insert_failed(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Network, "insert_failed", message)
    }

    /// Live subscription failure.
    pub fn subscribe_failed(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Subscription, "subscribe_failed", message)
    }

    /// A completion arrived for a session that is no longer active.
    pub fn stale_session(room: &str, generation: u64) -> Self {
        Self::new(
            ChatErrorCategory::Internal,
            "stale_session",
            format!("session generation {generation} for room '{room}' is no longer active"),
        )
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: RoomSessionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while room session is in state {current:?}"),
        )
    }

    /// Whether re-entering the room may recover from this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ChatErrorCategory::Network | ChatErrorCategory::Subscription | ChatErrorCategory::Storage
        )
    }
}
