use serde::{Deserialize, Serialize};

/// Author id used for locally generated diagnostic messages.
pub const SYSTEM_AUTHOR_ID: &str = "system";
/// Display name used for locally generated diagnostic messages.
pub const SYSTEM_AUTHOR_NAME: &str = "Sistema";

/// Delivery classification of a message in the merged view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeliveryState {
    /// Accepted locally, remote write not acknowledged yet.
    Pending,
    /// Acknowledged by the backend with a canonical id and timestamp.
    #[default]
    Confirmed,
    /// Remote write failed or never completed; still held in the pending store.
    Failed,
}

/// Room status flag exposed to the presentation layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoomStatus {
    /// History fetch or live subscription still in flight.
    Loading,
    /// History merged and live subscription open.
    Live,
    /// Backend unreachable; serving locally known data.
    Degraded,
}

/// Kind of media attached to a media message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

impl MediaKind {
    /// Short lowercase label, for example `image`.
    pub fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }
}

/// Message payload variants sharing the [`Message`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageContent {
    /// Plain text message.
    Text { body: String },
    /// Media reference with an optional text caption.
    Media {
        url: String,
        kind: MediaKind,
        caption: Option<String>,
    },
    /// Locally generated system notice (never sent to the backend).
    System { body: String },
}

impl MessageContent {
    /// Text suitable for matching and mention detection, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { body } | Self::System { body } => Some(body),
            Self::Media { caption, .. } => caption.as_deref(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }
}

/// Sender identity attached to every message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Author {
    /// Stable author id (user id, `system`, or an automated sender id).
    pub id: String,
    /// Best-effort display name.
    pub display_name: String,
}

impl Author {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Synthetic identity used for diagnostic messages.
    pub fn system() -> Self {
        Self::new(SYSTEM_AUTHOR_ID, SYSTEM_AUTHOR_NAME)
    }
}

/// Canonical chat message used by the merged view, the pending store and snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Provisional client id (`opt-...`) or server-assigned id.
    pub id: String,
    /// Room key this message belongs to.
    pub room: String,
    /// Sender identity.
    pub author: Author,
    /// Payload.
    pub content: MessageContent,
    /// Creation time in milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Client-supplied idempotency key, when known.
    #[serde(default)]
    pub client_txn_id: Option<String>,
    /// Delivery classification.
    #[serde(default)]
    pub delivery: DeliveryState,
}

impl Message {
    pub fn is_confirmed(&self) -> bool {
        self.delivery == DeliveryState::Confirmed
    }
}

/// Outgoing content accepted by the send pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutgoingContent {
    Text(String),
    Media {
        url: String,
        kind: MediaKind,
        caption: Option<String>,
    },
}

impl OutgoingContent {
    pub fn into_message_content(self) -> MessageContent {
        match self {
            Self::Text(body) => MessageContent::Text { body },
            Self::Media { url, kind, caption } => MessageContent::Media { url, kind, caption },
        }
    }
}

/// Message record as delivered by the messaging backend (history rows and live inserts).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteMessage {
    /// Server-assigned id.
    pub id: String,
    /// Room key.
    pub room: String,
    /// Sender id.
    pub author_id: String,
    /// Sender display name.
    pub author_name: String,
    /// Payload.
    pub content: MessageContent,
    /// Server timestamp; `None` when the row arrived without one.
    pub created_at_ms: Option<u64>,
    /// Echoed idempotency key, when the backend supports it.
    pub client_txn_id: Option<String>,
}

/// Viewer identity for the lifetime of a logged-in session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewerContext {
    pub user_id: String,
    pub display_name: String,
}

impl ViewerContext {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn author(&self) -> Author {
        Author::new(self.user_id.clone(), self.display_name.clone())
    }
}

/// Runtime tuning values supplied when the sync runtime is spawned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// History rows requested when entering a room.
    pub history_limit: u16,
    /// Merged view retention cap.
    pub timeline_max_items: usize,
    /// Maximum distance between pending and confirmed timestamps for heuristic matching.
    pub reconcile_window_ms: u64,
    /// Maximum message length in characters.
    pub max_body_len: usize,
    /// Mention-triggered automated reply, disabled when `None`.
    pub auto_reply: Option<AutoReplyConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            timeline_max_items: 1_200,
            reconcile_window_ms: 60_000,
            max_body_len: crate::validation::MAX_BODY_LEN,
            auto_reply: Some(AutoReplyConfig::default()),
        }
    }
}

/// Settings for the mention-triggered automated reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoReplyConfig {
    /// Trigger token matched case-insensitively in outgoing text.
    pub trigger: String,
    /// Identity used for the automated reply.
    pub author: Author,
    /// Lower bound of the randomized reply delay.
    pub min_delay_ms: u64,
    /// Upper bound of the randomized reply delay.
    pub max_delay_ms: u64,
}

impl Default for AutoReplyConfig {
    fn default() -> Self {
        Self {
            trigger: "@bot".to_owned(),
            author: Author::new("bot", "Asistente"),
            min_delay_ms: 1_500,
            max_delay_ms: 4_000,
        }
    }
}

/// Command channel input accepted by the sync runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatCommand {
    /// Tear down the current room session and enter `room`.
    EnterRoom { room: String },
    /// Tear down the current room session without entering another.
    LeaveRoom,
    /// Send a message to the active room.
    Send {
        /// Frontend-provided transaction id echoed in `SendAck`.
        client_txn_id: String,
        content: OutgoingContent,
    },
    /// Re-run the remote write for an undelivered message of the active room.
    RetryPending { message_id: String },
    /// Leave the active room and stop the runtime (logout).
    Shutdown,
}

/// Acknowledgement for send and retry commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Original transaction id.
    pub client_txn_id: String,
    /// Target room.
    pub room: String,
    /// Server id on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Event channel output emitted by the sync runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEvent {
    /// Status of the active room changed.
    RoomStatusChanged { room: String, status: RoomStatus },
    /// The viewer left `room`; its view is discarded.
    RoomLeft { room: String },
    /// Full merged view of the active room, in display order.
    RoomTimelineSnapshot { room: String, items: Vec<Message> },
    /// Send acknowledgement.
    SendAck(SendAck),
    /// Non-fatal runtime failure worth surfacing.
    RuntimeError {
        code: String,
        message: String,
        recoverable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_store_payload_defaults_missing_fields() {
        let raw = r#"{
            "id": "opt-1",
            "room": "General",
            "author": { "id": "u1", "display_name": "Ana" },
            "content": { "Text": { "body": "Hola" } },
            "created_at_ms": 10
        }"#;
        let message: Message = serde_json::from_str(raw).expect("message should parse");
        assert_eq!(message.client_txn_id, None);
        assert_eq!(message.delivery, DeliveryState::Confirmed);
    }

    #[test]
    fn media_caption_is_matchable_text() {
        let content = MessageContent::Media {
            url: "https://cdn.example.org/a.png".into(),
            kind: MediaKind::Image,
            caption: Some("foto".into()),
        };
        assert_eq!(content.text(), Some("foto"));
        assert!(!content.is_system());
    }
}
