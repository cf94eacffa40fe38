use async_trait::async_trait;
use tertulia_core::{Author, ChatError, MessageContent, RemoteMessage};
use tokio::sync::mpsc;

/// Identifies one open live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    room: String,
}

impl SubscriptionHandle {
    pub fn new(id: u64, room: impl Into<String>) -> Self {
        Self {
            id,
            room: room.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }
}

/// Live insert feed for one room.
///
/// Delivery is at-least-once; the feed ends when the backend drops the sender.
#[derive(Debug)]
pub struct RoomSubscription {
    pub handle: SubscriptionHandle,
    pub inserts: mpsc::Receiver<RemoteMessage>,
}

/// Row written by the send pipeline and by automated replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub room: String,
    pub author: Author,
    pub content: MessageContent,
    /// Client-side creation time; backends may replace it with their own clock.
    pub created_at_ms: u64,
    /// Idempotency key; backends that support it echo it on the stored row.
    pub client_txn_id: Option<String>,
}

/// Remote message storage plus its realtime change feed.
#[async_trait]
pub trait MessagingBackend: Send + Sync {
    /// Most recent `limit` rows of `room`, ordered by creation time.
    async fn fetch_messages(
        &self,
        room: &str,
        limit: u16,
        ascending: bool,
    ) -> Result<Vec<RemoteMessage>, ChatError>;

    /// Store one row and return the canonical record with server id and timestamp.
    async fn insert_message(&self, draft: MessageDraft) -> Result<RemoteMessage, ChatError>;

    async fn subscribe_room_inserts(&self, room: &str) -> Result<RoomSubscription, ChatError>;

    /// Close a subscription. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), ChatError>;
}
