//! Frontend-facing state reducer for `tertulia-terminal`.

use std::collections::HashSet;

use tertulia_core::{ChatEvent, DeliveryState, Message, MessageContent, RoomStatus, SendAck};
use tracing::{debug, trace, warn};

const DEFAULT_STATUS: &str = "Sin sala";

/// Timeline row ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: String,
    pub author: String,
    pub text: String,
    pub is_own: bool,
    /// Empty for confirmed messages.
    pub delivery_label: &'static str,
}

/// Full UI snapshot emitted after state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub selected_room: Option<String>,
    pub status_text: String,
    pub messages: Vec<MessageView>,
    pub error_text: Option<String>,
}

/// Mutable view state fed by runtime events and user actions.
#[derive(Debug, Clone)]
pub struct ChatViewState {
    own_user_id: String,
    selected_room: Option<String>,
    messages: Vec<MessageView>,
    status_text: String,
    error_text: Option<String>,
    pending_sends: HashSet<String>,
}

impl ChatViewState {
    pub fn new(own_user_id: impl Into<String>) -> Self {
        Self {
            own_user_id: own_user_id.into(),
            selected_room: None,
            messages: Vec::new(),
            status_text: DEFAULT_STATUS.to_owned(),
            error_text: None,
            pending_sends: HashSet::new(),
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            selected_room: self.selected_room.clone(),
            status_text: self.status_text.clone(),
            messages: self.messages.clone(),
            error_text: self.error_text.clone(),
        }
    }

    pub fn selected_room(&self) -> Option<&str> {
        self.selected_room.as_deref()
    }

    /// Select a room. The previous room's messages are dropped right away so
    /// nothing from it is shown while the new room loads.
    pub fn select_room(&mut self, room: impl Into<String>) {
        let room = room.into();
        debug!(%room, "state selected room");
        self.selected_room = Some(room);
        self.messages.clear();
        self.status_text = status_label(RoomStatus::Loading).to_owned();
        self.error_text = None;
    }

    pub fn clear_error(&mut self) {
        self.error_text = None;
    }

    pub fn mark_send_requested(&mut self, client_txn_id: String) {
        self.pending_sends.insert(client_txn_id);
    }

    pub fn has_pending_sends(&self) -> bool {
        !self.pending_sends.is_empty()
    }

    pub fn handle_send_ack(&mut self, ack: SendAck) {
        self.pending_sends.remove(&ack.client_txn_id);
        if let Some(error_code) = ack.error_code {
            warn!(
                client_txn_id = %ack.client_txn_id,
                error_code = %error_code,
                "send acknowledgement reported failure"
            );
            self.error_text = Some(format!("send failed ({error_code})"));
        } else {
            debug!(client_txn_id = %ack.client_txn_id, "send acknowledgement succeeded");
            self.clear_error();
        }
    }

    /// Feed one runtime event into the reducer.
    pub fn handle_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::RoomStatusChanged { room, status } => {
                if self.is_selected(&room) {
                    self.status_text = status_label(status).to_owned();
                } else {
                    trace!(%room, "ignoring status for unselected room");
                }
            }
            ChatEvent::RoomTimelineSnapshot { room, items } => {
                if !self.is_selected(&room) {
                    trace!(%room, item_count = items.len(), "ignoring snapshot for unselected room");
                    return;
                }
                trace!(%room, item_count = items.len(), "received room timeline snapshot");
                self.messages = items
                    .iter()
                    .map(|message| self.message_view(message))
                    .collect();
            }
            ChatEvent::RoomLeft { room } => {
                if self.is_selected(&room) {
                    debug!(%room, "selected room left");
                    self.selected_room = None;
                    self.messages.clear();
                    self.status_text = DEFAULT_STATUS.to_owned();
                }
            }
            ChatEvent::SendAck(ack) => self.handle_send_ack(ack),
            ChatEvent::RuntimeError {
                code,
                message,
                recoverable,
            } => {
                warn!(%code, %message, recoverable, "runtime error surfaced to state");
                self.error_text = Some(format!("{code}: {message}"));
            }
        }
    }

    fn is_selected(&self, room: &str) -> bool {
        self.selected_room.as_deref() == Some(room)
    }

    fn message_view(&self, message: &Message) -> MessageView {
        MessageView {
            id: message.id.clone(),
            author: message.author.display_name.clone(),
            text: render_content(&message.content),
            is_own: message.author.id == self.own_user_id,
            delivery_label: delivery_label(message.delivery),
        }
    }
}

/// Text shown for a message body. Media renders as `[kind] url caption`.
pub fn render_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text { body } | MessageContent::System { body } => body.clone(),
        MessageContent::Media { url, kind, caption } => match caption {
            Some(caption) => format!("[{}] {url} {caption}", kind.label()),
            None => format!("[{}] {url}", kind.label()),
        },
    }
}

fn status_label(status: RoomStatus) -> &'static str {
    match status {
        RoomStatus::Loading => "Cargando",
        RoomStatus::Live => "En vivo",
        RoomStatus::Degraded => "Sin conexión",
    }
}

fn delivery_label(delivery: DeliveryState) -> &'static str {
    match delivery {
        DeliveryState::Pending => "enviando",
        DeliveryState::Confirmed => "",
        DeliveryState::Failed => "no enviado",
    }
}
