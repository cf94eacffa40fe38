use std::{sync::Arc, time::Duration};

use tertulia_core::{
    ChatChannelError, ChatChannels, ChatCommand, ChatError, ChatErrorCategory, ChatEvent,
    EventStream, MediaKind, Message, OutgoingContent, RemoteMessage, RoomStatus, RuntimeConfig,
    SendOutcome, SessionToken, ValidationError, ViewerContext, normalize_remote_message,
    normalize_runtime_error, normalize_send_outcome, unix_time_ms, validate_outgoing,
};
use tertulia_platform::{KeyValueStore, LocalPendingStore};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    auto_reply::{mentions_trigger, spawn_auto_reply},
    backend::{MessagingBackend, RoomSubscription, SubscriptionHandle},
    pipeline::{draft_for, new_client_txn_id, prepare_pending, validation_error},
    session::{RoomSession, SharedPendingStore},
};

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;
/// Upper bound on how long shutdown waits for remote writes to report back.
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors returned by [`ChatRuntimeHandle`] send helpers.
#[derive(Debug, Error)]
pub enum SendRequestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("chat runtime is not running")]
    ChannelClosed,
}

impl From<ChatChannelError> for SendRequestError {
    fn from(_: ChatChannelError) -> Self {
        Self::ChannelClosed
    }
}

/// Cloneable front door to a running [`spawn_runtime`] actor.
#[derive(Clone, Debug)]
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
    max_body_len: usize,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    pub async fn switch_room(&self, room: impl Into<String>) -> Result<(), ChatChannelError> {
        self.send(ChatCommand::EnterRoom { room: room.into() }).await
    }

    pub async fn leave_room(&self) -> Result<(), ChatChannelError> {
        self.send(ChatCommand::LeaveRoom).await
    }

    /// Queue a text message. Invalid content is rejected here, before any I/O.
    ///
    /// Returns the client transaction id echoed by the matching `SendAck`.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<String, SendRequestError> {
        self.send_content(OutgoingContent::Text(text.into())).await
    }

    pub async fn send_media(
        &self,
        url: impl Into<String>,
        kind: MediaKind,
        caption: Option<String>,
    ) -> Result<String, SendRequestError> {
        self.send_content(OutgoingContent::Media {
            url: url.into(),
            kind,
            caption,
        })
        .await
    }

    /// Resend an undelivered message of the active room.
    pub async fn retry(&self, message_id: impl Into<String>) -> Result<(), ChatChannelError> {
        self.send(ChatCommand::RetryPending {
            message_id: message_id.into(),
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<(), ChatChannelError> {
        self.send(ChatCommand::Shutdown).await
    }

    async fn send_content(&self, content: OutgoingContent) -> Result<String, SendRequestError> {
        let content = validate_outgoing(content, self.max_body_len)?;
        let client_txn_id = new_client_txn_id();
        self.send(ChatCommand::Send {
            client_txn_id: client_txn_id.clone(),
            content,
        })
        .await?;
        Ok(client_txn_id)
    }
}

/// Start the sync actor for one logged-in viewer.
pub fn spawn_runtime(
    backend: Arc<dyn MessagingBackend>,
    store: Arc<dyn KeyValueStore>,
    viewer: ViewerContext,
    config: RuntimeConfig,
) -> ChatRuntimeHandle {
    let (channels, command_rx) = ChatChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let max_body_len = config.max_body_len;
    let runtime = ChatRuntime::new(
        channels.clone(),
        command_rx,
        backend,
        Arc::new(LocalPendingStore::new(store)),
        viewer,
        config,
    );
    tokio::spawn(async move {
        runtime.run().await;
    });

    ChatRuntimeHandle {
        channels,
        max_body_len,
    }
}

/// Results of spawned I/O, reported back to the actor.
#[derive(Debug)]
enum Completion {
    History {
        token: SessionToken,
        result: Result<Vec<RemoteMessage>, ChatError>,
    },
    Subscribed {
        token: SessionToken,
        result: Result<RoomSubscription, ChatError>,
    },
    LiveInsert {
        token: SessionToken,
        row: RemoteMessage,
    },
    LiveClosed {
        token: SessionToken,
    },
    WriteFinished {
        room: String,
        provisional_id: String,
        client_txn_id: String,
        result: Result<RemoteMessage, ChatError>,
    },
}

#[derive(Debug)]
struct LiveFeed {
    token: SessionToken,
    handle: SubscriptionHandle,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct ChatRuntime {
    channels: ChatChannels,
    command_rx: mpsc::Receiver<ChatCommand>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    backend: Arc<dyn MessagingBackend>,
    session: RoomSession,
    viewer: ViewerContext,
    config: RuntimeConfig,
    live: Option<LiveFeed>,
    last_status: Option<(String, RoomStatus)>,
    shutdown: CancellationToken,
}

impl ChatRuntime {
    fn new(
        channels: ChatChannels,
        command_rx: mpsc::Receiver<ChatCommand>,
        backend: Arc<dyn MessagingBackend>,
        pending: SharedPendingStore,
        viewer: ViewerContext,
        config: RuntimeConfig,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            channels,
            command_rx,
            completion_tx,
            completion_rx,
            backend,
            session: RoomSession::new(pending, &config),
            viewer,
            config,
            live: None,
            last_status: None,
            shutdown: CancellationToken::new(),
        }
    }

    async fn run(mut self) {
        info!(user_id = %self.viewer.user_id, "chat runtime started");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    if matches!(command, ChatCommand::Shutdown) {
                        break;
                    }
                    self.handle_command(command).await;
                }
                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion).await;
                }
            }
        }

        self.drain_writes().await;
        self.leave().await;
        self.shutdown.cancel();
        info!(user_id = %self.viewer.user_id, "chat runtime stopped");
    }

    /// Apply outstanding write completions so their acks go out and confirmed
    /// entries leave the pending store. Other completions are dropped.
    async fn drain_writes(&mut self) {
        if !self.session.has_writes_in_flight() {
            return;
        }
        debug!("waiting for in-flight writes before shutdown");
        let drained = tokio::time::timeout(WRITE_DRAIN_TIMEOUT, async {
            while self.session.has_writes_in_flight() {
                match self.completion_rx.recv().await {
                    Some(completion @ Completion::WriteFinished { .. }) => {
                        self.handle_completion(completion).await;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                timeout_ms = WRITE_DRAIN_TIMEOUT.as_millis() as u64,
                "in-flight writes abandoned at shutdown; entries stay in the pending store"
            );
        }
    }

    async fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::EnterRoom { room } => self.enter(room).await,
            ChatCommand::LeaveRoom => self.leave().await,
            ChatCommand::Send {
                client_txn_id,
                content,
            } => self.handle_send(client_txn_id, content),
            ChatCommand::RetryPending { message_id } => self.handle_retry(message_id),
            ChatCommand::Shutdown => {}
        }
    }

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::History { token, result } => {
                let failure = result.as_ref().err().cloned();
                if self.session.on_history(&token, result, unix_time_ms()) {
                    self.emit_status();
                    self.emit_snapshot();
                    if let Some(err) = failure {
                        self.channels.emit(normalize_runtime_error(err));
                    }
                }
            }
            Completion::Subscribed { token, result } => self.on_subscribed(token, result).await,
            Completion::LiveInsert { token, row } => {
                if self.session.on_live(&token, row, unix_time_ms()) {
                    self.emit_snapshot();
                }
            }
            Completion::LiveClosed { token } => {
                let owns_feed = self
                    .live
                    .as_ref()
                    .is_some_and(|feed| feed.token == token);
                if owns_feed && self.session.on_live_closed(&token) {
                    self.close_live_feed().await;
                    self.emit_status();
                    self.channels.emit(normalize_runtime_error(ChatError::new(
                        ChatErrorCategory::Subscription,
                        "live_feed_closed",
                        format!("live feed for '{}' closed", token.room()),
                    )));
                }
            }
            Completion::WriteFinished {
                room,
                provisional_id,
                client_txn_id,
                result,
            } => {
                let outcome = match &result {
                    Ok(row) => SendOutcome::Success {
                        message_id: row.id.clone(),
                    },
                    Err(error) => SendOutcome::Failure {
                        error: error.clone(),
                    },
                };
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    room.clone(),
                    outcome,
                ));
                let confirmed = result.map(|row| normalize_remote_message(row, unix_time_ms()));
                if self
                    .session
                    .on_write_finished(&room, &provisional_id, confirmed)
                {
                    self.emit_snapshot();
                }
            }
        }
    }

    async fn enter(&mut self, room: String) {
        let room = room.trim().to_owned();
        if room.is_empty() {
            self.channels.emit(normalize_runtime_error(ChatError::new(
                ChatErrorCategory::Validation,
                "invalid_room",
                "room key must not be empty",
            )));
            return;
        }

        // The previous feed is fully closed before anything is started for the new room.
        self.close_live_feed().await;
        let token = self.session.begin(&room);
        info!(%room, generation = token.generation(), "entering room");
        self.last_status = None;
        self.emit_status();
        self.emit_snapshot();
        self.spawn_load(token);
    }

    async fn leave(&mut self) {
        self.close_live_feed().await;
        if let Some(room) = self.session.end() {
            info!(%room, "left room");
            self.last_status = None;
            self.channels.emit(ChatEvent::RoomLeft { room });
        }
    }

    fn spawn_load(&self, token: SessionToken) {
        let backend = self.backend.clone();
        let completions = self.completion_tx.clone();
        let history_token = token.clone();
        let limit = self.config.history_limit;
        tokio::spawn(async move {
            let result = backend
                .fetch_messages(history_token.room(), limit, true)
                .await;
            let _ = completions.send(Completion::History {
                token: history_token,
                result,
            });
        });

        let backend = self.backend.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = backend.subscribe_room_inserts(token.room()).await;
            let _ = completions.send(Completion::Subscribed { token, result });
        });
    }

    async fn on_subscribed(
        &mut self,
        token: SessionToken,
        result: Result<RoomSubscription, ChatError>,
    ) {
        match result {
            Ok(subscription) => {
                if !self.session.on_subscribed(&token) {
                    debug!(room = %token.room(), "closing feed of a stale session");
                    self.unsubscribe(subscription.handle).await;
                    return;
                }
                self.close_live_feed().await;

                let stop = CancellationToken::new();
                let task = tokio::spawn(forward_live(
                    token.clone(),
                    subscription.inserts,
                    self.completion_tx.clone(),
                    stop.child_token(),
                ));
                self.live = Some(LiveFeed {
                    token,
                    handle: subscription.handle,
                    stop,
                    task,
                });
                self.emit_status();
            }
            Err(err) => {
                if self.session.on_subscribe_failed(&token, &err) {
                    self.emit_status();
                    self.channels.emit(normalize_runtime_error(err));
                }
            }
        }
    }

    async fn close_live_feed(&mut self) {
        let Some(feed) = self.live.take() else {
            return;
        };
        feed.stop.cancel();
        if let Err(err) = feed.task.await {
            warn!(room = %feed.token.room(), error = %err, "live forwarder ended abnormally");
        }
        self.unsubscribe(feed.handle).await;
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let room = handle.room().to_owned();
        if let Err(err) = self.backend.unsubscribe(handle).await {
            warn!(%room, error = %err, "unsubscribe failed");
        }
    }

    fn handle_send(&mut self, client_txn_id: String, content: OutgoingContent) {
        let Some(room) = self.session.active_room().map(str::to_owned) else {
            let error = ChatError::invalid_state(self.session.state(), "send");
            self.channels.emit(normalize_send_outcome(
                client_txn_id,
                String::new(),
                SendOutcome::Failure { error },
            ));
            return;
        };

        let message = match prepare_pending(
            &self.viewer,
            &room,
            client_txn_id.clone(),
            content,
            self.config.max_body_len,
            unix_time_ms(),
        ) {
            Ok(message) => message,
            Err(err) => {
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    room,
                    SendOutcome::Failure {
                        error: validation_error(&err),
                    },
                ));
                return;
            }
        };

        debug!(%room, message_id = %message.id, %client_txn_id, "sending message");
        let mentions_bot = self
            .config
            .auto_reply
            .as_ref()
            .is_some_and(|auto| mentions_trigger(&message.content, &auto.trigger));

        if self.session.optimistic_insert(message.clone()) {
            self.emit_snapshot();
        }
        self.spawn_write(message);

        if mentions_bot && let Some(auto) = &self.config.auto_reply {
            spawn_auto_reply(
                self.backend.clone(),
                auto,
                room,
                self.shutdown.child_token(),
            );
        }
    }

    fn handle_retry(&mut self, message_id: String) {
        match self.session.begin_retry(&message_id) {
            Some(message) => {
                info!(room = %message.room, %message_id, "retrying undelivered message");
                self.emit_snapshot();
                self.spawn_write(message);
            }
            None => self.channels.emit(normalize_runtime_error(ChatError::new(
                ChatErrorCategory::Validation,
                "retry_unavailable",
                format!("message '{message_id}' is not an undelivered message of the active room"),
            ))),
        }
    }

    fn spawn_write(&self, message: Message) {
        let draft = draft_for(&message);
        let backend = self.backend.clone();
        let completions = self.completion_tx.clone();
        let room = message.room;
        let provisional_id = message.id;
        let client_txn_id = message.client_txn_id.unwrap_or_default();
        tokio::spawn(async move {
            let result = backend.insert_message(draft).await;
            let _ = completions.send(Completion::WriteFinished {
                room,
                provisional_id,
                client_txn_id,
                result,
            });
        });
    }

    fn emit_status(&mut self) {
        let (Some(room), Some(status)) = (self.session.active_room(), self.session.status()) else {
            return;
        };
        let current = (room.to_owned(), status);
        if self.last_status.as_ref() == Some(&current) {
            return;
        }
        debug!(room = %current.0, ?status, "room status changed");
        self.last_status = Some(current.clone());
        self.channels.emit(ChatEvent::RoomStatusChanged {
            room: current.0,
            status,
        });
    }

    fn emit_snapshot(&self) {
        if let Some((room, items)) = self.session.snapshot() {
            self.channels
                .emit(ChatEvent::RoomTimelineSnapshot { room, items });
        }
    }
}

async fn forward_live(
    token: SessionToken,
    mut inserts: mpsc::Receiver<RemoteMessage>,
    completions: mpsc::UnboundedSender<Completion>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            row = inserts.recv() => {
                let completion = match row {
                    Some(row) => Completion::LiveInsert { token: token.clone(), row },
                    None => {
                        let _ = completions.send(Completion::LiveClosed { token });
                        return;
                    }
                };
                if completions.send(completion).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use std::time::Duration;
    use tertulia_core::{
        AutoReplyConfig, Author, DeliveryState, MessageContent, SYSTEM_AUTHOR_ID, SendAck,
    };
    use tertulia_platform::InMemoryKeyValueStore;
    use tokio::{sync::broadcast::error::RecvError, time::timeout};

    struct Harness {
        backend: InMemoryBackend,
        kv: InMemoryKeyValueStore,
        handle: ChatRuntimeHandle,
        events: EventStream,
    }

    fn harness_with(backend: InMemoryBackend, kv: InMemoryKeyValueStore) -> Harness {
        let config = RuntimeConfig {
            auto_reply: None,
            ..RuntimeConfig::default()
        };
        harness_with_config(backend, kv, config)
    }

    fn harness_with_config(
        backend: InMemoryBackend,
        kv: InMemoryKeyValueStore,
        config: RuntimeConfig,
    ) -> Harness {
        let handle = spawn_runtime(
            Arc::new(backend.clone()),
            Arc::new(kv.clone()),
            ViewerContext::new("u1", "Ana"),
            config,
        );
        let events = handle.subscribe();
        Harness {
            backend,
            kv,
            handle,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(InMemoryBackend::new(), InMemoryKeyValueStore::default())
    }

    async fn next_matching<T>(
        events: &mut EventStream,
        mut pick: impl FnMut(ChatEvent) -> Option<T>,
    ) -> T {
        timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(value) = pick(event) {
                            return value;
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("event timeout")
    }

    async fn wait_status(events: &mut EventStream, room: &str, wanted: RoomStatus) {
        next_matching(events, |event| match event {
            ChatEvent::RoomStatusChanged { room: r, status } if r == room && status == wanted => {
                Some(())
            }
            _ => None,
        })
        .await
    }

    async fn wait_snapshot(
        events: &mut EventStream,
        room: &str,
        mut accept: impl FnMut(&[Message]) -> bool,
    ) -> Vec<Message> {
        next_matching(events, |event| match event {
            ChatEvent::RoomTimelineSnapshot { room: r, items } if r == room && accept(&items) => {
                Some(items)
            }
            _ => None,
        })
        .await
    }

    /// Wait until `room` reports `wanted` and its latest snapshot satisfies `accept`,
    /// whichever order the two events arrive in.
    async fn wait_settled(
        events: &mut EventStream,
        room: &str,
        wanted: RoomStatus,
        mut accept: impl FnMut(&[Message]) -> bool,
    ) -> Vec<Message> {
        let mut status_reached = false;
        let mut latest: Option<Vec<Message>> = None;
        next_matching(events, |event| {
            match event {
                ChatEvent::RoomStatusChanged { room: r, status } if r == room => {
                    status_reached = status == wanted;
                }
                ChatEvent::RoomTimelineSnapshot { room: r, items } => {
                    assert!(items.iter().all(|item| item.room == r), "mixed rooms in view");
                    if r == room {
                        latest = accept(&items).then_some(items);
                    }
                }
                _ => {}
            }
            if status_reached { latest.take() } else { None }
        })
        .await
    }

    async fn wait_ack(events: &mut EventStream) -> SendAck {
        next_matching(events, |event| match event {
            ChatEvent::SendAck(ack) => Some(ack),
            _ => None,
        })
        .await
    }

    fn row(id: &str, room: &str, body: &str, at: u64) -> RemoteMessage {
        RemoteMessage {
            id: id.to_owned(),
            room: room.to_owned(),
            author_id: "u2".to_owned(),
            author_name: "Luis".to_owned(),
            content: MessageContent::Text {
                body: body.to_owned(),
            },
            created_at_ms: Some(at),
            client_txn_id: None,
        }
    }

    fn own_row(id: &str, room: &str, body: &str, at: u64) -> RemoteMessage {
        RemoteMessage {
            author_id: "u1".to_owned(),
            author_name: "Ana".to_owned(),
            ..row(id, room, body, at)
        }
    }

    fn body(message: &Message) -> &str {
        message.content.text().unwrap_or_default()
    }

    #[tokio::test]
    async fn failed_fetch_serves_pending_entries_with_diagnostic() {
        let kv = InMemoryKeyValueStore::default();
        let seeded: Arc<dyn KeyValueStore> = Arc::new(kv.clone());
        LocalPendingStore::new(seeded).append(
            "General",
            Message {
                id: "opt-1".into(),
                room: "General".into(),
                author: Author::new("u1", "Ana"),
                content: MessageContent::Text {
                    body: "Hola".into(),
                },
                created_at_ms: 1_000,
                client_txn_id: None,
                delivery: DeliveryState::Pending,
            },
        );
        let backend = InMemoryBackend::new();
        backend.fail_fetch(Some("connection refused"));
        let mut h = harness_with(backend, kv);

        h.handle.switch_room("General").await.expect("enqueue");
        let items = wait_settled(&mut h.events, "General", RoomStatus::Degraded, |items| {
            items.len() == 2
        })
        .await;

        assert_eq!(items[0].id, "opt-1");
        assert_eq!(body(&items[0]), "Hola");
        assert_eq!(items[1].author.id, SYSTEM_AUTHOR_ID);
        assert!(body(&items[1]).starts_with("⚠️ ERROR DB"));
    }

    #[tokio::test]
    async fn redelivered_live_insert_appears_once() {
        let mut h = harness();
        h.backend.duplicate_delivery(true);

        h.handle.switch_room("España").await.expect("enqueue");
        wait_status(&mut h.events, "España", RoomStatus::Live).await;

        h.backend.inject_live(row("srv-7", "España", "hola", 10)).await;
        h.backend.inject_live(row("srv-8", "España", "fin", 20)).await;

        let items = wait_snapshot(&mut h.events, "España", |items| {
            items.iter().any(|item| item.id == "srv-8")
        })
        .await;
        assert_eq!(items.iter().filter(|item| item.id == "srv-7").count(), 1);
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn send_is_visible_before_the_write_completes() {
        let mut h = harness();
        h.handle.switch_room("General").await.expect("enqueue");
        wait_status(&mut h.events, "General", RoomStatus::Live).await;

        h.backend.hold_writes();
        let txn = h.handle.send_text("hello").await.expect("valid text");

        let items = wait_snapshot(&mut h.events, "General", |items| !items.is_empty()).await;
        assert_eq!(items.len(), 1);
        assert_eq!(body(&items[0]), "hello");
        assert_eq!(items[0].delivery, DeliveryState::Pending);
        assert!(items[0].id.starts_with("opt-"));
        assert!(h.backend.rows("General").is_empty());

        h.backend.release_writes();
        let ack = wait_ack(&mut h.events).await;
        assert_eq!(ack.client_txn_id, txn);
        let server_id = ack.message_id.expect("write should succeed");

        let items = wait_snapshot(&mut h.events, "General", |items| {
            items.iter().any(|item| item.id == server_id)
        })
        .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].delivery, DeliveryState::Confirmed);

        let store = LocalPendingStore::new(h.kv.clone());
        assert!(store.list_for_room("General").is_empty());
    }

    #[tokio::test]
    async fn heuristic_reconciliation_without_txn_echo() {
        let mut h = harness();
        h.backend.drop_client_txn_ids(true);
        h.handle.switch_room("General").await.expect("enqueue");
        wait_status(&mut h.events, "General", RoomStatus::Live).await;

        h.handle.send_text("hi").await.expect("valid text");
        let ack = wait_ack(&mut h.events).await;
        assert!(ack.error_code.is_none());

        // Give the live echo time to land as well.
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.handle.send_text("marker").await.expect("valid text");
        let items = wait_snapshot(&mut h.events, "General", |items| {
            items
                .iter()
                .any(|item| body(item) == "marker" && item.is_confirmed())
        })
        .await;

        let greetings: Vec<&Message> = items.iter().filter(|item| body(item) == "hi").collect();
        assert_eq!(greetings.len(), 1);
        assert!(greetings[0].is_confirmed());
        assert!(greetings[0].id.starts_with("srv-"));
    }

    #[tokio::test]
    async fn repeating_recent_text_is_still_shown_optimistically() {
        let mut h = harness();
        h.backend.drop_client_txn_ids(true);
        h.backend
            .seed(own_row("srv-old", "General", "hi", unix_time_ms() - 5_000));
        h.handle.switch_room("General").await.expect("enqueue");
        wait_settled(&mut h.events, "General", RoomStatus::Live, |items| {
            items.len() == 1
        })
        .await;

        h.backend.hold_writes();
        h.handle.send_text("hi").await.expect("valid text");
        let items = wait_snapshot(&mut h.events, "General", |items| items.len() == 2).await;
        assert_eq!(items[0].id, "srv-old");
        assert!(items[1].id.starts_with("opt-"));
        assert_eq!(items[1].delivery, DeliveryState::Pending);

        h.backend.release_writes();
        let items = wait_snapshot(&mut h.events, "General", |items| {
            items.iter().all(Message::is_confirmed)
        })
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "srv-old");
        assert!(items[1].id.starts_with("srv-"));
        assert_ne!(items[1].id, "srv-old");
    }

    #[tokio::test]
    async fn undelivered_repeat_survives_reentry() {
        let mut h = harness();
        h.backend.drop_client_txn_ids(true);
        h.backend
            .seed(own_row("srv-old", "General", "hi", unix_time_ms() - 5_000));
        h.handle.switch_room("General").await.expect("enqueue");
        wait_settled(&mut h.events, "General", RoomStatus::Live, |items| {
            items.len() == 1
        })
        .await;

        h.backend.fail_insert(Some("offline"));
        h.handle.send_text("hi").await.expect("valid text");
        let ack = wait_ack(&mut h.events).await;
        assert_eq!(ack.error_code.as_deref(), Some("insert_failed"));
        let store = LocalPendingStore::new(h.kv.clone());
        assert_eq!(store.list_for_room("General").len(), 1);

        h.backend.fail_insert(None);
        h.handle.switch_room("General").await.expect("enqueue");
        let items = wait_settled(&mut h.events, "General", RoomStatus::Live, |items| {
            items.len() == 2
        })
        .await;
        assert_eq!(items[0].id, "srv-old");
        assert!(items[1].id.starts_with("opt-"));
        assert_eq!(items[1].delivery, DeliveryState::Failed);
        assert_eq!(store.list_for_room("General").len(), 1);
        assert_eq!(h.backend.rows("General").len(), 1);
    }

    #[tokio::test]
    async fn switching_rooms_never_mixes_messages() {
        let mut h = harness();
        h.backend.seed(row("srv-g1", "General", "general", 1));
        h.backend.seed(row("srv-i1", "Italia", "italia", 2));

        h.handle.switch_room("General").await.expect("enqueue");
        wait_status(&mut h.events, "General", RoomStatus::Live).await;
        h.handle.switch_room("Italia").await.expect("enqueue");
        let items = wait_settled(&mut h.events, "Italia", RoomStatus::Live, |items| {
            !items.is_empty()
        })
        .await;
        assert_eq!(items[0].id, "srv-i1");

        h.backend.inject_live(row("srv-g2", "General", "late", 3)).await;
        h.backend.inject_live(row("srv-i2", "Italia", "dopo", 4)).await;
        let items = wait_snapshot(&mut h.events, "Italia", |items| {
            items.iter().any(|item| item.id == "srv-i2")
        })
        .await;
        let ids: Vec<&str> = items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["srv-i1", "srv-i2"]);
        assert_eq!(h.backend.subscriber_count("General"), 0);
    }

    #[tokio::test]
    async fn stale_subscription_is_closed() {
        let mut h = harness();
        h.handle.switch_room("General").await.expect("enqueue");
        h.handle.switch_room("Italia").await.expect("enqueue");
        wait_status(&mut h.events, "Italia", RoomStatus::Live).await;

        timeout(Duration::from_secs(5), async {
            while h.backend.subscriber_count("General") > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stale feed should be closed");
        assert_eq!(h.backend.subscriber_count("Italia"), 1);
    }

    #[tokio::test]
    async fn failed_write_stays_and_can_be_retried() {
        let mut h = harness();
        h.handle.switch_room("General").await.expect("enqueue");
        wait_status(&mut h.events, "General", RoomStatus::Live).await;

        h.backend.fail_insert(Some("write rejected"));
        h.handle.send_text("hola").await.expect("valid text");
        let ack = wait_ack(&mut h.events).await;
        assert_eq!(ack.error_code.as_deref(), Some("insert_failed"));

        let items = wait_snapshot(&mut h.events, "General", |items| {
            items
                .first()
                .is_some_and(|item| item.delivery == DeliveryState::Failed)
        })
        .await;
        let failed_id = items[0].id.clone();
        let store = LocalPendingStore::new(h.kv.clone());
        assert_eq!(store.list_for_room("General").len(), 1);

        h.backend.fail_insert(None);
        h.handle.retry(failed_id).await.expect("enqueue");
        let ack = wait_ack(&mut h.events).await;
        assert!(ack.message_id.is_some());
        wait_snapshot(&mut h.events, "General", |items| {
            items.len() == 1 && items[0].is_confirmed()
        })
        .await;
        assert!(store.list_for_room("General").is_empty());
        assert_eq!(h.backend.rows("General").len(), 1);
    }

    #[tokio::test]
    async fn retry_of_unknown_message_reports_error() {
        let mut h = harness();
        h.handle.switch_room("General").await.expect("enqueue");
        h.handle.retry("opt-missing").await.expect("enqueue");

        let code = next_matching(&mut h.events, |event| match event {
            ChatEvent::RuntimeError { code, .. } => Some(code),
            _ => None,
        })
        .await;
        assert_eq!(code, "retry_unavailable");
    }

    #[tokio::test]
    async fn invalid_content_is_rejected_synchronously() {
        let h = harness();
        let err = h
            .handle
            .send_text("   ")
            .await
            .expect_err("blank text must fail");
        assert!(matches!(err, SendRequestError::Validation(ValidationError::Empty)));

        let err = h
            .handle
            .send_media("ftp://example.org/a.png", MediaKind::Image, None)
            .await
            .expect_err("ftp url must fail");
        assert!(matches!(
            err,
            SendRequestError::Validation(ValidationError::InvalidMediaUrl(_))
        ));
        assert_eq!(h.backend.inserts_attempted(), 0);
    }

    #[tokio::test]
    async fn send_without_room_is_acknowledged_as_failure() {
        let mut h = harness();
        let txn = h.handle.send_text("hola").await.expect("valid text");
        let ack = wait_ack(&mut h.events).await;
        assert_eq!(ack.client_txn_id, txn);
        assert_eq!(ack.error_code.as_deref(), Some("invalid_state_transition"));
    }

    #[tokio::test]
    async fn subscription_failure_degrades_but_keeps_history() {
        let mut h = harness();
        h.backend.seed(row("srv-1", "General", "hola", 1));
        h.backend.fail_subscribe(Some("socket closed"));

        h.handle.switch_room("General").await.expect("enqueue");
        let items = wait_settled(&mut h.events, "General", RoomStatus::Degraded, |items| {
            !items.is_empty()
        })
        .await;
        assert_eq!(items[0].id, "srv-1");
        assert!(items.iter().all(|item| item.author.id != SYSTEM_AUTHOR_ID));

        // Re-entering retries the subscription.
        h.backend.fail_subscribe(None);
        h.handle.switch_room("General").await.expect("enqueue");
        wait_status(&mut h.events, "General", RoomStatus::Live).await;
    }

    #[tokio::test]
    async fn leaving_closes_the_feed_and_keeps_pending() {
        let mut h = harness();
        h.handle.switch_room("General").await.expect("enqueue");
        wait_status(&mut h.events, "General", RoomStatus::Live).await;

        h.backend.hold_writes();
        h.handle.send_text("pendiente").await.expect("valid text");
        h.handle.leave_room().await.expect("enqueue");

        let left = next_matching(&mut h.events, |event| match event {
            ChatEvent::RoomLeft { room } => Some(room),
            _ => None,
        })
        .await;
        assert_eq!(left, "General");
        assert_eq!(h.backend.subscriber_count("General"), 0);
        let store = LocalPendingStore::new(h.kv.clone());
        assert_eq!(store.list_for_room("General").len(), 1);

        // The write completes after leaving: the store is cleaned up anyway.
        h.backend.release_writes();
        let ack = wait_ack(&mut h.events).await;
        assert!(ack.message_id.is_some());
        assert!(store.list_for_room("General").is_empty());
    }

    #[tokio::test]
    async fn mention_triggers_automated_reply() {
        let config = RuntimeConfig {
            auto_reply: Some(AutoReplyConfig {
                min_delay_ms: 0,
                max_delay_ms: 10,
                ..AutoReplyConfig::default()
            }),
            ..RuntimeConfig::default()
        };
        let mut h = harness_with_config(
            InMemoryBackend::new(),
            InMemoryKeyValueStore::default(),
            config,
        );
        h.handle.switch_room("General").await.expect("enqueue");
        wait_status(&mut h.events, "General", RoomStatus::Live).await;

        h.handle.send_text("Hola @Bot").await.expect("valid text");
        let items = wait_snapshot(&mut h.events, "General", |items| {
            items.iter().any(|item| item.author.id == "bot")
        })
        .await;
        let reply = items
            .iter()
            .find(|item| item.author.id == "bot")
            .expect("reply present");
        assert_eq!(reply.author.display_name, "Asistente");
    }

    #[tokio::test]
    async fn shutdown_leaves_the_room() {
        let mut h = harness();
        h.handle.switch_room("General").await.expect("enqueue");
        wait_status(&mut h.events, "General", RoomStatus::Live).await;

        h.handle.shutdown().await.expect("enqueue");
        let left = next_matching(&mut h.events, |event| match event {
            ChatEvent::RoomLeft { room } => Some(room),
            _ => None,
        })
        .await;
        assert_eq!(left, "General");
        assert_eq!(h.backend.subscriber_count("General"), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_writes() {
        let mut h = harness();
        h.handle.switch_room("General").await.expect("enqueue");
        wait_status(&mut h.events, "General", RoomStatus::Live).await;

        h.backend.hold_writes();
        let txn = h.handle.send_text("última").await.expect("valid text");
        wait_snapshot(&mut h.events, "General", |items| items.len() == 1).await;

        h.handle.shutdown().await.expect("enqueue");
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.backend.release_writes();

        let ack = wait_ack(&mut h.events).await;
        assert_eq!(ack.client_txn_id, txn);
        assert!(ack.message_id.is_some());
        let left = next_matching(&mut h.events, |event| match event {
            ChatEvent::RoomLeft { room } => Some(room),
            _ => None,
        })
        .await;
        assert_eq!(left, "General");
        let store = LocalPendingStore::new(h.kv.clone());
        assert!(store.list_for_room("General").is_empty());
        assert_eq!(h.backend.rows("General").len(), 1);
    }
}
