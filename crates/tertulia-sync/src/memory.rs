//! In-process loopback implementation of [`MessagingBackend`].
//!
//! Used by the terminal front end when no remote service is configured and by
//! tests, which drive its fault switches.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tertulia_core::{ChatError, RemoteMessage, unix_time_ms};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::backend::{MessageDraft, MessagingBackend, RoomSubscription, SubscriptionHandle};

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Default)]
struct Faults {
    fetch: Option<String>,
    insert: Option<String>,
    subscribe: Option<String>,
    duplicate_delivery: bool,
    drop_client_txn_id: bool,
}

#[derive(Debug)]
struct Subscriber {
    room: String,
    sender: mpsc::Sender<RemoteMessage>,
}

#[derive(Debug, Default)]
struct BackendState {
    rows: Vec<RemoteMessage>,
    next_row_id: u64,
    next_subscription_id: u64,
    last_timestamp_ms: u64,
    subscribers: HashMap<u64, Subscriber>,
    faults: Faults,
    inserts_attempted: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BackendState>,
    writes_open: watch::Sender<bool>,
}

/// Loopback backend: rows live in memory and every insert is fanned out to
/// the room's subscribers.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (writes_open, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BackendState::default()),
                writes_open,
            }),
        }
    }

    /// Store a row directly, as if written by another client before now.
    ///
    /// The row is not delivered to subscribers.
    pub fn seed(&self, row: RemoteMessage) {
        let mut state = self.lock();
        if let Some(at) = row.created_at_ms {
            state.last_timestamp_ms = state.last_timestamp_ms.max(at);
        }
        state.rows.push(row);
    }

    /// Rows stored for `room` in insertion order.
    pub fn rows(&self, room: &str) -> Vec<RemoteMessage> {
        self.lock()
            .rows
            .iter()
            .filter(|row| row.room == room)
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self, room: &str) -> usize {
        self.lock()
            .subscribers
            .values()
            .filter(|subscriber| subscriber.room == room && !subscriber.sender.is_closed())
            .count()
    }

    /// Number of `insert_message` calls received, including failed ones.
    pub fn inserts_attempted(&self) -> usize {
        self.lock().inserts_attempted
    }

    pub fn fail_fetch(&self, reason: Option<&str>) {
        self.lock().faults.fetch = reason.map(str::to_owned);
    }

    pub fn fail_insert(&self, reason: Option<&str>) {
        self.lock().faults.insert = reason.map(str::to_owned);
    }

    pub fn fail_subscribe(&self, reason: Option<&str>) {
        self.lock().faults.subscribe = reason.map(str::to_owned);
    }

    /// Deliver every live insert twice.
    pub fn duplicate_delivery(&self, enabled: bool) {
        self.lock().faults.duplicate_delivery = enabled;
    }

    /// Stop echoing `client_txn_id` on stored rows.
    pub fn drop_client_txn_ids(&self, enabled: bool) {
        self.lock().faults.drop_client_txn_id = enabled;
    }

    /// Park every `insert_message` call until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.shared.writes_open.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.shared.writes_open.send_replace(true);
    }

    /// Push a raw row to the subscribers of its room without storing it.
    pub async fn inject_live(&self, row: RemoteMessage) {
        let targets = self.targets_for(&row.room);
        deliver(&targets, &row).await;
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn targets_for(&self, room: &str) -> Vec<mpsc::Sender<RemoteMessage>> {
        let mut state = self.lock();
        state
            .subscribers
            .retain(|_, subscriber| !subscriber.sender.is_closed());
        let copies = if state.faults.duplicate_delivery { 2 } else { 1 };
        state
            .subscribers
            .values()
            .filter(|subscriber| subscriber.room == room)
            .flat_map(|subscriber| std::iter::repeat_n(subscriber.sender.clone(), copies))
            .collect()
    }

    async fn wait_for_open_writes(&self) -> Result<(), ChatError> {
        let mut writes_open = self.shared.writes_open.subscribe();
        loop {
            let open = *writes_open.borrow_and_update();
            if open {
                return Ok(());
            }
            writes_open
                .changed()
                .await
                .map_err(|_| ChatError::insert_failed("backend shut down"))?;
        }
    }
}

async fn deliver(targets: &[mpsc::Sender<RemoteMessage>], row: &RemoteMessage) {
    for sender in targets {
        if sender.send(row.clone()).await.is_err() {
            trace!(room = %row.room, "subscriber went away during delivery");
        }
    }
}

#[async_trait]
impl MessagingBackend for InMemoryBackend {
    async fn fetch_messages(
        &self,
        room: &str,
        limit: u16,
        ascending: bool,
    ) -> Result<Vec<RemoteMessage>, ChatError> {
        let state = self.lock();
        if let Some(reason) = &state.faults.fetch {
            return Err(ChatError::fetch_failed(reason.clone()));
        }

        let mut rows: Vec<RemoteMessage> = state
            .rows
            .iter()
            .filter(|row| row.room == room)
            .cloned()
            .collect();
        // Stable sort keeps insertion order between equal timestamps.
        rows.sort_by_key(|row| row.created_at_ms.unwrap_or(0));
        let skip = rows.len().saturating_sub(usize::from(limit));
        let mut rows: Vec<RemoteMessage> = rows.into_iter().skip(skip).collect();
        if !ascending {
            rows.reverse();
        }
        debug!(%room, count = rows.len(), "history fetched");
        Ok(rows)
    }

    async fn insert_message(&self, draft: MessageDraft) -> Result<RemoteMessage, ChatError> {
        self.lock().inserts_attempted += 1;
        self.wait_for_open_writes().await?;

        let row = {
            let mut state = self.lock();
            if let Some(reason) = &state.faults.insert {
                return Err(ChatError::insert_failed(reason.clone()));
            }

            state.next_row_id += 1;
            let created_at_ms = unix_time_ms().max(state.last_timestamp_ms);
            state.last_timestamp_ms = created_at_ms;
            let client_txn_id = if state.faults.drop_client_txn_id {
                None
            } else {
                draft.client_txn_id
            };
            let row = RemoteMessage {
                id: format!("srv-{}", state.next_row_id),
                room: draft.room,
                author_id: draft.author.id,
                author_name: draft.author.display_name,
                content: draft.content,
                created_at_ms: Some(created_at_ms),
                client_txn_id,
            };
            state.rows.push(row.clone());
            row
        };

        debug!(room = %row.room, message_id = %row.id, "row stored");
        let targets = self.targets_for(&row.room);
        deliver(&targets, &row).await;
        Ok(row)
    }

    async fn subscribe_room_inserts(&self, room: &str) -> Result<RoomSubscription, ChatError> {
        let mut state = self.lock();
        if let Some(reason) = &state.faults.subscribe {
            warn!(%room, %reason, "subscription refused");
            return Err(ChatError::subscribe_failed(reason.clone()));
        }

        state.next_subscription_id += 1;
        let id = state.next_subscription_id;
        let (sender, inserts) = mpsc::channel(SUBSCRIPTION_BUFFER);
        state.subscribers.insert(
            id,
            Subscriber {
                room: room.to_owned(),
                sender,
            },
        );
        debug!(%room, subscription = id, "subscription opened");
        Ok(RoomSubscription {
            handle: SubscriptionHandle::new(id, room),
            inserts,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), ChatError> {
        if self.lock().subscribers.remove(&handle.id()).is_some() {
            debug!(room = %handle.room(), subscription = handle.id(), "subscription closed");
        }
        Ok(())
    }
}
