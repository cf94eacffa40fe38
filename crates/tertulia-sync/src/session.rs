//! The viewer's session with one room: merged view, lifecycle and the pending
//! store bookkeeping that goes with them.
//!
//! Everything here is synchronous. The runtime performs the I/O and feeds the
//! outcomes back in, tagged with the [`SessionToken`] they were started under.

use std::{collections::HashSet, sync::Arc};

use tertulia_core::{
    ChatError, DeliveryState, MergeOutcome, MergedTimeline, Message, RemoteMessage,
    RoomSessionMachine, RoomSessionState, RoomStatus, RuntimeConfig, SessionToken,
    history_diagnostic, normalize_remote_message,
};
use tertulia_platform::{KeyValueStore, LocalPendingStore};
use tracing::{debug, info, warn};

/// Pending store shared between the runtime and its spawned writes.
pub type SharedPendingStore = Arc<LocalPendingStore<Arc<dyn KeyValueStore>>>;

pub struct RoomSession {
    machine: RoomSessionMachine,
    timeline: Option<MergedTimeline>,
    pending: SharedPendingStore,
    in_flight: HashSet<String>,
    timeline_max_items: usize,
    reconcile_window_ms: u64,
}

impl RoomSession {
    pub fn new(pending: SharedPendingStore, config: &RuntimeConfig) -> Self {
        Self {
            machine: RoomSessionMachine::default(),
            timeline: None,
            pending,
            in_flight: HashSet::new(),
            timeline_max_items: config.timeline_max_items,
            reconcile_window_ms: config.reconcile_window_ms,
        }
    }

    pub fn active_room(&self) -> Option<&str> {
        self.machine.active_room()
    }

    pub fn state(&self) -> RoomSessionState {
        self.machine.state()
    }

    pub fn status(&self) -> Option<RoomStatus> {
        self.machine.status()
    }

    pub fn is_current(&self, token: &SessionToken) -> bool {
        self.machine.is_current(token)
    }

    /// Merged view of the active room in display order.
    pub fn snapshot(&self) -> Option<(String, Vec<Message>)> {
        self.timeline
            .as_ref()
            .map(|timeline| (timeline.room().to_owned(), timeline.snapshot()))
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.timeline.as_ref()?.get(message_id)
    }

    pub fn is_in_flight(&self, message_id: &str) -> bool {
        self.in_flight.contains(message_id)
    }

    /// Whether any remote write started here has not reported back yet.
    pub fn has_writes_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Enter `room` and show its buffered entries right away.
    ///
    /// Entries whose write is not running in this process are shown as failed.
    pub fn begin(&mut self, room: &str) -> SessionToken {
        let token = self.machine.enter(room);
        let mut timeline =
            MergedTimeline::new(room, self.timeline_max_items, self.reconcile_window_ms);

        for mut entry in self.pending.list_for_room(room) {
            entry.delivery = if self.in_flight.contains(&entry.id) {
                DeliveryState::Pending
            } else {
                DeliveryState::Failed
            };
            timeline.add_pending(entry);
        }

        debug!(
            %room,
            generation = token.generation(),
            buffered = timeline.len(),
            "room session loading"
        );
        self.timeline = Some(timeline);
        token
    }

    /// Drop the view. Buffered entries stay in the pending store.
    pub fn end(&mut self) -> Option<String> {
        self.timeline = None;
        let room = self.machine.leave();
        if let Some(room) = &room {
            debug!(%room, "room session closed");
        }
        room
    }

    /// Merge the history fetch result. Returns whether the view changed.
    pub fn on_history(
        &mut self,
        token: &SessionToken,
        result: Result<Vec<RemoteMessage>, ChatError>,
        now_ms: u64,
    ) -> bool {
        if !self.is_current(token) {
            debug!(room = %token.room(), generation = token.generation(), "dropping stale history");
            return false;
        }
        let Some(timeline) = self.timeline.as_mut() else {
            return false;
        };

        match result {
            Ok(rows) => {
                let count = rows.len();
                let history = rows
                    .into_iter()
                    .map(|row| normalize_remote_message(row, now_ms))
                    .collect();
                let reconciled = timeline.seed_history(history);
                for provisional_id in &reconciled {
                    self.pending.remove(token.room(), provisional_id);
                }
                if let Err(err) = self.machine.on_history_loaded(token) {
                    warn!(room = %token.room(), error = %err, "history completion rejected");
                }
                info!(
                    room = %token.room(),
                    rows = count,
                    reconciled = reconciled.len(),
                    "history merged"
                );
            }
            Err(err) => {
                warn!(room = %token.room(), error = %err, "history fetch failed; serving local data");
                timeline.insert_local(history_diagnostic(token.room(), &err, now_ms));
                if let Err(err) = self.machine.on_history_failed(token) {
                    warn!(room = %token.room(), error = %err, "history failure rejected");
                }
            }
        }
        true
    }

    /// Record an opened live feed. `false` means the feed belongs to a stale
    /// session and must be closed.
    pub fn on_subscribed(&mut self, token: &SessionToken) -> bool {
        if !self.is_current(token) {
            return false;
        }
        match self.machine.on_subscribed(token) {
            Ok(state) => {
                debug!(room = %token.room(), ?state, "live feed open");
                true
            }
            Err(err) => {
                warn!(room = %token.room(), error = %err, "subscription completion rejected");
                false
            }
        }
    }

    /// Returns whether the session state changed.
    pub fn on_subscribe_failed(&mut self, token: &SessionToken, error: &ChatError) -> bool {
        if !self.is_current(token) {
            return false;
        }
        warn!(room = %token.room(), error = %error, "live feed unavailable");
        self.machine.on_subscribe_failed(token).is_ok()
    }

    /// Returns whether the session state changed.
    pub fn on_live_closed(&mut self, token: &SessionToken) -> bool {
        if !self.is_current(token) {
            return false;
        }
        warn!(room = %token.room(), "live feed closed by backend");
        self.machine.on_live_closed(token).is_ok()
    }

    /// Merge one live insert. Returns whether the view changed.
    pub fn on_live(&mut self, token: &SessionToken, row: RemoteMessage, now_ms: u64) -> bool {
        if !self.is_current(token) {
            return false;
        }
        if row.room != token.room() {
            debug!(room = %token.room(), foreign_room = %row.room, "ignoring insert for another room");
            return false;
        }
        let Some(timeline) = self.timeline.as_mut() else {
            return false;
        };

        let message_id = row.id.clone();
        match timeline.apply_confirmed(normalize_remote_message(row, now_ms)) {
            MergeOutcome::Inserted => true,
            MergeOutcome::Reconciled { provisional_id } => {
                debug!(room = %token.room(), %message_id, %provisional_id, "live insert confirmed pending entry");
                self.pending.remove(token.room(), &provisional_id);
                true
            }
            MergeOutcome::Duplicate => {
                debug!(room = %token.room(), %message_id, "dropping redelivered insert");
                false
            }
            MergeOutcome::ForeignRoom => false,
        }
    }

    /// Buffer an outgoing entry and show it in the view when its room is active.
    pub fn optimistic_insert(&mut self, message: Message) -> bool {
        let room = message.room.clone();
        self.pending.append(&room, message.clone());
        self.in_flight.insert(message.id.clone());

        match self.timeline.as_mut() {
            Some(timeline) if timeline.room() == room => {
                matches!(timeline.add_pending(message), MergeOutcome::Inserted)
            }
            _ => false,
        }
    }

    /// Flag a failed entry of the active view as in flight again.
    ///
    /// Returns the entry to resend, or `None` if there is nothing to retry.
    pub fn begin_retry(&mut self, message_id: &str) -> Option<Message> {
        let timeline = self.timeline.as_mut()?;
        let entry = timeline.get(message_id)?;
        if entry.delivery != DeliveryState::Failed || self.in_flight.contains(message_id) {
            return None;
        }
        let entry = entry.clone();
        timeline.set_delivery(message_id, DeliveryState::Pending);
        self.in_flight.insert(entry.id.clone());
        Some(Message {
            delivery: DeliveryState::Pending,
            ..entry
        })
    }

    /// Apply the outcome of a remote write. Returns whether the view changed.
    ///
    /// The pending store is updated for any room; the view only for the active one.
    pub fn on_write_finished(
        &mut self,
        room: &str,
        provisional_id: &str,
        result: Result<Message, ChatError>,
    ) -> bool {
        self.in_flight.remove(provisional_id);
        let timeline = self
            .timeline
            .as_mut()
            .filter(|timeline| timeline.room() == room);

        match result {
            Ok(confirmed) => {
                self.pending.remove(room, provisional_id);
                match timeline {
                    Some(timeline) => {
                        let outcome = timeline.confirm_send(provisional_id, confirmed);
                        debug!(%room, %provisional_id, ?outcome, "write confirmed");
                        true
                    }
                    None => false,
                }
            }
            Err(err) => {
                warn!(%room, %provisional_id, error = %err, "write failed; entry kept as undelivered");
                timeline.is_some_and(|timeline| {
                    timeline.set_delivery(provisional_id, DeliveryState::Failed)
                })
            }
        }
    }
}
