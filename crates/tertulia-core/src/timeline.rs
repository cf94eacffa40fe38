use crate::types::{DeliveryState, Message};

/// How far a server timestamp may trail the local send time and still count
/// as that send's confirmation.
const CLOCK_SKEW_TOLERANCE_MS: u64 = 1_000;

/// Result of merging one message into a [`MergedTimeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The message was added as a new entry.
    Inserted,
    /// An entry with the same id is already present; the message was discarded.
    Duplicate,
    /// The message and a provisional entry are the same logical message.
    ///
    /// Only one of them is kept in the view; `provisional_id` names the pending
    /// entry that should be dropped from the local pending store.
    Reconciled { provisional_id: String },
    /// The message belongs to another room and was rejected.
    ForeignRoom,
}

#[derive(Debug, Clone)]
struct Slot {
    message: Message,
    arrival: u64,
}

/// Deduplicated, time-ordered view of one room.
///
/// Entries are sorted by `created_at_ms`, ties broken by arrival order.
#[derive(Debug, Clone)]
pub struct MergedTimeline {
    room: String,
    slots: Vec<Slot>,
    next_arrival: u64,
    max_items: usize,
    reconcile_window_ms: u64,
}

impl MergedTimeline {
    /// Create an empty view for `room` with an item cap (`max_items >= 1`).
    pub fn new(room: impl Into<String>, max_items: usize, reconcile_window_ms: u64) -> Self {
        Self {
            room: room.into(),
            slots: Vec::new(),
            next_arrival: 0,
            max_items: max_items.max(1),
            reconcile_window_ms,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Entries in display order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.slots.iter().map(|slot| &slot.message)
    }

    /// Owned copy of the entries in display order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.slots
            .iter()
            .map(|slot| &slot.message)
            .find(|message| message.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Merge a batch of fetched history rows.
    ///
    /// Returns the provisional ids that history superseded. Buffered entries
    /// that remain rank after history on equal timestamps.
    pub fn seed_history(&mut self, history: Vec<Message>) -> Vec<String> {
        let reconciled = history
            .into_iter()
            .filter_map(|message| match self.apply_confirmed(message) {
                MergeOutcome::Reconciled { provisional_id } => Some(provisional_id),
                _ => None,
            })
            .collect();

        for slot in self
            .slots
            .iter_mut()
            .filter(|slot| !slot.message.is_confirmed())
        {
            slot.arrival = self.next_arrival;
            self.next_arrival += 1;
        }
        self.sort_and_trim();
        reconciled
    }

    /// Add a locally buffered (pending or failed) entry.
    ///
    /// Confirmed rows already in the view are never matched against it: only a
    /// confirmed message merged afterwards can supersede a buffered entry.
    pub fn add_pending(&mut self, message: Message) -> MergeOutcome {
        if message.room != self.room {
            return MergeOutcome::ForeignRoom;
        }
        if self.contains(&message.id) {
            return MergeOutcome::Duplicate;
        }
        self.push(message);
        MergeOutcome::Inserted
    }

    /// Merge a server-confirmed message (history row or live insert).
    pub fn apply_confirmed(&mut self, mut message: Message) -> MergeOutcome {
        if message.room != self.room {
            return MergeOutcome::ForeignRoom;
        }
        if self.contains(&message.id) {
            return MergeOutcome::Duplicate;
        }
        message.delivery = DeliveryState::Confirmed;

        let window = self.reconcile_window_ms;
        let matched = self
            .slots
            .iter()
            .position(|slot| supersedes(&message, &slot.message, window));
        match matched {
            Some(index) => {
                let provisional_id = self.replace_at(index, message);
                MergeOutcome::Reconciled { provisional_id }
            }
            None => {
                self.push(message);
                MergeOutcome::Inserted
            }
        }
    }

    /// Replace the optimistic entry `provisional_id` with the canonical record
    /// returned by its own remote write.
    pub fn confirm_send(&mut self, provisional_id: &str, mut confirmed: Message) -> MergeOutcome {
        if confirmed.room != self.room {
            return MergeOutcome::ForeignRoom;
        }
        confirmed.delivery = DeliveryState::Confirmed;

        if self.contains(&confirmed.id) {
            // The live echo won the race and already reconciled (or duplicated) it.
            self.remove(provisional_id);
            return MergeOutcome::Duplicate;
        }

        match self.position(provisional_id) {
            Some(index) => {
                let provisional_id = self.replace_at(index, confirmed);
                MergeOutcome::Reconciled { provisional_id }
            }
            None => self.apply_confirmed(confirmed),
        }
    }

    /// Insert a locally generated entry (for example a diagnostic) without reconciliation.
    pub fn insert_local(&mut self, message: Message) -> MergeOutcome {
        if message.room != self.room {
            return MergeOutcome::ForeignRoom;
        }
        if self.contains(&message.id) {
            return MergeOutcome::Duplicate;
        }
        self.push(message);
        MergeOutcome::Inserted
    }

    /// Update the delivery state of a non-confirmed entry.
    pub fn set_delivery(&mut self, id: &str, delivery: DeliveryState) -> bool {
        match self
            .slots
            .iter_mut()
            .find(|slot| slot.message.id == id && !slot.message.is_confirmed())
        {
            Some(slot) => {
                slot.message.delivery = delivery;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let index = self.position(id)?;
        Some(self.slots.remove(index).message)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.slots.iter().position(|slot| slot.message.id == id)
    }

    fn push(&mut self, message: Message) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.slots.push(Slot { message, arrival });
        self.sort_and_trim();
    }

    fn replace_at(&mut self, index: usize, message: Message) -> String {
        let previous = std::mem::replace(&mut self.slots[index].message, message);
        self.sort_and_trim();
        previous.id
    }

    fn sort_and_trim(&mut self) {
        self.slots.sort_by(|a, b| {
            a.message
                .created_at_ms
                .cmp(&b.message.created_at_ms)
                .then(a.arrival.cmp(&b.arrival))
        });

        let mut excess = self.slots.len().saturating_sub(self.max_items);
        if excess == 0 {
            return;
        }
        // Oldest confirmed entries go first; unconfirmed ones are kept.
        self.slots.retain(|slot| {
            if excess > 0 && slot.message.is_confirmed() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// Whether `confirmed` is the server copy of the locally buffered `pending`.
///
/// Without an echoed transaction id the server copy must be stamped no earlier
/// than the send (give or take clock skew) and within the window after it.
fn supersedes(confirmed: &Message, pending: &Message, window_ms: u64) -> bool {
    if pending.is_confirmed() || pending.content.is_system() || confirmed.room != pending.room {
        return false;
    }
    if let (Some(confirmed_txn), Some(pending_txn)) =
        (&confirmed.client_txn_id, &pending.client_txn_id)
    {
        return confirmed_txn == pending_txn;
    }
    confirmed.author.id == pending.author.id
        && confirmed.content == pending.content
        && confirmed.created_at_ms.saturating_add(CLOCK_SKEW_TOLERANCE_MS) >= pending.created_at_ms
        && confirmed.created_at_ms.saturating_sub(pending.created_at_ms) <= window_ms
}
