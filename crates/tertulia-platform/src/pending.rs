//! Room-partitioned buffer of outgoing messages awaiting confirmation.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use tertulia_core::{DeliveryState, Message};
use tracing::{debug, warn};

use crate::{KeyValueStore, StoreError};

/// Storage key holding the pending entries of `room`.
pub fn pending_key(room: &str) -> String {
    format!("pending_msgs_{room}")
}

/// Durable pending-message store.
///
/// Storage failures are logged and swallowed: entries always live in memory
/// for the current process, and persistence is best-effort.
#[derive(Debug)]
pub struct LocalPendingStore<S: KeyValueStore> {
    store: S,
    rooms: Mutex<HashMap<String, Vec<Message>>>,
}

impl<S: KeyValueStore> LocalPendingStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Add a pending entry for `room`. Appending an id that is already buffered is a no-op.
    pub fn append(&self, room: &str, message: Message) {
        if message.room != room {
            warn!(
                %room,
                message_room = %message.room,
                message_id = %message.id,
                "refusing to buffer message under another room"
            );
            return;
        }

        let mut rooms = self.lock();
        let entries = self.entries_for(&mut rooms, room);
        if entries.iter().any(|entry| entry.id == message.id) {
            return;
        }
        entries.push(Message {
            delivery: DeliveryState::Pending,
            ..message
        });
        debug!(%room, pending = entries.len(), "pending entry appended");
        self.persist(room, entries);
    }

    /// Remove a pending entry. Removing an unknown id is a no-op.
    pub fn remove(&self, room: &str, message_id: &str) {
        let mut rooms = self.lock();
        let entries = self.entries_for(&mut rooms, room);
        let before = entries.len();
        entries.retain(|entry| entry.id != message_id);
        if entries.len() == before {
            return;
        }
        debug!(%room, %message_id, pending = entries.len(), "pending entry removed");
        self.persist(room, entries);
    }

    /// Pending entries of `room` in insertion order.
    pub fn list_for_room(&self, room: &str) -> Vec<Message> {
        let mut rooms = self.lock();
        self.entries_for(&mut rooms, room).clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Message>>> {
        self.rooms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entries_for<'a>(
        &self,
        rooms: &'a mut HashMap<String, Vec<Message>>,
        room: &str,
    ) -> &'a mut Vec<Message> {
        rooms
            .entry(room.to_owned())
            .or_insert_with(|| self.load(room))
    }

    fn load(&self, room: &str) -> Vec<Message> {
        let key = pending_key(room);
        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(%room, error = %err, "failed loading pending entries; starting empty");
                return Vec::new();
            }
        };

        match decode(&raw) {
            Ok(entries) => entries
                .into_iter()
                .filter(|entry| entry.room == room)
                .collect(),
            Err(err) => {
                warn!(%room, error = %err, "discarding unreadable pending entries");
                Vec::new()
            }
        }
    }

    fn persist(&self, room: &str, entries: &[Message]) {
        let key = pending_key(room);
        let result = if entries.is_empty() {
            self.store.remove(&key)
        } else {
            serde_json::to_string(entries)
                .map_err(|err| StoreError::Serialization(err.to_string()))
                .and_then(|encoded| self.store.set(&key, &encoded))
        };

        if let Err(err) = result {
            warn!(%room, error = %err, "failed persisting pending entries; keeping them in memory");
        }
    }
}

fn decode(raw: &str) -> Result<Vec<Message>, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Serialization(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileKeyValueStore, InMemoryKeyValueStore};
    use std::{
        env, fs,
        time::{SystemTime, UNIX_EPOCH},
    };
    use tertulia_core::{Author, MessageContent};

    fn message(id: &str, room: &str, body: &str) -> Message {
        Message {
            id: id.to_owned(),
            room: room.to_owned(),
            author: Author::new("u1", "Ana"),
            content: MessageContent::Text {
                body: body.to_owned(),
            },
            created_at_ms: 1_000,
            client_txn_id: Some(format!("txn-{id}")),
            delivery: DeliveryState::Pending,
        }
    }

    fn ids(entries: &[Message]) -> Vec<&str> {
        entries.iter().map(|entry| entry.id.as_str()).collect()
    }

    #[test]
    fn lists_in_insertion_order_per_room() {
        let store = LocalPendingStore::new(InMemoryKeyValueStore::default());
        store.append("General", message("opt-2", "General", "b"));
        store.append("General", message("opt-1", "General", "a"));
        store.append("Italia", message("opt-3", "Italia", "c"));

        assert_eq!(ids(&store.list_for_room("General")), vec!["opt-2", "opt-1"]);
        assert_eq!(ids(&store.list_for_room("Italia")), vec!["opt-3"]);
        assert!(store.list_for_room("Portugal").is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let store = LocalPendingStore::new(InMemoryKeyValueStore::default());
        store.append("General", message("opt-1", "General", "a"));
        store.remove("General", "opt-1");
        store.remove("General", "opt-1");
        store.remove("General", "missing");
        assert!(store.list_for_room("General").is_empty());
    }

    #[test]
    fn duplicate_append_is_ignored() {
        let store = LocalPendingStore::new(InMemoryKeyValueStore::default());
        store.append("General", message("opt-1", "General", "a"));
        store.append("General", message("opt-1", "General", "a"));
        assert_eq!(store.list_for_room("General").len(), 1);
    }

    #[test]
    fn refuses_entries_for_another_room() {
        let store = LocalPendingStore::new(InMemoryKeyValueStore::default());
        store.append("General", message("opt-1", "Francia", "salut"));
        assert!(store.list_for_room("General").is_empty());
        assert!(store.list_for_room("Francia").is_empty());
    }

    #[test]
    fn persists_under_room_key_and_clears_empty_rooms() {
        let kv = InMemoryKeyValueStore::default();
        let store = LocalPendingStore::new(kv.clone());
        store.append("General", message("opt-1", "General", "Hola"));

        let raw = kv
            .get("pending_msgs_General")
            .expect("get")
            .expect("key should be written");
        assert!(raw.contains("Hola"));

        store.remove("General", "opt-1");
        assert_eq!(kv.get("pending_msgs_General").expect("get"), None);
    }

    #[test]
    fn entries_survive_restart_with_file_store() {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let root = env::temp_dir().join(format!("tertulia-pending-{now_nanos}"));

        {
            let kv = FileKeyValueStore::open(&root).expect("open");
            let store = LocalPendingStore::new(kv);
            store.append("España", message("opt-1", "España", "hola"));
            store.append("España", message("opt-2", "España", "qué tal"));
        }

        let kv = FileKeyValueStore::open(&root).expect("reopen");
        let store = LocalPendingStore::new(kv);
        let entries = store.list_for_room("España");
        assert_eq!(ids(&entries), vec!["opt-1", "opt-2"]);
        assert!(entries.iter().all(|entry| entry.delivery == DeliveryState::Pending));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn corrupt_payload_reads_as_empty() {
        let kv = InMemoryKeyValueStore::default();
        kv.set("pending_msgs_General", "{not json").expect("set");
        let store = LocalPendingStore::new(kv);
        assert!(store.list_for_room("General").is_empty());

        store.append("General", message("opt-1", "General", "a"));
        assert_eq!(store.list_for_room("General").len(), 1);
    }

    #[derive(Default)]
    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("mock outage".to_owned()))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("mock outage".to_owned()))
        }

        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("mock outage".to_owned()))
        }
    }

    #[test]
    fn storage_outage_keeps_entries_in_memory() {
        let store = LocalPendingStore::new(FailingStore);
        store.append("General", message("opt-1", "General", "a"));
        assert_eq!(ids(&store.list_for_room("General")), vec!["opt-1"]);

        store.remove("General", "opt-1");
        assert!(store.list_for_room("General").is_empty());
    }
}
