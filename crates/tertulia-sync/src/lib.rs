//! Room synchronization runtime for Tertulia.
//!
//! [`spawn_runtime`] starts one actor per logged-in viewer. It owns the active
//! room session, drives the send pipeline and talks to a [`MessagingBackend`].

pub mod auto_reply;
pub mod backend;
pub mod memory;
pub mod pipeline;
mod runtime;
pub mod session;

pub use backend::{MessageDraft, MessagingBackend, RoomSubscription, SubscriptionHandle};
pub use memory::InMemoryBackend;
pub use runtime::{ChatRuntimeHandle, SendRequestError, spawn_runtime};
pub use session::{RoomSession, SharedPendingStore};
