use serde::{Deserialize, Serialize};

use crate::{error::ChatError, types::RoomStatus};

/// Lifecycle of the viewer's subscription to a single room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoomSessionState {
    /// No room entered.
    Idle,
    /// History fetch and/or live subscription in flight.
    Loading,
    /// History merged and live feed open.
    Live,
    /// History or live feed unavailable; locally known data is still served.
    LoadFailed,
}

/// Identifies one `enter` of one room. Completions carrying an older token are stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken {
    room: String,
    generation: u64,
}

impl SessionToken {
    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Room session state machine guarded by a generation counter.
#[derive(Debug, Clone)]
pub struct RoomSessionMachine {
    state: RoomSessionState,
    room: Option<String>,
    generation: u64,
    history_loaded: bool,
    subscribed: bool,
}

impl Default for RoomSessionMachine {
    fn default() -> Self {
        Self {
            state: RoomSessionState::Idle,
            room: None,
            generation: 0,
            history_loaded: false,
            subscribed: false,
        }
    }
}

impl RoomSessionMachine {
    pub fn state(&self) -> RoomSessionState {
        self.state
    }

    pub fn active_room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Status flag for the presentation layer; `None` while idle.
    pub fn status(&self) -> Option<RoomStatus> {
        match self.state {
            RoomSessionState::Idle => None,
            RoomSessionState::Loading => Some(RoomStatus::Loading),
            RoomSessionState::Live => Some(RoomStatus::Live),
            RoomSessionState::LoadFailed => Some(RoomStatus::Degraded),
        }
    }

    /// Start a new session for `room`, invalidating every earlier token.
    ///
    /// Re-entering the active room is allowed and restarts the load.
    pub fn enter(&mut self, room: impl Into<String>) -> SessionToken {
        let room = room.into();
        self.generation = self.generation.wrapping_add(1);
        self.state = RoomSessionState::Loading;
        self.room = Some(room.clone());
        self.history_loaded = false;
        self.subscribed = false;
        SessionToken {
            room,
            generation: self.generation,
        }
    }

    /// Return to `Idle`, invalidating every outstanding token. Returns the room left.
    pub fn leave(&mut self) -> Option<String> {
        self.generation = self.generation.wrapping_add(1);
        self.state = RoomSessionState::Idle;
        self.history_loaded = false;
        self.subscribed = false;
        self.room.take()
    }

    pub fn is_current(&self, token: &SessionToken) -> bool {
        token.generation == self.generation
            && self.room.as_deref() == Some(token.room.as_str())
            && self.state != RoomSessionState::Idle
    }

    pub fn on_history_loaded(
        &mut self,
        token: &SessionToken,
    ) -> Result<RoomSessionState, ChatError> {
        self.check_loading_or_failed(token, "history_loaded")?;
        self.history_loaded = true;
        if self.state == RoomSessionState::Loading && self.subscribed {
            self.state = RoomSessionState::Live;
        }
        Ok(self.state)
    }

    pub fn on_history_failed(
        &mut self,
        token: &SessionToken,
    ) -> Result<RoomSessionState, ChatError> {
        self.check_loading_or_failed(token, "history_failed")?;
        self.state = RoomSessionState::LoadFailed;
        Ok(self.state)
    }

    pub fn on_subscribed(&mut self, token: &SessionToken) -> Result<RoomSessionState, ChatError> {
        self.check_loading_or_failed(token, "subscribed")?;
        self.subscribed = true;
        if self.state == RoomSessionState::Loading && self.history_loaded {
            self.state = RoomSessionState::Live;
        }
        Ok(self.state)
    }

    pub fn on_subscribe_failed(
        &mut self,
        token: &SessionToken,
    ) -> Result<RoomSessionState, ChatError> {
        self.check_loading_or_failed(token, "subscribe_failed")?;
        self.state = RoomSessionState::LoadFailed;
        Ok(self.state)
    }

    /// The live feed ended on its own; the session keeps serving what it has.
    pub fn on_live_closed(&mut self, token: &SessionToken) -> Result<RoomSessionState, ChatError> {
        self.check_current(token)?;
        self.subscribed = false;
        self.state = RoomSessionState::LoadFailed;
        Ok(self.state)
    }

    fn check_current(&self, token: &SessionToken) -> Result<(), ChatError> {
        if self.is_current(token) {
            Ok(())
        } else {
            Err(ChatError::stale_session(&token.room, token.generation))
        }
    }

    fn check_loading_or_failed(&self, token: &SessionToken, action: &str) -> Result<(), ChatError> {
        self.check_current(token)?;
        match self.state {
            RoomSessionState::Loading | RoomSessionState::LoadFailed => Ok(()),
            RoomSessionState::Idle | RoomSessionState::Live => {
                Err(ChatError::invalid_state(self.state, action))
            }
        }
    }
}
