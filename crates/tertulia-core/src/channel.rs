use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{ChatCommand, ChatEvent};

/// Receiver side of the runtime's event fan-out. Every front end holds one.
pub type EventStream = broadcast::Receiver<ChatEvent>;

#[derive(Debug, Error)]
pub enum ChatChannelError {
    /// The runtime actor has exited (after `Shutdown`, or because it was dropped).
    #[error("chat runtime stopped; '{command}' was not delivered")]
    RuntimeStopped { command: &'static str },
}

/// Wiring between one viewer's sync runtime and the front ends driving it.
///
/// Commands are queued in order for the single runtime actor. Events are
/// broadcast; a front end that falls behind sees `Lagged` and picks up again
/// from the next room snapshot.
#[derive(Clone, Debug)]
pub struct ChatChannels {
    command_tx: mpsc::Sender<ChatCommand>,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatChannels {
    /// Returns the channels and the command receiver the runtime consumes.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<ChatCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Queue `command`, waiting for room when the runtime is busy.
    pub async fn send_command(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        let label = command_label(&command);
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ChatChannelError::RuntimeStopped { command: label })
    }

    /// Publish `event` to every front end. Having no subscriber is fine.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn command_label(command: &ChatCommand) -> &'static str {
    match command {
        ChatCommand::EnterRoom { .. } => "enter_room",
        ChatCommand::LeaveRoom => "leave_room",
        ChatCommand::Send { .. } => "send",
        ChatCommand::RetryPending { .. } => "retry_pending",
        ChatCommand::Shutdown => "shutdown",
    }
}
