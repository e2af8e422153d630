use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{ChatCommand, ChatEvent};

/// Broadcast receiver handed to event consumers.
pub type EventStream = broadcast::Receiver<ChatEvent>;

#[derive(Debug, Error)]
pub enum ChatChannelError {
    /// The runtime stopped and no longer reads commands.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command queue into the runtime plus the fan-out event bus out of it.
#[derive(Clone, Debug)]
pub struct ChatChannels {
    command_tx: mpsc::Sender<ChatCommand>,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatChannels {
    /// Create the channel pair; the runtime keeps the returned receiver.
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

    /// Extra producer handle for the command queue.
    pub fn command_sender(&self) -> mpsc::Sender<ChatCommand> {
        self.command_tx.clone()
    }

    /// New event receiver; it sees only events emitted after this call.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Queue a command, waiting for buffer space. Fails once the runtime is gone.
    pub async fn send_command(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ChatChannelError::CommandChannelClosed)
    }

    /// Publish to every subscriber. Having no subscriber is not an error.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Publish `events` in order.
    pub fn emit_all(&self, events: impl IntoIterator<Item = ChatEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}
