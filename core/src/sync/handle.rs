/// Cloneable front door to a running sync loop
use crate::error::{ChatError, Result};
use crate::messenger_types::ChatEvent;
use crate::sync::engine::{Command, Event};
use crate::sync::state::ChatState;
use crate::transport::InboundEvent;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<Event>,
    state_rx: watch::Receiver<ChatState>,
    events: broadcast::Sender<ChatEvent>,
}

impl SyncHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Event>,
        state_rx: watch::Receiver<ChatState>,
        events: broadcast::Sender<ChatEvent>,
    ) -> Self {
        Self {
            tx,
            state_rx,
            events,
        }
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(Event::Command(cmd))
            .map_err(|_| ChatError::Closed)
    }

    pub fn refresh_conversations(&self) -> Result<()> {
        self.command(Command::RefreshConversations)
    }

    pub fn set_active_conversation(&self, peer_id: Option<String>) -> Result<()> {
        self.command(Command::SetActiveConversation(peer_id))
    }

    pub fn load_more_messages(&self) -> Result<()> {
        self.command(Command::LoadMoreMessages)
    }

    pub fn send_message(&self, content: &str, peer_id: &str) -> Result<()> {
        self.command(Command::SendMessage {
            content: content.to_string(),
            peer_id: peer_id.to_string(),
        })
    }

    pub fn mark_as_read(&self, peer_id: &str) -> Result<()> {
        self.command(Command::MarkAsRead(peer_id.to_string()))
    }

    pub fn notify_typing(&self, peer_id: &str, is_typing: bool) -> Result<()> {
        self.command(Command::NotifyTyping {
            peer_id: peer_id.to_string(),
            is_typing,
        })
    }

    /// Feed a decoded push event into the loop
    pub fn push(&self, event: InboundEvent) -> Result<()> {
        self.tx
            .send(Event::Push(event))
            .map_err(|_| ChatError::Closed)
    }

    /// State after every event queued before this call has been applied
    pub async fn snapshot(&self) -> Result<ChatState> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot(reply))?;
        rx.await.map_err(|_| ChatError::Closed)
    }

    /// Latest published state; changes after every handled event
    pub fn state(&self) -> watch::Receiver<ChatState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
