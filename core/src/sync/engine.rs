/// Synchronization orchestrator: the single writer of chat state.
///
/// Every input (UI command, request completion, push event, timer expiry)
/// arrives as an [`Event`] on one channel and is applied by [`SyncEngine::process`].
/// Asynchronous work is spawned with the epoch current at dispatch time and
/// posts a [`Completion`] back; results from an older epoch are dropped.
use crate::api::ChatApi;
use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::messenger_types::{
    Ack, ChatEvent, Conversation, HistoryPage, Message, MessageId, MessageType, NewMessage, User,
};
use crate::sync::handle::SyncHandle;
use crate::sync::state::ChatState;
use crate::sync::typing::TypingTimers;
use crate::transport::protocol::{
    IncomingMessage, OutgoingMessage, TypingPayload, UserTyping, EVENT_SEND_MESSAGE, EVENT_TYPING,
};
use crate::transport::{InboundEvent, Transport};
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outbound side of the push channel as the engine sees it
pub trait PushChannel: Send + Sync {
    /// Emit an event; false when it was dropped
    fn emit(&self, event: &str, payload: Value) -> bool;
    /// Drop every subscription and close the channel
    fn close(&self);
}

impl PushChannel for Transport {
    fn emit(&self, event: &str, payload: Value) -> bool {
        self.send(event, payload)
    }

    fn close(&self) {
        self.unsubscribe_all();
        self.disconnect();
    }
}

/// Imperative API exposed to the UI layer
#[derive(Debug)]
pub enum Command {
    RefreshConversations,
    SetActiveConversation(Option<String>),
    LoadMoreMessages,
    SendMessage { content: String, peer_id: String },
    MarkAsRead(String),
    NotifyTyping { peer_id: String, is_typing: bool },
    Snapshot(oneshot::Sender<ChatState>),
    Shutdown,
}

/// Result of a spawned persistence call
#[derive(Debug)]
pub enum Completion {
    Conversations {
        seq: u64,
        result: Result<Vec<Conversation>>,
    },
    Page {
        epoch: u64,
        peer_id: String,
        page: u32,
        /// Set for the page-1 load of a conversation switch
        mark_read: bool,
        result: Result<HistoryPage>,
    },
    Sent {
        local_id: MessageId,
        result: Result<Message>,
    },
    MarkedRead {
        epoch: u64,
        peer_id: String,
        result: Result<Ack>,
    },
}

#[derive(Debug)]
pub enum Event {
    Command(Command),
    Push(InboundEvent),
    Completed(Completion),
    TypingExpired { peer_id: String, generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub struct SyncEngine {
    state: ChatState,
    api: Arc<dyn ChatApi>,
    push: Arc<dyn PushChannel>,
    page_size: u32,
    typing_timeout: Duration,
    tx: mpsc::UnboundedSender<Event>,
    /// peer id -> epoch of the history fetch in flight
    in_flight: HashMap<String, u64>,
    /// Optimistic entries awaiting their create request
    pending_sends: HashSet<MessageId>,
    conversations_issued: u64,
    conversations_applied: u64,
    typing_timers: TypingTimers,
    state_tx: watch::Sender<ChatState>,
    events_tx: broadcast::Sender<ChatEvent>,
    session_expired: bool,
}

impl SyncEngine {
    pub fn new(
        me: User,
        api: Arc<dyn ChatApi>,
        push: Arc<dyn PushChannel>,
        config: &ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = ChatState::new(me);
        let (state_tx, _) = watch::channel(state.clone());
        let (events_tx, _) = broadcast::channel(256);

        let engine = Self {
            state,
            api,
            push,
            page_size: config.page_size,
            typing_timeout: config.typing_timeout,
            tx,
            in_flight: HashMap::new(),
            pending_sends: HashSet::new(),
            conversations_issued: 0,
            conversations_applied: 0,
            typing_timers: TypingTimers::new(),
            state_tx,
            events_tx,
            session_expired: false,
        };
        (engine, rx)
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle::new(
            self.tx.clone(),
            self.state_tx.subscribe(),
            self.events_tx.clone(),
        )
    }

    /// Run the loop on its own task
    pub fn spawn(self, rx: mpsc::UnboundedReceiver<Event>) -> (SyncHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!("Sync loop started for {}", self.state.me.id);
        self.publish();
        while let Some(event) = rx.recv().await {
            let flow = self.process(event);
            self.publish();
            if flow == Flow::Stop {
                break;
            }
        }
        self.teardown();
        info!("Sync loop stopped");
    }

    /// Apply one event. The only place state changes.
    pub fn process(&mut self, event: Event) -> Flow {
        match event {
            Event::Command(Command::Shutdown) => return Flow::Stop,
            Event::Command(cmd) => self.apply_command(cmd),
            Event::Push(event) => self.apply_push(event),
            Event::Completed(completion) => self.apply_completion(completion),
            Event::TypingExpired {
                peer_id,
                generation,
            } => self.on_typing_expired(&peer_id, generation),
        }
        if self.session_expired {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    /// Cancel timers and release the push channel
    pub fn teardown(&mut self) {
        self.typing_timers.cancel_all();
        self.push.close();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn notify(&self, event: ChatEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::RefreshConversations => self.refresh_conversations(),
            Command::SetActiveConversation(peer_id) => self.set_active_conversation(peer_id),
            Command::LoadMoreMessages => {
                self.load_more_messages();
            }
            Command::SendMessage { content, peer_id } => {
                self.send_message(content, &peer_id);
            }
            Command::MarkAsRead(peer_id) => self.mark_as_read(&peer_id),
            Command::NotifyTyping { peer_id, is_typing } => {
                self.notify_typing(&peer_id, is_typing);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.state.clone());
            }
            Command::Shutdown => {}
        }
    }

    fn apply_push(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::ReceiveMessage(incoming) => self.on_receive_message(incoming),
            InboundEvent::MessageDelivered(incoming) => self.on_message_delivered(incoming),
            InboundEvent::UserTyping(typing) => self.on_user_typing(typing),
            InboundEvent::UserOnline(ids) => self.on_user_online(ids),
            InboundEvent::Connected => {
                info!("Live updates connected");
                self.state.connected = true;
            }
            InboundEvent::Disconnected => {
                warn!("Live updates disconnected; missed events will not be replayed");
                self.state.connected = false;
            }
            InboundEvent::ConnectError(reason) => {
                warn!("Live updates unavailable: {}", reason);
                self.state.connected = false;
            }
        }
    }

    fn apply_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Conversations { seq, result } => self.on_conversations(seq, result),
            Completion::Page {
                epoch,
                peer_id,
                page,
                mark_read,
                result,
            } => self.on_page(epoch, peer_id, page, mark_read, result),
            Completion::Sent { local_id, result } => self.on_sent(local_id, result),
            Completion::MarkedRead {
                epoch,
                peer_id,
                result,
            } => self.on_marked_read(epoch, peer_id, result),
        }
    }

    fn dispatch<F>(&self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let completion = work.await;
            let _ = tx.send(Event::Completed(completion));
        });
    }

    fn on_request_error(&mut self, context: &str, err: ChatError) {
        if err.is_session_expired() {
            if !self.session_expired {
                error!("{}: session rejected by server, tearing down", context);
                self.session_expired = true;
                self.notify(ChatEvent::SessionExpired);
            }
            return;
        }
        error!("{} failed: {}", context, err);
    }

    // ─── Operations ──────────────────────────────────────────────────────────

    /// Reload the conversation list; the newest issued request wins.
    pub fn refresh_conversations(&mut self) {
        self.conversations_issued += 1;
        let seq = self.conversations_issued;
        let api = self.api.clone();
        self.dispatch(async move {
            Completion::Conversations {
                seq,
                result: api.conversations().await,
            }
        });
    }

    /// Switch conversations: bump the epoch, clear the visible list, then
    /// load page 1 and, once it settles, mark the conversation read.
    pub fn set_active_conversation(&mut self, peer_id: Option<String>) {
        let epoch = self.state.switch_to(peer_id.clone());
        debug!("Active conversation {:?} (epoch {})", peer_id, epoch);
        if let Some(peer_id) = peer_id {
            self.request_page(&peer_id, 1, true);
        }
    }

    /// Fetch one history page of the active conversation. False if refused.
    pub fn fetch_page(&mut self, peer_id: &str, page: u32) -> bool {
        self.request_page(peer_id, page, false)
    }

    /// Fetch the next older page if there is one and nothing is in flight.
    pub fn load_more_messages(&mut self) -> bool {
        let Some(peer_id) = self.state.active.clone() else {
            return false;
        };
        if !self.state.cursor.has_more || self.is_fetching(&peer_id) {
            return false;
        }
        let next = self.state.cursor.page + 1;
        self.request_page(&peer_id, next, false)
    }

    fn is_fetching(&self, peer_id: &str) -> bool {
        self.in_flight.get(peer_id) == Some(&self.state.epoch)
    }

    fn request_page(&mut self, peer_id: &str, page: u32, mark_read: bool) -> bool {
        if !self.state.is_active(peer_id) {
            warn!("Ignoring history fetch for inactive conversation {}", peer_id);
            return false;
        }
        if self.is_fetching(peer_id) {
            debug!("History fetch for {} already in flight", peer_id);
            return false;
        }

        let epoch = self.state.epoch;
        self.in_flight.insert(peer_id.to_string(), epoch);
        self.state.loading = true;

        let api = self.api.clone();
        let peer = peer_id.to_string();
        let limit = self.page_size;
        self.dispatch(async move {
            let result = api.conversation(&peer, page, limit).await;
            Completion::Page {
                epoch,
                peer_id: peer,
                page,
                mark_read,
                result,
            }
        });
        true
    }

    /// Optimistically show the message, then write it through both the
    /// persistence API and the push channel. Returns the temporary id that
    /// later reconciliation or rollback will look up.
    pub fn send_message(&mut self, content: String, peer_id: &str) -> MessageId {
        let local_id = MessageId::local();
        let message_type = MessageType::Text;

        if self.state.is_active(peer_id) {
            let optimistic = Message::optimistic(
                local_id.clone(),
                &self.state.me,
                peer_id,
                content.clone(),
                message_type,
            );
            self.state.messages.push(optimistic);
            self.pending_sends.insert(local_id.clone());
        }

        let live = OutgoingMessage {
            sender: self.state.me.id.clone(),
            recipient: peer_id.to_string(),
            content: content.clone(),
            message_type,
        };
        match serde_json::to_value(&live) {
            Ok(payload) => {
                if !self.push.emit(EVENT_SEND_MESSAGE, payload) {
                    warn!("Live delivery of {} skipped, push channel down", local_id);
                }
            }
            Err(e) => error!("Failed to encode live message: {}", e),
        }

        let api = self.api.clone();
        let body = NewMessage {
            recipient: peer_id.to_string(),
            content,
            message_type,
        };
        let captured = local_id.clone();
        self.dispatch(async move {
            Completion::Sent {
                local_id: captured,
                result: api.send_message(&body).await,
            }
        });
        local_id
    }

    pub fn mark_as_read(&mut self, peer_id: &str) {
        let epoch = self.state.epoch;
        let api = self.api.clone();
        let peer = peer_id.to_string();
        self.dispatch(async move {
            let result = api.mark_read(&peer).await;
            Completion::MarkedRead {
                epoch,
                peer_id: peer,
                result,
            }
        });
    }

    pub fn notify_typing(&mut self, peer_id: &str, is_typing: bool) -> bool {
        let payload = TypingPayload {
            sender: self.state.me.id.clone(),
            recipient: peer_id.to_string(),
            is_typing,
        };
        match serde_json::to_value(&payload) {
            Ok(payload) => self.push.emit(EVENT_TYPING, payload),
            Err(e) => {
                error!("Failed to encode typing event: {}", e);
                false
            }
        }
    }

    // ─── Push handlers ───────────────────────────────────────────────────────

    pub fn on_receive_message(&mut self, incoming: IncomingMessage) {
        let message = incoming.into_message();
        if self.state.is_active(message.sender_id()) {
            if self.state.append(message.clone()) {
                self.notify(ChatEvent::NewMessage { message });
            } else {
                debug!("Duplicate message {} suppressed", message.id);
            }
        }
        self.refresh_conversations();
    }

    pub fn on_message_delivered(&mut self, incoming: IncomingMessage) {
        let Some(id) = incoming.id else {
            debug!("Delivery receipt without a message id");
            return;
        };
        if self.state.mark_delivered(&id, Utc::now()) {
            self.notify(ChatEvent::MessageDelivered { message_id: id });
        } else {
            debug!("Delivery receipt for {} not in view", id);
        }
    }

    pub fn on_user_typing(&mut self, typing: UserTyping) {
        let UserTyping { sender, is_typing } = typing;
        self.state.typing.insert(sender.clone(), is_typing);
        if is_typing {
            let tx = self.tx.clone();
            let peer_id = sender.clone();
            self.typing_timers
                .arm(&sender, self.typing_timeout, move |generation| {
                    let _ = tx.send(Event::TypingExpired {
                        peer_id,
                        generation,
                    });
                });
        } else {
            self.typing_timers.cancel(&sender);
        }
    }

    pub fn on_user_online(&mut self, ids: Vec<String>) {
        debug!("Presence snapshot: {} online", ids.len());
        self.state.set_online(ids);
    }

    fn on_typing_expired(&mut self, peer_id: &str, generation: u64) {
        if self.typing_timers.expire(peer_id, generation) {
            self.state.typing.insert(peer_id.to_string(), false);
        } else {
            debug!("Stale typing expiry for {} ignored", peer_id);
        }
    }

    // ─── Completions ─────────────────────────────────────────────────────────

    fn on_conversations(&mut self, seq: u64, result: Result<Vec<Conversation>>) {
        match result {
            Ok(list) => {
                if seq < self.conversations_applied {
                    debug!("Discarding out-of-order conversation list #{}", seq);
                    return;
                }
                self.conversations_applied = seq;
                self.state.conversations = list;
            }
            Err(e) => self.on_request_error("Loading conversations", e),
        }
    }

    fn on_page(
        &mut self,
        epoch: u64,
        peer_id: String,
        page: u32,
        mark_read: bool,
        result: Result<HistoryPage>,
    ) {
        if self.in_flight.get(&peer_id) == Some(&epoch) {
            self.in_flight.remove(&peer_id);
        }
        if epoch != self.state.epoch {
            debug!(
                "Discarding page {} for {} from epoch {} (now {})",
                page, peer_id, epoch, self.state.epoch
            );
            return;
        }
        self.state.loading = false;

        match result {
            Ok(history) => {
                debug!(
                    "Loaded page {} for {}: {} messages, more: {}",
                    page,
                    peer_id,
                    history.messages.len(),
                    history.has_more
                );
                self.state.apply_page(
                    page,
                    history.messages,
                    history.has_more,
                    &self.pending_sends,
                );
            }
            Err(e) => {
                self.on_request_error("Loading messages", e);
                if self.session_expired {
                    return;
                }
            }
        }

        if mark_read {
            self.mark_as_read(&peer_id);
        }
    }

    fn on_sent(&mut self, local_id: MessageId, result: Result<Message>) {
        self.pending_sends.remove(&local_id);
        match result {
            Ok(message) => {
                let server_id = message.id.clone();
                if self.state.reconcile(&local_id, message) {
                    debug!("Reconciled {} as {}", local_id, server_id);
                } else {
                    debug!("Optimistic {} no longer in view", local_id);
                }
                self.refresh_conversations();
            }
            Err(e) => {
                self.state.remove(&local_id);
                self.notify(ChatEvent::SendFailed {
                    local_id: local_id.to_string(),
                    reason: e.to_string(),
                });
                self.on_request_error("Sending message", e);
            }
        }
    }

    fn on_marked_read(&mut self, epoch: u64, peer_id: String, result: Result<Ack>) {
        match result {
            Ok(_) => {
                self.state.clear_unread(&peer_id);
                if epoch == self.state.epoch {
                    let count = self.state.mark_read_from(&peer_id, Utc::now());
                    debug!("Marked {} messages from {} read", count, peer_id);
                }
            }
            Err(e) => self.on_request_error("Marking messages as read", e),
        }
    }
}
