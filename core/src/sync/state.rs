/// Authoritative in-memory chat state. Written only by the sync loop.
use crate::messenger_types::{Conversation, Message, MessageId, User};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

/// History position of the active conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PaginationCursor {
    /// Last page applied
    pub page: u32,
    pub has_more: bool,
}

impl Default for PaginationCursor {
    fn default() -> Self {
        Self {
            page: 1,
            has_more: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatState {
    /// The signed-in user
    pub me: User,
    pub conversations: Vec<Conversation>,
    /// Peer id of the active conversation
    pub active: Option<String>,
    /// Messages of the active conversation, oldest first
    pub messages: Vec<Message>,
    /// Online user ids, as of the last presence snapshot
    pub online: BTreeSet<String>,
    pub typing: HashMap<String, bool>,
    pub cursor: PaginationCursor,
    /// A history fetch for the active conversation is in flight
    pub loading: bool,
    /// Bumped on every active-conversation switch
    pub epoch: u64,
    /// Push channel up, as last reported by the connector
    pub connected: bool,
}

impl ChatState {
    pub fn new(me: User) -> Self {
        Self {
            me,
            conversations: Vec::new(),
            active: None,
            messages: Vec::new(),
            online: BTreeSet::new(),
            typing: HashMap::new(),
            cursor: PaginationCursor::default(),
            loading: false,
            epoch: 0,
            connected: false,
        }
    }

    pub fn is_active(&self, peer_id: &str) -> bool {
        self.active.as_deref() == Some(peer_id)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    pub fn is_typing(&self, user_id: &str) -> bool {
        self.typing.get(user_id).copied().unwrap_or(false)
    }

    pub fn conversation(&self, peer_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.peer_id() == peer_id)
    }

    /// Switch the active conversation. Returns the new epoch.
    pub fn switch_to(&mut self, peer_id: Option<String>) -> u64 {
        self.epoch += 1;
        self.active = peer_id;
        self.messages.clear();
        self.cursor = PaginationCursor::default();
        self.loading = false;
        self.epoch
    }

    pub fn contains_server_id(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.server_id() == Some(id))
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// Apply one history page.
    ///
    /// Page 1 replaces the list; entries in `keep` (optimistic sends still
    /// awaiting the server) survive at the tail. Later pages go in front,
    /// skipping anything already visible.
    pub fn apply_page(
        &mut self,
        requested: u32,
        messages: Vec<Message>,
        has_more: bool,
        keep: &HashSet<MessageId>,
    ) {
        if requested <= 1 {
            let pending: Vec<Message> = self
                .messages
                .drain(..)
                .filter(|m| keep.contains(&m.id))
                .collect();
            self.messages = messages;
            self.messages.extend(pending);
        } else {
            let mut older: Vec<Message> = messages
                .into_iter()
                .filter(|m| match m.server_id() {
                    Some(id) => !self.contains_server_id(id),
                    None => true,
                })
                .collect();
            older.append(&mut self.messages);
            self.messages = older;
        }
        self.cursor = PaginationCursor {
            page: requested.max(1),
            has_more,
        };
    }

    /// Append a live message unless its server id is already visible.
    pub fn append(&mut self, message: Message) -> bool {
        if let Some(id) = message.server_id() {
            if self.contains_server_id(id) {
                return false;
            }
        }
        self.messages.push(message);
        true
    }

    /// Swap the optimistic entry `local_id` for the persisted message,
    /// keeping its position. If the persisted id already arrived by
    /// another path, the optimistic entry is simply dropped.
    pub fn reconcile(&mut self, local_id: &MessageId, canonical: Message) -> bool {
        let Some(pos) = self.position(local_id) else {
            return false;
        };
        let duplicate = canonical
            .server_id()
            .map(|id| self.contains_server_id(id))
            .unwrap_or(false);
        if duplicate {
            self.messages.remove(pos);
        } else {
            self.messages[pos] = canonical;
        }
        true
    }

    pub fn remove(&mut self, id: &MessageId) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.messages.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Flag every loaded message from `sender_id` as read. Returns the count.
    pub fn mark_read_from(&mut self, sender_id: &str, at: DateTime<Utc>) -> usize {
        let mut count = 0;
        for msg in self.messages.iter_mut().filter(|m| m.sender_id() == sender_id) {
            msg.mark_read(at);
            count += 1;
        }
        count
    }

    pub fn clear_unread(&mut self, peer_id: &str) {
        for conv in self
            .conversations
            .iter_mut()
            .filter(|c| c.peer_id() == peer_id)
        {
            conv.unread_count = 0;
        }
    }

    pub fn mark_delivered(&mut self, server_id: &str, at: DateTime<Utc>) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|m| m.server_id() == Some(server_id))
        {
            Some(msg) => {
                msg.mark_delivered(at);
                true
            }
            None => false,
        }
    }

    /// Presence is a full snapshot, never a delta
    pub fn set_online(&mut self, ids: Vec<String>) {
        self.online = ids.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger_types::{MessageType, UserRef};

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            username: id.to_string(),
            email: format!("{}@example.com", id),
            avatar: None,
            is_online: true,
            last_seen: None,
        }
    }

    fn server_msg(id: &str, from: &str, to: &str) -> Message {
        let now = Utc::now();
        Message {
            id: MessageId::Server(id.to_string()),
            sender: UserRef::Id(from.to_string()),
            recipient: UserRef::Id(to.to_string()),
            content: format!("content of {}", id),
            message_type: MessageType::Text,
            is_read: false,
            read_at: None,
            is_delivered: true,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn ids(state: &ChatState) -> Vec<String> {
        state.messages.iter().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn test_switch_clears_and_bumps_epoch() {
        let mut state = ChatState::new(user("me"));
        state.switch_to(Some("u2".to_string()));
        state.append(server_msg("m1", "u2", "me"));
        state.cursor = PaginationCursor {
            page: 3,
            has_more: false,
        };

        let epoch = state.switch_to(Some("u3".to_string()));
        assert_eq!(epoch, 2);
        assert!(state.messages.is_empty());
        assert_eq!(state.cursor, PaginationCursor::default());
        assert!(state.is_active("u3"));
    }

    #[test]
    fn test_older_pages_are_prepended_without_duplicates() {
        let mut state = ChatState::new(user("me"));
        let keep = HashSet::new();
        state.apply_page(
            1,
            vec![server_msg("m3", "u2", "me"), server_msg("m4", "me", "u2")],
            true,
            &keep,
        );
        state.apply_page(
            2,
            vec![
                server_msg("m1", "u2", "me"),
                server_msg("m2", "u2", "me"),
                server_msg("m3", "u2", "me"),
            ],
            false,
            &keep,
        );
        assert_eq!(ids(&state), vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(
            state.cursor,
            PaginationCursor {
                page: 2,
                has_more: false
            }
        );
    }

    #[test]
    fn test_first_page_keeps_pending_sends() {
        let mut state = ChatState::new(user("me"));
        let me = state.me.clone();
        let local = MessageId::local();
        state.append(Message::optimistic(
            local.clone(),
            &me,
            "u2",
            "hi".to_string(),
            MessageType::Text,
        ));
        let stray = server_msg("x", "u2", "me");
        state.append(stray);

        let keep: HashSet<MessageId> = [local.clone()].into_iter().collect();
        state.apply_page(1, vec![server_msg("m1", "u2", "me")], false, &keep);
        assert_eq!(ids(&state), vec!["m1".to_string(), local.to_string()]);
    }

    #[test]
    fn test_reconcile_replaces_in_place() {
        let mut state = ChatState::new(user("me"));
        let me = state.me.clone();
        state.append(server_msg("m0", "u2", "me"));
        let local = MessageId::local();
        state.append(Message::optimistic(
            local.clone(),
            &me,
            "u2",
            "hi".to_string(),
            MessageType::Text,
        ));
        state.append(server_msg("m2", "u2", "me"));

        assert!(state.reconcile(&local, server_msg("m1", "me", "u2")));
        assert_eq!(ids(&state), vec!["m0", "m1", "m2"]);
        assert!(!state.reconcile(&local, server_msg("m1", "me", "u2")));
    }

    #[test]
    fn test_reconcile_drops_optimistic_when_already_delivered() {
        let mut state = ChatState::new(user("me"));
        let me = state.me.clone();
        let local = MessageId::local();
        state.append(Message::optimistic(
            local.clone(),
            &me,
            "u2",
            "hi".to_string(),
            MessageType::Text,
        ));
        state.append(server_msg("m1", "me", "u2"));

        assert!(state.reconcile(&local, server_msg("m1", "me", "u2")));
        assert_eq!(ids(&state), vec!["m1"]);
    }

    #[test]
    fn test_append_dedups_by_server_id() {
        let mut state = ChatState::new(user("me"));
        assert!(state.append(server_msg("m1", "u2", "me")));
        assert!(!state.append(server_msg("m1", "u2", "me")));
        assert_eq!(state.messages.len(), 1);
    }

    #[test]
    fn test_presence_is_a_snapshot() {
        let mut state = ChatState::new(user("me"));
        state.set_online(vec!["a".to_string(), "b".to_string()]);
        state.set_online(vec!["c".to_string()]);
        assert!(!state.is_online("a"));
        assert!(state.is_online("c"));
        assert_eq!(state.online.len(), 1);
    }

    #[test]
    fn test_mark_delivered_by_server_id() {
        let mut state = ChatState::new(user("me"));
        let mut msg = server_msg("m1", "me", "u2");
        msg.is_delivered = false;
        state.append(msg);
        assert!(state.mark_delivered("m1", Utc::now()));
        assert!(state.messages[0].is_delivered);
        assert!(state.messages[0].delivered_at.is_some());
        assert!(!state.mark_delivered("nope", Utc::now()));
    }
}
