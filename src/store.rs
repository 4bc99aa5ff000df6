use chrono::{DateTime, Utc};
use log::{debug, warn};
use uuid::Uuid;

use crate::models::{
    ChatCredential, ChatMessage, MessageBody, MessagePage, MessageState, UserType,
};

/// Identifies the page fetch a result belongs to.
///
/// Results are only applied while the store still targets the same room
/// and load generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub room_id: i64,
    pub page: u32,
    generation: u64,
}

/// Lookup key for [`MessageStore::mutate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKey {
    Server(i64),
    Local(Uuid),
}

/// Partial update for an existing message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    /// `Some(true)` marks read; read messages never become unread again.
    pub is_read: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Ordered messages of the open room.
#[derive(Debug, Default)]
pub struct MessageStore {
    room_id: Option<i64>,
    messages: Vec<ChatMessage>,
    page: u32,
    is_last_page: bool,
    generation: u64,
    loading: Option<PageRequest>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_id(&self) -> Option<i64> {
        self.room_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_last_page(&self) -> bool {
        self.is_last_page
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_some()
    }

    /// Switches to `room_id` and empties the sequence; the caller fetches
    /// page 1 and hands it to [`MessageStore::apply_page`].
    pub fn begin_load(&mut self, room_id: i64) -> PageRequest {
        self.generation += 1;
        self.room_id = Some(room_id);
        self.messages.clear();
        self.page = 0;
        self.is_last_page = false;
        let request = PageRequest {
            room_id,
            page: 1,
            generation: self.generation,
        };
        self.loading = Some(request);
        request
    }

    /// Next older page, or `None` when there is nothing left to fetch.
    pub fn begin_load_more(&mut self) -> Option<PageRequest> {
        let room_id = self.room_id?;
        if self.is_last_page || self.loading.is_some() || self.page == 0 {
            return None;
        }
        let request = PageRequest {
            room_id,
            page: self.page + 1,
            generation: self.generation,
        };
        self.loading = Some(request);
        Some(request)
    }

    /// Applies a fetched page. Returns `false` when the result is stale.
    pub fn apply_page(&mut self, request: PageRequest, page: MessagePage) -> bool {
        if self.loading != Some(request) {
            debug!(
                "Discarding page {} for room {}: no longer current",
                request.page, request.room_id
            );
            return false;
        }
        self.loading = None;
        self.page = request.page;
        self.is_last_page = page.is_last_page;

        let mut incoming = Vec::with_capacity(page.messages.len());
        for wire in page.messages {
            match ChatMessage::try_from(wire) {
                Ok(message) => incoming.push(message),
                Err(e) => warn!("Skipping malformed message: {}", e),
            }
        }
        for message in incoming {
            self.insert_sorted(message);
        }
        true
    }

    /// Forgets an in-flight fetch so a failed load can be retried.
    pub fn abort_load(&mut self, request: PageRequest) {
        if self.loading == Some(request) {
            self.loading = None;
        }
    }

    pub fn reset(&mut self) {
        self.generation += 1;
        self.room_id = None;
        self.messages.clear();
        self.page = 0;
        self.is_last_page = false;
        self.loading = None;
    }

    /// Inserts a live message. Returns `false` if its id is already present.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if let Some(id) = message.state.server_id() {
            if self.position(MessageKey::Server(id)).is_some() {
                return false;
            }
        }
        self.insert_sorted(message);
        true
    }

    pub fn mutate(&mut self, key: MessageKey, patch: MessagePatch) -> bool {
        let Some(index) = self.position(key) else {
            return false;
        };
        let message = &mut self.messages[index];
        if patch.is_read == Some(true) {
            message.is_read = true;
        }
        if let Some(at) = patch.created_at {
            message.created_at = at;
            let message = self.messages.remove(index);
            self.insert_sorted(message);
        }
        true
    }

    /// Adds an optimistic echo of an outgoing message.
    pub fn insert_pending(
        &mut self,
        sender_type: UserType,
        sender_id: &str,
        body: MessageBody,
    ) -> Uuid {
        let local_id = Uuid::new_v4();
        self.insert_sorted(ChatMessage {
            state: MessageState::Pending(local_id),
            sender_type,
            sender_id: sender_id.to_string(),
            body,
            is_read: false,
            created_at: Utc::now(),
        });
        local_id
    }

    /// Replaces the pending echo `local_id` with its confirmed copy.
    ///
    /// If the confirmed id already arrived through another path the echo is
    /// dropped instead, so the message never appears twice.
    pub fn confirm(&mut self, local_id: Uuid, confirmed: ChatMessage) -> bool {
        let Some(index) = self.position(MessageKey::Local(local_id)) else {
            return false;
        };
        self.messages.remove(index);
        self.append(confirmed);
        true
    }

    /// Oldest pending echo whose body matches, for acks that carry no local id.
    pub fn pending_matching(&self, body: &MessageBody) -> Option<Uuid> {
        self.messages
            .iter()
            .filter(|m| m.state.is_pending() && &m.body == body)
            .find_map(|m| m.state.local_id())
    }

    /// Retracts a pending or failed echo. Confirmed messages are never removed.
    pub fn remove(&mut self, local_id: Uuid) -> Option<ChatMessage> {
        let index = self.position(MessageKey::Local(local_id))?;
        Some(self.messages.remove(index))
    }

    /// Failed echoes stay visible so the user can retry them.
    pub fn mark_failed(&mut self, local_id: Uuid) -> bool {
        match self.position(MessageKey::Local(local_id)) {
            Some(index) => {
                self.messages[index].state = MessageState::Failed(local_id);
                true
            }
            None => false,
        }
    }

    /// Pending echoes created at or before `deadline`.
    pub fn pending_older_than(&self, deadline: DateTime<Utc>) -> Vec<Uuid> {
        self.messages
            .iter()
            .filter(|m| m.state.is_pending() && m.created_at <= deadline)
            .filter_map(|m| m.state.local_id())
            .collect()
    }

    pub fn oldest_pending_at(&self) -> Option<DateTime<Utc>> {
        self.messages
            .iter()
            .filter(|m| m.state.is_pending())
            .map(|m| m.created_at)
            .min()
    }

    /// Marks the given server ids read; returns the ids that changed.
    pub fn mark_read(&mut self, ids: &[i64]) -> Vec<i64> {
        let mut changed = Vec::new();
        for message in &mut self.messages {
            if let Some(id) = message.state.server_id() {
                if !message.is_read && ids.contains(&id) {
                    message.is_read = true;
                    changed.push(id);
                }
            }
        }
        changed
    }

    /// Marks every message from the counterpart read. On `me`'s own
    /// messages the flag tracks the counterpart's reads, so those stay put.
    pub fn mark_all_read(&mut self, me: &ChatCredential) -> Vec<i64> {
        let mut changed = Vec::new();
        for message in &mut self.messages {
            if !message.is_read && !message.is_from(me) {
                message.is_read = true;
                if let Some(id) = message.state.server_id() {
                    changed.push(id);
                }
            }
        }
        changed
    }

    pub fn get(&self, id: i64) -> Option<&ChatMessage> {
        self.position(MessageKey::Server(id))
            .map(|index| &self.messages[index])
    }

    pub fn get_local(&self, local_id: Uuid) -> Option<&ChatMessage> {
        self.position(MessageKey::Local(local_id))
            .map(|index| &self.messages[index])
    }

    /// Newest server id, used to resume a dropped connection.
    pub fn last_confirmed_id(&self) -> Option<i64> {
        self.messages
            .iter()
            .rev()
            .find_map(|m| m.state.server_id())
    }

    fn position(&self, key: MessageKey) -> Option<usize> {
        self.messages.iter().position(|m| match key {
            MessageKey::Server(id) => m.state.server_id() == Some(id),
            MessageKey::Local(id) => m.state.local_id() == Some(id),
        })
    }

    fn insert_sorted(&mut self, message: ChatMessage) {
        if let Some(id) = message.state.server_id() {
            if let Some(index) = self.position(MessageKey::Server(id)) {
                let read = self.messages[index].is_read || message.is_read;
                self.messages[index] = message;
                self.messages[index].is_read = read;
                return;
            }
        }
        let index = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(index, message);
    }
}
