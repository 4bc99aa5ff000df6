use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::sync::watch;

use crate::api::ChatApi;
use crate::error::{ChatError, Result};
use crate::models::{ChatCredential, ChatRoom, PresenceStatus, ReadReceipt, StatusPayload, UserType};

/// Cached view of the current user's rooms.
pub struct RoomDirectory {
    api: Arc<dyn ChatApi>,
    credentials: watch::Receiver<ChatCredential>,
    rooms: Vec<ChatRoom>,
    resolved: HashMap<(i64, String), i64>,
    last_error: Option<ChatError>,
}

impl RoomDirectory {
    pub fn new(api: Arc<dyn ChatApi>, credentials: watch::Receiver<ChatCredential>) -> Self {
        RoomDirectory {
            api,
            credentials,
            rooms: Vec::new(),
            resolved: HashMap::new(),
            last_error: None,
        }
    }

    /// Current credential; drops every cached room if it changed since the last call.
    fn credential(&mut self) -> ChatCredential {
        if self.credentials.has_changed().unwrap_or(false) {
            info!("Credential changed, invalidating room cache");
            self.rooms.clear();
            self.resolved.clear();
            self.last_error = None;
        }
        self.credentials.borrow_and_update().clone()
    }

    fn authenticated_credential(&mut self) -> Result<ChatCredential> {
        let credential = self.credential();
        if credential.authenticated {
            Ok(credential)
        } else {
            Err(ChatError::AuthenticationRequired)
        }
    }

    /// Fetches the room list. Failures keep the previous list and are
    /// reported through [`RoomDirectory::last_error`].
    pub async fn list(&mut self) -> Vec<ChatRoom> {
        let result = match self.authenticated_credential() {
            Ok(credential) => self.api.list_rooms(&credential).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(rooms) => {
                self.rooms.clear();
                for room in rooms {
                    self.upsert(room);
                }
                self.last_error = None;
            }
            Err(e) => {
                warn!("Failed to load chat rooms: {}", e);
                self.last_error = Some(e);
            }
        }
        self.rooms.clone()
    }

    pub fn rooms(&self) -> &[ChatRoom] {
        &self.rooms
    }

    pub fn room(&self, room_id: i64) -> Option<&ChatRoom> {
        self.rooms.iter().find(|r| r.room_id == room_id)
    }

    pub fn last_error(&self) -> Option<&ChatError> {
        self.last_error.as_ref()
    }

    pub fn total_unread(&self) -> u32 {
        self.rooms.iter().map(|r| r.unread_count).sum()
    }

    pub async fn find_room(&mut self, request_id: i64, counterpart_id: &str) -> Result<Option<i64>> {
        let credential = self.authenticated_credential()?;
        self.api
            .find_room(&credential, request_id, counterpart_id)
            .await
    }

    /// Creates a room unconditionally. Use [`RoomDirectory::resolve_room`]
    /// unless the caller already knows no room exists.
    pub async fn create_room(&mut self, request_id: i64, counterpart_id: &str) -> Result<i64> {
        let credential = self.authenticated_credential()?;
        let created = self
            .api
            .create_room(&credential, request_id, counterpart_id)
            .await?;
        info!(
            "Created chat room {} for request {} (new: {})",
            created.room_id, request_id, created.is_new
        );
        Ok(created.room_id)
    }

    /// Finds the room for a request/counterpart pair, creating it when absent.
    ///
    /// Resolved ids are remembered until the credential changes, so repeated
    /// opens in one session never issue a second create.
    pub async fn resolve_room(&mut self, request_id: i64, counterpart_id: &str) -> Result<i64> {
        self.credential();
        let key = (request_id, counterpart_id.to_string());
        if let Some(room_id) = self.resolved.get(&key) {
            return Ok(*room_id);
        }
        let cached = self
            .rooms
            .iter()
            .find(|r| {
                r.request_id == Some(request_id)
                    && r.counterpart_id.as_deref() == Some(counterpart_id)
            })
            .map(|r| r.room_id);
        let room_id = match cached {
            Some(room_id) => room_id,
            None => match self.find_room(request_id, counterpart_id).await? {
                Some(room_id) => room_id,
                None => self.create_room(request_id, counterpart_id).await?,
            },
        };
        self.resolved.insert(key, room_id);
        Ok(room_id)
    }

    pub fn update_last_message(&mut self, room_id: i64, text: &str, at: DateTime<Utc>) {
        if let Some(room) = self.room_mut(room_id) {
            if room.last_message_time.map_or(true, |prev| prev <= at) {
                room.last_message = Some(text.to_string());
                room.last_message_time = Some(at);
            }
        }
    }

    pub fn update_unread_count(&mut self, room_id: i64, unread: u32) {
        if let Some(room) = self.room_mut(room_id) {
            room.unread_count = unread;
        }
    }

    pub fn increment_unread(&mut self, room_id: i64) {
        if let Some(room) = self.room_mut(room_id) {
            room.unread_count += 1;
        }
    }

    pub fn update_presence(&mut self, room_id: i64, status: PresenceStatus) {
        if let Some(room) = self.room_mut(room_id) {
            room.counterpart_status = status;
        }
    }

    /// Presence update keyed by user rather than room.
    pub fn update_presence_for_user(&mut self, user_id: &str, status: PresenceStatus) {
        for room in &mut self.rooms {
            if room.counterpart_id.as_deref() == Some(user_id) {
                room.counterpart_status = status;
            }
        }
    }

    pub async fn mark_messages_read(&mut self, room_id: i64, message_ids: &[i64]) -> Result<ReadReceipt> {
        let credential = self.authenticated_credential()?;
        let receipt = self
            .api
            .mark_messages_read(&credential, room_id, message_ids)
            .await?;
        self.update_unread_count(room_id, receipt.unread_count);
        Ok(receipt)
    }

    pub async fn mark_room_read(&mut self, room_id: i64) -> Result<ReadReceipt> {
        let credential = self.authenticated_credential()?;
        let receipt = self.api.mark_room_read(&credential, room_id).await?;
        self.update_unread_count(room_id, receipt.unread_count);
        Ok(receipt)
    }

    pub async fn presence(&mut self, user_id: &str, user_type: UserType) -> Result<StatusPayload> {
        let credential = self.authenticated_credential()?;
        let status = self.api.get_status(&credential, user_id, user_type).await?;
        self.update_presence_for_user(&status.user_id, status.status);
        Ok(status)
    }

    pub async fn set_presence(&mut self, status: PresenceStatus) -> Result<StatusPayload> {
        let credential = self.authenticated_credential()?;
        self.api.set_status(&credential, status).await
    }

    fn room_mut(&mut self, room_id: i64) -> Option<&mut ChatRoom> {
        self.rooms.iter_mut().find(|r| r.room_id == room_id)
    }

    fn upsert(&mut self, room: ChatRoom) {
        match self.room_mut(room.room_id) {
            Some(existing) => *existing = room,
            None => self.rooms.push(room),
        }
    }
}
