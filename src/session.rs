use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::api::ChatApi;
use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::models::{
    ChatCredential, ChatMessage, FileUpload, MessageBody, MessageState, PresenceStatus,
};
use crate::receipts::{Intersection, ReadReceiptTracker};
use crate::rooms::RoomDirectory;
use crate::store::{MessageKey, MessageStore, PageRequest};
use crate::transport::{
    ConnectionStatus, RealtimeEvent, Transport, TransportEvent, TransportSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open { room_id: i64 },
}

/// What the UI needs to react to after [`ChatSession::next_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MessageReceived(ChatMessage),
    /// A pending echo (or a message sent from another device) was confirmed.
    MessageConfirmed {
        local_id: Option<Uuid>,
        message: ChatMessage,
    },
    /// An outgoing message was not acknowledged in time.
    SendFailed {
        local_id: Uuid,
        error: ChatError,
        restored_draft: Option<String>,
    },
    CounterpartTyping(bool),
    MessagesRead(Vec<i64>),
    Presence {
        user_id: String,
        status: PresenceStatus,
    },
    Connection(ConnectionStatus),
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// Reconnecting gave up; call [`ChatSession::reconnect`] to try again.
    ConnectionLost(ChatError),
    ServerError(String),
    /// The user signed out (or another user signed in); the room was closed.
    SignedOut,
}

/// Drives one chat window: room resolution, history, live traffic and
/// read receipts.
pub struct ChatSession {
    api: Arc<dyn ChatApi>,
    credentials: watch::Receiver<ChatCredential>,
    watching_credentials: bool,
    /// Who the open room was bound for.
    owner: Option<ChatCredential>,
    rooms: RoomDirectory,
    store: MessageStore,
    receipts: ReadReceiptTracker,
    transport: Transport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    state: SessionState,
    binding: Option<u64>,
    page_size: u32,
    ack_timeout: Duration,
    draft: String,
    typing: bool,
    counterpart_typing: bool,
}

impl ChatSession {
    pub fn new(
        config: &ChatConfig,
        api: Arc<dyn ChatApi>,
        credentials: watch::Receiver<ChatCredential>,
    ) -> Result<Self> {
        config.validate()?;
        let (transport, events) = Transport::new(TransportSettings::from_config(config)?);
        Ok(ChatSession {
            rooms: RoomDirectory::new(Arc::clone(&api), credentials.clone()),
            api,
            credentials,
            watching_credentials: true,
            owner: None,
            store: MessageStore::new(),
            receipts: ReadReceiptTracker::new(config.read_threshold),
            transport,
            events,
            state: SessionState::Closed,
            binding: None,
            page_size: config.page_size,
            ack_timeout: config.ack_timeout(),
            draft: String::new(),
            typing: false,
            counterpart_typing: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room_id(&self) -> Option<i64> {
        match self.state {
            SessionState::Open { room_id } => Some(room_id),
            _ => None,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.store.messages()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    pub fn rooms_mut(&mut self) -> &mut RoomDirectory {
        &mut self.rooms
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn is_counterpart_typing(&self) -> bool {
        self.counterpart_typing
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.subscribe_status()
    }

    fn credential(&self) -> Result<ChatCredential> {
        let credential = self.credentials.borrow().clone();
        if credential.authenticated {
            Ok(credential)
        } else {
            Err(ChatError::AuthenticationRequired)
        }
    }

    /// Opens the chat between this user and `counterpart_id` about a quote
    /// request, creating the room on first contact.
    pub async fn open(&mut self, request_id: i64, counterpart_id: &str) -> Result<i64> {
        let credential = self.credential()?;
        if self.state != SessionState::Closed {
            self.close().await;
        }
        self.state = SessionState::Opening;
        match self.bind(&credential, request_id, counterpart_id).await {
            Ok(room_id) => {
                info!(
                    "Opened chat room {} for request {} with {}",
                    room_id, request_id, counterpart_id
                );
                self.state = SessionState::Open { room_id };
                Ok(room_id)
            }
            Err(e) => {
                warn!("Failed to open chat for request {}: {}", request_id, e);
                self.close().await;
                Err(e)
            }
        }
    }

    async fn bind(
        &mut self,
        credential: &ChatCredential,
        request_id: i64,
        counterpart_id: &str,
    ) -> Result<i64> {
        let room_id = self.rooms.resolve_room(request_id, counterpart_id).await?;
        let request = self.store.begin_load(room_id);
        self.receipts.reset();
        self.owner = Some(credential.clone());
        self.binding = Some(self.transport.connect(credential, room_id, None)?);
        self.fetch(request).await?;
        Ok(room_id)
    }

    pub async fn close(&mut self) {
        self.transport.disconnect().await;
        self.binding = None;
        self.owner = None;
        self.store.reset();
        self.receipts.reset();
        self.draft.clear();
        self.typing = false;
        self.counterpart_typing = false;
        if self.state != SessionState::Closed {
            debug!("Chat session closed");
        }
        self.state = SessionState::Closed;
    }

    /// Fetches the next older page. Returns whether anything was applied.
    pub async fn load_more(&mut self) -> Result<bool> {
        if self.room_id().is_none() {
            return Ok(false);
        }
        match self.store.begin_load_more() {
            Some(request) => self.fetch(request).await,
            None => Ok(false),
        }
    }

    async fn fetch(&mut self, request: PageRequest) -> Result<bool> {
        let page = match self.credential() {
            Ok(credential) => {
                self.api
                    .fetch_messages(&credential, request.room_id, request.page, self.page_size)
                    .await
            }
            Err(e) => Err(e),
        };
        match page {
            Ok(page) => {
                let applied = self.store.apply_page(request, page);
                if let Some(id) = self.store.last_confirmed_id() {
                    self.transport.note_message(id);
                }
                Ok(applied)
            }
            Err(e) => {
                self.store.abort_load(request);
                Err(e)
            }
        }
    }

    /// Sends a text message with an optimistic echo.
    ///
    /// Returns the echo's local id, or `None` when there was nothing to send.
    /// On failure the echo is retracted and the draft restored.
    pub fn send(&mut self, text: &str) -> Result<Option<Uuid>> {
        if text.trim().is_empty() || self.room_id().is_none() {
            return Ok(None);
        }
        let credential = self.credential()?;
        let local_id = self.store.insert_pending(
            credential.user_type,
            &credential.user_id,
            MessageBody::Text(text.to_string()),
        );
        if let Err(e) = self.transport.send_text(text.to_string(), local_id) {
            warn!("Failed to send chat message: {}", e);
            self.store.remove(local_id);
            self.draft = text.to_string();
            return Err(e);
        }
        self.draft.clear();
        self.stop_typing();
        Ok(Some(local_id))
    }

    /// Uploads `file`, then posts a message pointing at the stored copy.
    pub async fn upload_and_send(&mut self, file: FileUpload) -> Result<Uuid> {
        let room_id = self
            .room_id()
            .ok_or_else(|| ChatError::Upload("no chat room is open".into()))?;
        let credential = self.credential()?;
        let name = file.file_name.clone();
        let uploaded = self.api.upload_file(&credential, room_id, file).await?;
        debug!("Uploaded {} to {}", name, uploaded.file_path);
        let local_id = self.store.insert_pending(
            credential.user_type,
            &credential.user_id,
            MessageBody::Attachment(uploaded.file_path.clone()),
        );
        if let Err(e) = self.transport.send_file(uploaded.file_path, local_id) {
            warn!("Failed to send attachment message: {}", e);
            self.store.mark_failed(local_id);
            return Err(e);
        }
        Ok(local_id)
    }

    /// Re-sends a failed echo under a fresh local id.
    pub fn retry(&mut self, local_id: Uuid) -> Result<Uuid> {
        let credential = self.credential()?;
        let failed = self
            .store
            .messages()
            .iter()
            .find(|m| m.state == MessageState::Failed(local_id))
            .map(|m| m.body.clone())
            .ok_or_else(|| ChatError::Send(format!("no failed message {local_id}")))?;
        self.store.remove(local_id);
        let retry_id =
            self.store
                .insert_pending(credential.user_type, &credential.user_id, failed.clone());
        let sent = match failed {
            MessageBody::Text(text) => self.transport.send_text(text, retry_id),
            MessageBody::Attachment(path) => self.transport.send_file(path, retry_id),
        };
        if let Err(e) = sent {
            self.store.mark_failed(retry_id);
            return Err(e);
        }
        Ok(retry_id)
    }

    /// Records the draft and signals typing to the counterpart.
    pub fn type_draft(&mut self, text: &str) {
        self.draft = text.to_string();
        if self.room_id().is_none() {
            return;
        }
        if text.is_empty() {
            self.stop_typing();
            return;
        }
        match self.transport.send_typing(true) {
            Ok(()) => self.typing = true,
            Err(e) => debug!("Typing signal dropped: {}", e),
        }
    }

    fn stop_typing(&mut self) {
        if std::mem::take(&mut self.typing) {
            if let Err(e) = self.transport.send_typing(false) {
                debug!("Typing signal dropped: {}", e);
            }
        }
    }

    /// Feeds UI visibility reports to the read tracker and flushes one batch.
    pub async fn report_visibility(&mut self, entries: &[Intersection]) -> Result<usize> {
        let Some(room_id) = self.room_id() else {
            return Ok(0);
        };
        let credential = self.credential()?;
        self.receipts.observe(entries, &mut self.store, &credential);
        Ok(self.flush_receipts(room_id).await)
    }

    /// Records page visibility. While hidden nothing is reported read; on
    /// return whatever is still on screen is reconsidered and flushed.
    pub async fn set_page_visible(&mut self, visible: bool) -> Result<usize> {
        if !self.receipts.set_page_visible(visible) {
            return Ok(0);
        }
        let Some(room_id) = self.room_id() else {
            return Ok(0);
        };
        let credential = self.credential()?;
        self.receipts.rescan(&mut self.store, &credential);
        Ok(self.flush_receipts(room_id).await)
    }

    async fn flush_receipts(&mut self, room_id: i64) -> usize {
        let Some(batch) = self.receipts.take_batch() else {
            return 0;
        };
        match self.rooms.mark_messages_read(room_id, &batch).await {
            Ok(_) => batch.len(),
            Err(e) => {
                debug!("Read receipts for room {} not delivered: {}", room_id, e);
                self.receipts.requeue(batch);
                0
            }
        }
    }

    pub async fn mark_all_read(&mut self) -> Result<()> {
        let Some(room_id) = self.room_id() else {
            return Ok(());
        };
        let credential = self.credential()?;
        self.store.mark_all_read(&credential);
        self.rooms.mark_room_read(room_id).await?;
        Ok(())
    }

    /// Rebinds the open room after reconnecting gave up.
    pub fn reconnect(&mut self) -> Result<()> {
        let Some(room_id) = self.room_id() else {
            return Ok(());
        };
        if self.transport.binding().is_some() {
            return Ok(());
        }
        let credential = self.credential()?;
        let last_seen = self.store.last_confirmed_id();
        info!("Reconnecting chat room {}", room_id);
        self.binding = Some(self.transport.connect(&credential, room_id, last_seen)?);
        Ok(())
    }

    /// Waits for the next thing the UI should know about.
    ///
    /// Transport events are applied to the store and room list before they
    /// are returned. Pending echoes that outlive the ack timeout surface as
    /// [`SessionEvent::SendFailed`]. Signing out closes the open room.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let deadline = self.ack_deadline();
            tokio::select! {
                event = self.events.recv() => {
                    if let Some(event) = self.handle(event?) {
                        return Some(event);
                    }
                }
                changed = self.credentials.changed(), if self.watching_credentials => {
                    if changed.is_err() {
                        debug!("Credential source dropped");
                        self.watching_credentials = false;
                        continue;
                    }
                    if self.signed_out() {
                        info!("Credential changed; closing chat room {:?}", self.room_id());
                        self.close().await;
                        return Some(SessionEvent::SignedOut);
                    }
                }
                () = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(event) = self.expire_pending() {
                        return Some(event);
                    }
                }
            }
        }
    }

    fn ack_deadline(&self) -> Option<Instant> {
        let oldest = self.store.oldest_pending_at()?;
        let waited = (Utc::now() - oldest).to_std().unwrap_or_default();
        Some(Instant::now() + self.ack_timeout.saturating_sub(waited))
    }

    fn expire_pending(&mut self) -> Option<SessionEvent> {
        let ack_timeout = chrono::Duration::from_std(self.ack_timeout).ok()?;
        let local_id = *self
            .store
            .pending_older_than(Utc::now() - ack_timeout)
            .first()?;
        let error = ChatError::Send("no acknowledgement from server".into());
        warn!("Message {} timed out waiting for acknowledgement", local_id);
        let restored_draft = match self.store.get_local(local_id).map(|m| m.body.clone()) {
            Some(MessageBody::Text(text)) => {
                self.store.remove(local_id);
                if self.draft.is_empty() {
                    self.draft.clone_from(&text);
                }
                Some(text)
            }
            _ => {
                self.store.mark_failed(local_id);
                None
            }
        };
        Some(SessionEvent::SendFailed {
            local_id,
            error,
            restored_draft,
        })
    }

    /// True when the room is bound for a user who is no longer signed in.
    fn signed_out(&self) -> bool {
        let Some(owner) = &self.owner else {
            return false;
        };
        let current = self.credentials.borrow();
        !current.authenticated
            || current.user_id != owner.user_id
            || current.user_type != owner.user_type
    }

    fn handle(&mut self, event: TransportEvent) -> Option<SessionEvent> {
        if Some(event.binding) != self.binding {
            debug!("Dropping event from stale binding {}", event.binding);
            return None;
        }
        if self.signed_out() {
            debug!("Dropping event for signed-out user");
            return None;
        }
        self.apply(event)
    }

    fn apply(&mut self, event: TransportEvent) -> Option<SessionEvent> {
        let room_id = event.room_id;
        match event.event {
            RealtimeEvent::Message(message) => self.receive(room_id, message),
            RealtimeEvent::MessageSent { message, temp_id } => {
                self.acknowledge(room_id, message, temp_id)
            }
            RealtimeEvent::Typing {
                user_id, is_typing, ..
            } => {
                let me = self.credentials.borrow().user_id.clone();
                if user_id == me {
                    return None;
                }
                self.counterpart_typing = is_typing;
                Some(SessionEvent::CounterpartTyping(is_typing))
            }
            RealtimeEvent::MessagesRead(ids) => {
                let changed = self.store.mark_read(&ids);
                (!changed.is_empty()).then_some(SessionEvent::MessagesRead(changed))
            }
            RealtimeEvent::Handshake { status, detail } => {
                debug!(
                    "Chat handshake for room {}: {} {}",
                    room_id,
                    status,
                    detail.unwrap_or_default()
                );
                None
            }
            RealtimeEvent::Presence { user_id, status } => {
                self.rooms.update_presence_for_user(&user_id, status);
                Some(SessionEvent::Presence { user_id, status })
            }
            RealtimeEvent::ServerError(message) => Some(SessionEvent::ServerError(message)),
            RealtimeEvent::Pong => None,
            RealtimeEvent::Status(status) => Some(SessionEvent::Connection(status)),
            RealtimeEvent::Reconnecting { attempt, delay } => {
                Some(SessionEvent::Reconnecting { attempt, delay })
            }
            RealtimeEvent::ConnectionFailed(error) => Some(SessionEvent::ConnectionLost(error)),
        }
    }

    fn receive(&mut self, room_id: i64, message: ChatMessage) -> Option<SessionEvent> {
        let me = self.credentials.borrow().clone();
        let mine = message.is_from(&me);
        if mine {
            if let Some(local_id) = self.store.pending_matching(&message.body) {
                self.store.confirm(local_id, message.clone());
                self.rooms
                    .update_last_message(room_id, &message.body.preview(), message.created_at);
                return Some(SessionEvent::MessageConfirmed {
                    local_id: Some(local_id),
                    message,
                });
            }
        }
        // Replays after a reconnect carry ids the store already holds.
        if !self.store.append(message.clone()) {
            return None;
        }
        self.rooms
            .update_last_message(room_id, &message.body.preview(), message.created_at);
        if !mine {
            self.counterpart_typing = false;
            if !message.is_read {
                self.rooms.increment_unread(room_id);
            }
        }
        Some(SessionEvent::MessageReceived(message))
    }

    fn acknowledge(
        &mut self,
        room_id: i64,
        message: ChatMessage,
        temp_id: Option<Uuid>,
    ) -> Option<SessionEvent> {
        let local_id = temp_id
            .filter(|id| self.store.get_local(*id).is_some())
            .or_else(|| self.store.pending_matching(&message.body));
        match local_id {
            Some(local_id) => {
                self.store.confirm(local_id, message.clone());
            }
            None if !self.store.append(message.clone()) => return None,
            None => {}
        }
        self.rooms
            .update_last_message(room_id, &message.body.preview(), message.created_at);
        Some(SessionEvent::MessageConfirmed { local_id, message })
    }

    /// Sets this user's presence.
    pub async fn set_presence(&mut self, status: PresenceStatus) -> Result<()> {
        self.rooms.set_presence(status).await.map(|_| ())
    }

    pub fn find(&self, key: MessageKey) -> Option<&ChatMessage> {
        match key {
            MessageKey::Server(id) => self.store.get(id),
            MessageKey::Local(id) => self.store.get_local(id),
        }
    }
}
