use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::ChatError;

/// Which side of the marketplace a chat participant belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserType {
    /// Vendor using the mobile app.
    App,
    /// Customer using the web site.
    Web,
}

impl UserType {
    pub fn as_str(self) -> &'static str {
        match self {
            UserType::App => "APP",
            UserType::Web => "WEB",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "APP" => Some(UserType::App),
            "WEB" => Some(UserType::Web),
            _ => None,
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    #[default]
    Offline,
}

/// Chat credentials derived from the host login session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCredential {
    pub token: String,
    pub user_id: String,
    pub user_type: UserType,
    pub authenticated: bool,
}

impl ChatCredential {
    pub fn unauthenticated() -> Self {
        ChatCredential {
            token: String::new(),
            user_id: String::new(),
            user_type: UserType::Web,
            authenticated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoom {
    pub room_id: i64,
    #[serde(default)]
    pub counterpart_name: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub counterpart_status: PresenceStatus,
    #[serde(default)]
    pub request_id: Option<i64>,
    #[serde(default, deserialize_with = "optional_id_string")]
    pub counterpart_id: Option<String>,
}

/// Delivery state of a message in the store.
///
/// Local echoes carry a client-generated id until the server assigns one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    Pending(Uuid),
    Confirmed(i64),
    Failed(Uuid),
}

impl MessageState {
    pub fn server_id(&self) -> Option<i64> {
        match self {
            MessageState::Confirmed(id) => Some(*id),
            _ => None,
        }
    }

    pub fn local_id(&self) -> Option<Uuid> {
        match self {
            MessageState::Pending(id) | MessageState::Failed(id) => Some(*id),
            MessageState::Confirmed(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageState::Pending(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    /// Server-side path returned by the upload endpoint.
    Attachment(String),
}

impl MessageBody {
    /// Short text for room list previews.
    pub fn preview(&self) -> String {
        match self {
            MessageBody::Text(text) => text.clone(),
            MessageBody::Attachment(path) => {
                let name = path.rsplit('/').next().unwrap_or(path);
                format!("[file] {name}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub state: MessageState,
    pub sender_type: UserType,
    pub sender_id: String,
    pub body: MessageBody,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn is_from(&self, credential: &ChatCredential) -> bool {
        self.sender_type == credential.user_type && self.sender_id == credential.user_id
    }
}

/// A message as the backend serializes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub message_id: i64,
    pub sender_type: UserType,
    #[serde(deserialize_with = "id_string")]
    pub sender_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    /// Echo of the client's local id on acknowledgements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<Uuid>,
}

impl TryFrom<WireMessage> for ChatMessage {
    type Error = ChatError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let body = match (wire.text, wire.file_path) {
            (Some(text), None) => MessageBody::Text(text),
            (None, Some(path)) => MessageBody::Attachment(path),
            (Some(_), Some(_)) => {
                return Err(ChatError::InvalidResponse(format!(
                    "message {} has both text and file path",
                    wire.message_id
                )))
            }
            (None, None) => {
                return Err(ChatError::InvalidResponse(format!(
                    "message {} has neither text nor file path",
                    wire.message_id
                )))
            }
        };
        Ok(ChatMessage {
            state: MessageState::Confirmed(wire.message_id),
            sender_type: wire.sender_type,
            sender_id: wire.sender_id,
            body,
            is_read: wire.is_read,
            created_at: wire.created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<WireMessage>,
    pub page: u32,
    pub limit: u32,
    #[serde(default)]
    pub total: u64,
    pub is_last_page: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundRoom {
    pub room_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRoom {
    pub room_id: i64,
    #[serde(default)]
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub file_path: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(default)]
    pub read_message_ids: Vec<i64>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    #[serde(deserialize_with = "id_string")]
    pub user_id: String,
    pub user_type: UserType,
    pub status: PresenceStatus,
}

/// A file picked by the user, ready for upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Number(i64),
}

impl From<IdRepr> for String {
    fn from(id: IdRepr) -> Self {
        match id {
            IdRepr::Text(text) => text,
            IdRepr::Number(n) => n.to_string(),
        }
    }
}

/// Backends disagree on whether user ids are numbers or strings.
pub(crate) fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    IdRepr::deserialize(deserializer).map(String::from)
}

fn optional_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<IdRepr>::deserialize(deserializer).map(|id| id.map(String::from))
}
