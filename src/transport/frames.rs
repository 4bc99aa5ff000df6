use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{id_string, PresenceStatus, UserType, WireMessage};

const KNOWN_TYPES: &[&str] = &[
    "message",
    "message_sent",
    "typing_status",
    "message_read_update",
    "connection",
    "pong",
    "user_status",
    "error",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    /// A message posted to the room by anyone, including this user from another device.
    #[serde(rename = "message")]
    Message { message: WireMessage },
    /// Acknowledgement of a message this connection sent.
    #[serde(rename = "message_sent")]
    MessageSent { message: WireMessage },
    #[serde(rename = "typing_status", rename_all = "camelCase")]
    TypingStatus {
        #[serde(deserialize_with = "id_string")]
        user_id: String,
        #[serde(default)]
        user_type: Option<UserType>,
        is_typing: bool,
    },
    #[serde(rename = "message_read_update", rename_all = "camelCase")]
    MessageReadUpdate {
        #[serde(default)]
        message_id: Option<i64>,
        #[serde(default)]
        message_ids: Vec<i64>,
    },
    #[serde(rename = "connection")]
    Connection {
        #[serde(default)]
        status: String,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "user_status", rename_all = "camelCase")]
    UserStatus {
        #[serde(deserialize_with = "id_string")]
        user_id: String,
        status: PresenceStatus,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
}

impl InboundFrame {
    /// Parses a text frame. Unknown or malformed frames are logged and dropped.
    pub fn parse(text: &str) -> Option<InboundFrame> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring non-JSON chat frame: {}", e);
                return None;
            }
        };
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            warn!("Ignoring chat frame with unknown type {:?}", kind);
            return None;
        }
        match serde_json::from_value(value) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Ignoring malformed {} frame: {}", kind, e);
                None
            }
        }
    }

    /// Ids carried by a read update, whichever field the server used.
    pub fn read_ids(message_id: Option<i64>, message_ids: Vec<i64>) -> Vec<i64> {
        let mut ids = message_ids;
        if let Some(id) = message_id {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "message", rename_all = "camelCase")]
    Message { text: String, temp_id: Uuid },
    #[serde(rename = "file", rename_all = "camelCase")]
    File { file_path: String, temp_id: Uuid },
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing { is_typing: bool },
    #[serde(rename = "ping")]
    Ping,
}
