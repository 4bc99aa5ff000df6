use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use warp::ws::{Message, WebSocket};
use warp::Filter;

/// How the mock chat socket behaves.
#[derive(Clone, Default)]
pub struct Script {
    /// Reply to `message`/`file` frames with a `message_sent` ack.
    pub ack: bool,
    /// Sent on the first connection, which is then dropped without a close frame.
    pub first_connection_frame: Option<Value>,
}

#[derive(Default)]
struct Recorded {
    connections: Vec<HashMap<String, String>>,
    frames: Vec<Value>,
    close_codes: Vec<u16>,
}

#[derive(Clone)]
pub struct MockChatSocket {
    pub addr: SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
}

impl MockChatSocket {
    pub async fn start(script: Script) -> Self {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let state = recorded.clone();
        let route = warp::path!("ws" / "chat")
            .and(warp::ws())
            .and(warp::query::<HashMap<String, String>>())
            .map(move |ws: warp::ws::Ws, query: HashMap<String, String>| {
                let state = state.clone();
                let script = script.clone();
                ws.on_upgrade(move |socket| serve(socket, query, state, script))
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        MockChatSocket { addr, recorded }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/chat", self.addr)
    }

    pub fn connections(&self) -> Vec<HashMap<String, String>> {
        self.recorded.lock().unwrap().connections.clone()
    }

    pub fn frames(&self) -> Vec<Value> {
        self.recorded.lock().unwrap().frames.clone()
    }

    pub fn close_codes(&self) -> Vec<u16> {
        self.recorded.lock().unwrap().close_codes.clone()
    }

    /// Polls until `check` holds or two seconds pass.
    pub async fn wait_for(&self, check: impl Fn(&MockChatSocket) -> bool) -> bool {
        for _ in 0..200 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

async fn serve(
    socket: WebSocket,
    query: HashMap<String, String>,
    state: Arc<Mutex<Recorded>>,
    script: Script,
) {
    let connection = {
        let mut recorded = state.lock().unwrap();
        recorded.connections.push(query.clone());
        recorded.connections.len()
    };
    let (mut tx, mut rx) = socket.split();
    let hello = json!({"type": "connection", "status": "connected"});
    if tx.send(Message::text(hello.to_string())).await.is_err() {
        return;
    }
    if connection == 1 {
        if let Some(frame) = script.first_connection_frame {
            let _ = tx.send(Message::text(frame.to_string())).await;
            return;
        }
    }

    let mut next_id = 1000;
    while let Some(Ok(message)) = rx.next().await {
        if message.is_close() {
            if let Some((code, _)) = message.close_frame() {
                state.lock().unwrap().close_codes.push(code);
            }
            break;
        }
        let Ok(text) = message.to_str() else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            continue;
        };
        state.lock().unwrap().frames.push(frame.clone());
        let reply = match frame["type"].as_str() {
            Some("ping") => Some(json!({"type": "pong"})),
            Some(kind @ ("message" | "file")) if script.ack => {
                next_id += 1;
                let (text, file_path) = if kind == "message" {
                    (frame["text"].clone(), Value::Null)
                } else {
                    (Value::Null, frame["filePath"].clone())
                };
                Some(json!({
                    "type": "message_sent",
                    "message": {
                        "messageId": next_id,
                        "senderType": query.get("userType").cloned().unwrap_or_default(),
                        "senderId": query.get("userId").cloned().unwrap_or_default(),
                        "text": text,
                        "filePath": file_path,
                        "isRead": false,
                        "createdAt": chrono::Utc::now().to_rfc3339(),
                        "tempId": frame["tempId"].clone(),
                    }
                }))
            }
            _ => None,
        };
        if let Some(reply) = reply {
            if tx.send(Message::text(reply.to_string())).await.is_err() {
                break;
            }
        }
    }
}

pub fn message_json(id: i64, sender_type: &str, sender_id: &str, text: &str) -> Value {
    json!({
        "messageId": id,
        "senderType": sender_type,
        "senderId": sender_id,
        "text": text,
        "isRead": false,
        "createdAt": format!("2024-05-01T09:{:02}:00Z", id % 60),
    })
}
