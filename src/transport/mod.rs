pub mod backoff;
pub mod frames;

use std::fmt::Display;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::models::{ChatCredential, ChatMessage, PresenceStatus, UserType};

pub use backoff::Backoff;
pub use frames::{InboundFrame, OutboundFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    /// Set once reconnecting gave up. Cleared by the next `connect`.
    pub terminal_error: Option<ChatError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Message(ChatMessage),
    /// Server acknowledgement of something this connection sent.
    MessageSent {
        message: ChatMessage,
        temp_id: Option<Uuid>,
    },
    Typing {
        user_id: String,
        user_type: Option<UserType>,
        is_typing: bool,
    },
    MessagesRead(Vec<i64>),
    Handshake {
        status: String,
        detail: Option<String>,
    },
    Presence {
        user_id: String,
        status: PresenceStatus,
    },
    ServerError(String),
    Pong,
    Status(ConnectionStatus),
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// Reconnecting gave up. The binding stays dead until connected again.
    ConnectionFailed(ChatError),
}

/// An event stamped with the binding that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub binding: u64,
    pub room_id: i64,
    pub event: RealtimeEvent,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub ws_url: Url,
    pub ping_interval: Duration,
    pub typing_quiet_period: Duration,
    pub backoff: Backoff,
}

impl TransportSettings {
    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        Ok(TransportSettings {
            ws_url: Url::parse(&config.ws_url)?,
            ping_interval: config.ping_interval(),
            typing_quiet_period: config.typing_quiet_period(),
            backoff: Backoff::new(
                config.reconnect_base_delay(),
                config.reconnect_max_attempts,
            ),
        })
    }
}

#[derive(Debug)]
enum Command {
    Send(OutboundFrame),
    Typing(bool),
    Close,
}

struct Binding {
    id: u64,
    room_id: i64,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    last_seen: Arc<AtomicI64>,
}

/// Reconnecting WebSocket bound to at most one chat room at a time.
pub struct Transport {
    settings: TransportSettings,
    status: Arc<watch::Sender<ConnectionStatus>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    binding: Option<Binding>,
    next_binding: u64,
}

impl Transport {
    pub fn new(settings: TransportSettings) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::default());
        let transport = Transport {
            settings,
            status: Arc::new(status),
            events,
            binding: None,
            next_binding: 0,
        };
        (transport, rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Id of the live binding, if any. A binding that gave up reconnecting is not live.
    pub fn binding(&self) -> Option<u64> {
        self.live_binding().map(|b| b.id)
    }

    fn live_binding(&self) -> Option<&Binding> {
        let gave_up = self.status.borrow().terminal_error.is_some();
        self.binding
            .as_ref()
            .filter(|b| !gave_up && !b.task.is_finished())
    }

    pub fn room_id(&self) -> Option<i64> {
        self.binding.as_ref().map(|b| b.room_id)
    }

    /// Records the newest message id seen so a reconnect can ask for the gap.
    pub fn note_message(&self, message_id: i64) {
        if let Some(binding) = &self.binding {
            binding.last_seen.fetch_max(message_id, Ordering::Relaxed);
        }
    }

    /// Binds to `room_id` and starts connecting in the background.
    pub fn connect(
        &mut self,
        credential: &ChatCredential,
        room_id: i64,
        last_message_id: Option<i64>,
    ) -> Result<u64> {
        if !credential.authenticated {
            return Err(ChatError::AuthenticationRequired);
        }
        if let Some(current) = self.live_binding() {
            return Err(ChatError::Transport(format!(
                "already bound to room {}",
                current.room_id
            )));
        }
        if let Some(dead) = self.binding.take() {
            dead.task.abort();
        }

        self.next_binding += 1;
        let id = self.next_binding;
        let last_seen = Arc::new(AtomicI64::new(last_message_id.unwrap_or(0)));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let connection = Connection {
            binding: id,
            room_id,
            url: self.base_url(credential, room_id),
            last_seen: Arc::clone(&last_seen),
            settings: self.settings.clone(),
            status: Arc::clone(&self.status),
            events: self.events.clone(),
            commands: commands_rx,
        };
        self.status.send_replace(ConnectionStatus {
            state: ConnectionState::Connecting,
            ..ConnectionStatus::default()
        });
        info!("Binding chat transport {} to room {}", id, room_id);
        let task = tokio::spawn(connection.run());
        self.binding = Some(Binding {
            id,
            room_id,
            commands,
            task,
            last_seen,
        });
        Ok(id)
    }

    /// Closes the socket with a normal close code and ends the binding.
    pub async fn disconnect(&mut self) {
        let Some(Binding {
            id,
            room_id,
            commands,
            mut task,
            ..
        }) = self.binding.take()
        else {
            return;
        };
        let _ = commands.send(Command::Close);
        if time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            warn!("Chat transport {} did not close in time, aborting", id);
            task.abort();
        }
        self.status.send_replace(ConnectionStatus::default());
        info!("Unbound chat transport {} from room {}", id, room_id);
    }

    pub fn send_text(&self, text: String, temp_id: Uuid) -> Result<()> {
        self.command(Command::Send(OutboundFrame::Message { text, temp_id }))
    }

    pub fn send_file(&self, file_path: String, temp_id: Uuid) -> Result<()> {
        self.command(Command::Send(OutboundFrame::File { file_path, temp_id }))
    }

    /// Typing `true` expires on its own after the quiet period.
    pub fn send_typing(&self, is_typing: bool) -> Result<()> {
        self.command(Command::Typing(is_typing))
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ChatError::Send("not connected".into()));
        }
        let binding = self
            .binding
            .as_ref()
            .ok_or_else(|| ChatError::Send("not connected".into()))?;
        binding
            .commands
            .send(command)
            .map_err(|_| ChatError::Send("connection closed".into()))
    }

    fn base_url(&self, credential: &ChatCredential, room_id: i64) -> Url {
        let mut url = self.settings.ws_url.clone();
        url.query_pairs_mut()
            .append_pair("token", &credential.token)
            .append_pair("userId", &credential.user_id)
            .append_pair("userType", credential.user_type.as_str())
            .append_pair("roomId", &room_id.to_string());
        url
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.take() {
            let _ = binding.commands.send(Command::Close);
        }
    }
}

enum SessionEnd {
    /// The owner asked to close.
    Requested,
    /// The server closed with a normal close code.
    ClosedNormally,
    Abnormal(String),
}

/// State owned by the socket task of one binding.
struct Connection {
    binding: u64,
    room_id: i64,
    url: Url,
    last_seen: Arc<AtomicI64>,
    settings: TransportSettings,
    status: Arc<watch::Sender<ConnectionStatus>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Connection {
    async fn run(mut self) {
        let mut attempt = 0;
        loop {
            self.set_status(ConnectionState::Connecting, attempt, None);
            let end = match connect_async(self.url().as_str()).await {
                Ok((socket, _)) => {
                    info!("Chat socket connected to room {}", self.room_id);
                    attempt = 0;
                    self.set_status(ConnectionState::Connected, 0, None);
                    self.session(socket).await
                }
                Err(e) => SessionEnd::Abnormal(e.to_string()),
            };

            let reason = match end {
                SessionEnd::Requested => break,
                SessionEnd::ClosedNormally => {
                    info!("Server closed chat socket for room {}", self.room_id);
                    break;
                }
                SessionEnd::Abnormal(reason) => reason,
            };
            attempt += 1;
            let Some(delay) = self.settings.backoff.delay(attempt) else {
                let failure = ChatError::Transport(format!(
                    "gave up after {} reconnect attempts: {}",
                    attempt - 1,
                    reason
                ));
                error!("Chat socket for room {}: {}", self.room_id, failure);
                self.set_status(ConnectionState::Disconnected, attempt - 1, Some(failure.clone()));
                self.emit(RealtimeEvent::ConnectionFailed(failure));
                return;
            };
            warn!(
                "Chat socket for room {} lost ({}), reconnect {} in {:?}",
                self.room_id, reason, attempt, delay
            );
            self.set_status(ConnectionState::Disconnected, attempt, None);
            self.emit(RealtimeEvent::Reconnecting { attempt, delay });
            if !self.wait(delay).await {
                break;
            }
        }
        self.set_status(ConnectionState::Disconnected, 0, None);
    }

    fn url(&self) -> Url {
        let mut url = self.url.clone();
        let last_seen = self.last_seen.load(Ordering::Relaxed);
        if last_seen > 0 {
            url.query_pairs_mut()
                .append_pair("lastMessageId", &last_seen.to_string());
        }
        url
    }

    /// Sleeps out a backoff delay. Returns `false` if closed meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                () = time::sleep_until(deadline) => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Close) | None => return false,
                    Some(other) => debug!("Dropping {:?} while reconnecting", other),
                },
            }
        }
    }

    async fn session(&mut self, socket: Socket) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        let period = self.settings.ping_interval;
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut typing_until: Option<Instant> = None;

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) if frame.code == CloseCode::Normal => SessionEnd::ClosedNormally,
                            Some(frame) => SessionEnd::Abnormal(format!(
                                "closed with code {}",
                                u16::from(frame.code)
                            )),
                            None => SessionEnd::Abnormal("closed without a code".into()),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Abnormal(e.to_string()),
                    None => return SessionEnd::Abnormal("connection dropped".into()),
                },
                command = self.commands.recv() => {
                    let frame = match command {
                        Some(Command::Send(frame)) => Some(frame),
                        Some(Command::Typing(true)) => {
                            let started = typing_until.is_none();
                            typing_until = Some(Instant::now() + self.settings.typing_quiet_period);
                            started.then_some(OutboundFrame::Typing { is_typing: true })
                        }
                        Some(Command::Typing(false)) => typing_until
                            .take()
                            .map(|_| OutboundFrame::Typing { is_typing: false }),
                        Some(Command::Close) | None => {
                            let close = CloseFrame {
                                code: CloseCode::Normal,
                                reason: Utf8Bytes::from_static("client closed"),
                            };
                            if let Err(e) = sink.send(Message::Close(Some(close))).await {
                                debug!("Close frame not delivered: {}", e);
                            }
                            return SessionEnd::Requested;
                        }
                    };
                    if let Some(frame) = frame {
                        if let Err(e) = write(&mut sink, &frame).await {
                            return SessionEnd::Abnormal(e);
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = write(&mut sink, &OutboundFrame::Ping).await {
                        return SessionEnd::Abnormal(e);
                    }
                }
                () = time::sleep_until(typing_until.unwrap_or_else(Instant::now)), if typing_until.is_some() => {
                    typing_until = None;
                    if let Err(e) = write(&mut sink, &OutboundFrame::Typing { is_typing: false }).await {
                        return SessionEnd::Abnormal(e);
                    }
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let Some(frame) = InboundFrame::parse(text) else {
            return;
        };
        let event = match frame {
            InboundFrame::Message { message } => {
                let id = message.message_id;
                match ChatMessage::try_from(message) {
                    Ok(message) => {
                        self.last_seen.fetch_max(id, Ordering::Relaxed);
                        RealtimeEvent::Message(message)
                    }
                    Err(e) => {
                        warn!("Dropping live message: {}", e);
                        return;
                    }
                }
            }
            InboundFrame::MessageSent { message } => {
                let id = message.message_id;
                let temp_id = message.temp_id;
                match ChatMessage::try_from(message) {
                    Ok(message) => {
                        self.last_seen.fetch_max(id, Ordering::Relaxed);
                        RealtimeEvent::MessageSent { message, temp_id }
                    }
                    Err(e) => {
                        warn!("Dropping acknowledgement: {}", e);
                        return;
                    }
                }
            }
            InboundFrame::TypingStatus {
                user_id,
                user_type,
                is_typing,
            } => RealtimeEvent::Typing {
                user_id,
                user_type,
                is_typing,
            },
            InboundFrame::MessageReadUpdate {
                message_id,
                message_ids,
            } => RealtimeEvent::MessagesRead(InboundFrame::read_ids(message_id, message_ids)),
            InboundFrame::Connection { status, message } => RealtimeEvent::Handshake {
                status,
                detail: message,
            },
            InboundFrame::Pong => RealtimeEvent::Pong,
            InboundFrame::UserStatus { user_id, status } => {
                RealtimeEvent::Presence { user_id, status }
            }
            InboundFrame::Error { message } => {
                warn!("Chat server reported: {}", message);
                RealtimeEvent::ServerError(message)
            }
        };
        self.emit(event);
    }

    fn set_status(&self, state: ConnectionState, reconnect_attempt: u32, terminal_error: Option<ChatError>) {
        let next = ConnectionStatus {
            state,
            reconnect_attempt,
            terminal_error,
        };
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            self.emit(RealtimeEvent::Status(next));
        }
    }

    fn emit(&self, event: RealtimeEvent) {
        let _ = self.events.send(TransportEvent {
            binding: self.binding,
            room_id: self.room_id,
            event,
        });
    }
}

async fn write<S>(sink: &mut S, frame: &OutboundFrame) -> std::result::Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    sink.send(Message::text(text)).await.map_err(|e| e.to_string())
}
