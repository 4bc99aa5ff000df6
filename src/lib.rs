//! Chat between customers and wallpapering vendors about a quote request.
//!
//! [`ChatSession`] is the entry point: it resolves the room for a
//! request/counterpart pair, loads history over REST and keeps a realtime
//! socket bound to the open room.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod receipts;
pub mod rooms;
pub mod session;
pub mod store;
pub mod transport;

pub use api::{ChatApi, HttpChatApi};
pub use auth::{Authenticator, MemorySession, SessionSource, UserProfile};
pub use config::ChatConfig;
pub use error::{ChatError, Result};
pub use models::{ChatCredential, ChatMessage, ChatRoom, MessageBody, MessageState, UserType};
pub use receipts::Intersection;
pub use session::{ChatSession, SessionEvent, SessionState};
pub use transport::{ConnectionState, ConnectionStatus};
