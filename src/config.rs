use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{ChatError, Result};

const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8080/ws/chat";

/// Runtime settings for the chat client.
///
/// Durations are stored in milliseconds so the TOML file stays flat.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    pub api_base_url: String,
    pub ws_url: String,
    pub request_timeout_ms: u64,
    pub page_size: u32,
    pub ping_interval_ms: u64,
    pub typing_quiet_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_attempts: u32,
    pub ack_timeout_ms: u64,
    pub read_threshold: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            api_base_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            request_timeout_ms: 10_000,
            page_size: 20,
            ping_interval_ms: 30_000,
            typing_quiet_ms: 3_000,
            reconnect_base_ms: 1_000,
            reconnect_max_attempts: 5,
            ack_timeout_ms: 10_000,
            read_threshold: 0.5,
        }
    }
}

impl ChatConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ChatConfig =
            toml::from_str(raw).map_err(|e| ChatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Loads `path` when given, then applies `CHAT_API_URL` / `CHAT_WS_URL`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Ok(api) = std::env::var("CHAT_API_URL") {
            config.api_base_url = api;
        }
        if let Ok(ws) = std::env::var("CHAT_WS_URL") {
            config.ws_url = ws;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let api = Url::parse(&self.api_base_url)?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(ChatError::Config(format!(
                "api_base_url must be http(s), got {}",
                api.scheme()
            )));
        }
        let ws = Url::parse(&self.ws_url)?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(ChatError::Config(format!(
                "ws_url must be ws(s), got {}",
                ws.scheme()
            )));
        }
        if self.page_size == 0 {
            return Err(ChatError::Config("page_size must be positive".into()));
        }
        if self.ping_interval_ms == 0 {
            return Err(ChatError::Config("ping_interval_ms must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.read_threshold) {
            return Err(ChatError::Config(
                "read_threshold must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn typing_quiet_period(&self) -> Duration {
        Duration::from_millis(self.typing_quiet_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ChatConfig::from_toml_str(
            r#"
            api_base_url = "https://chat.example.com/api"
            reconnect_max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.api_base_url, "https://chat.example.com/api");
        assert_eq!(config.reconnect_max_attempts, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.page_size, 20);
    }

    #[test]
    fn rejects_http_websocket_url() {
        let err = ChatConfig::from_toml_str(r#"ws_url = "http://example.com/ws""#).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = ChatConfig::from_toml_str("read_threshold = 1.5").unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }
}
