use thiserror::Error;

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Authentication required")]
    AuthenticationRequired,
    #[error("Network failure: {0}")]
    Network(String),
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Upload failed: {0}")]
    Upload(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ChatError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Network(_) | ChatError::Transport(_) | ChatError::Send(_)
        )
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ChatError::InvalidResponse(err.to_string())
        } else {
            ChatError::Network(err.to_string())
        }
    }
}

impl From<url::ParseError> for ChatError {
    fn from(err: url::ParseError) -> Self {
        ChatError::Config(err.to_string())
    }
}
