use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Legacy transport heuristic for errors that reach us only as text.
static TRANSPORT_HINT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(fetch|network)").unwrap());

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortalError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend rejected request ({status}): {message}")]
    Application { status: u16, message: String },

    #[error("Backend unavailable (circuit open)")]
    BackendUnavailable,

    #[error("Cache key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Parsing error: {0}")]
    Parsing(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PortalError {
    /// Only transport failures say anything about backend reachability.
    pub fn is_transport(&self) -> bool {
        matches!(self, PortalError::Transport(_))
    }

    /// Whether a caller's degraded path should take over.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            PortalError::Transport(_) | PortalError::BackendUnavailable
        )
    }

    /// Classify an opaque error message raised somewhere outside the backend client.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if TRANSPORT_HINT.is_match(&message) {
            PortalError::Transport(message)
        } else {
            PortalError::Internal(message)
        }
    }
}

impl From<reqwest::Error> for PortalError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return PortalError::Application {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        if err.is_decode() {
            return PortalError::Parsing(err.to_string());
        }
        if err.is_builder() {
            return PortalError::Internal(err.to_string());
        }
        // connect, timeout, request and body failures all mean the round-trip broke
        PortalError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for PortalError {
    fn from(err: serde_json::Error) -> Self {
        PortalError::Parsing(err.to_string())
    }
}

impl From<std::io::Error> for PortalError {
    fn from(err: std::io::Error) -> Self {
        PortalError::Transport(err.to_string())
    }
}
