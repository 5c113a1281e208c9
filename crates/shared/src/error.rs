//! Error taxonomy for the chat request lifecycle and the command approval flow.

/// Failures on the chat request path
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChatError {
    #[error("Request failed: {message}")]
    Network {
        status: Option<u16>,
        message: String,
    },

    #[error("Malformed stream event: {0}")]
    StreamParse(String),

    #[error("A response is still streaming for this conversation")]
    RequestInFlight,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Could not save conversation: {0}")]
    Persistence(String),

    #[error("No user message at position {0}")]
    NoSuchMessage(usize),
}

impl ChatError {
    pub fn network(message: impl Into<String>) -> Self {
        ChatError::Network {
            status: None,
            message: message.into(),
        }
    }

    pub fn http_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let message = if detail.trim().is_empty() {
            format!("HTTP error! Status: {}", status)
        } else {
            format!("HTTP error! Status: {}\n{}", status, detail)
        };
        ChatError::Network {
            status: Some(status),
            message,
        }
    }
}

/// Failures on the command approval path
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("Command with ID {0} not found or already processed")]
    NotFound(String),

    #[error("Error executing command: {0}")]
    Execution(String),

    #[error("Command service unavailable: {0}")]
    Service(String),
}
