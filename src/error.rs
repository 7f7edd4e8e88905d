use thiserror::Error;

/// Every failure the sync client can report.
///
/// `Clone` so the connection manager can keep the last one around and fan it
/// out to every subscriber.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("run {run_id} not found")]
    NotFound { run_id: String },
    #[error("connection error: {message}")]
    Connection { message: String, status: Option<u16> },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("session expired; re-authentication required")]
    Auth,
    #[error("action failed: {message}")]
    Action { message: String, code: Option<String> },
    #[error("Max reconnection attempts reached ({attempts}); call reconnect() to resume")]
    Terminal { attempts: u32 },
    #[error("server reported error: {message}")]
    Server { message: String, code: Option<String> },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), status: None }
    }

    pub fn action(message: impl Into<String>) -> Self {
        Self::Action { message: message.into(), code: None }
    }

    /// Stable identifier a consumer can switch on.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Connection { .. } => "connection_error",
            Self::Protocol(_) => "protocol_error",
            Self::Auth => "auth_error",
            Self::Action { .. } => "action_error",
            Self::Terminal { .. } => "terminal_error",
            Self::Server { .. } => "server_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Errors that must never be retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Auth | Self::Terminal { .. } | Self::Config(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16()) == Some(401) {
            return Self::Auth;
        }
        Self::Connection { message: e.to_string(), status: e.status().map(|s| s.as_u16()) }
    }
}
