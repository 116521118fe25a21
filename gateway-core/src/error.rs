use std::path::PathBuf;

use thiserror::Error;

use crate::ids::UserId;

/// Reasons a socket fails to authenticate. Every variant ends the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("token not found")]
    TokenNotFound,
    #[error("token expired")]
    TokenExpired,
    #[error("token already used")]
    TokenAlreadyConsumed,
    #[error("authentication timed out")]
    Timeout,
    #[error("expected an auth message with a token")]
    MissingToken,
    #[error("a session is already active for this user")]
    SessionAlreadyActive,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::TokenNotFound => "token_not_found",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenAlreadyConsumed => "token_already_consumed",
            AuthError::Timeout => "auth_timeout",
            AuthError::MissingToken => "auth_required",
            AuthError::SessionAlreadyActive => "session_already_active",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("a process is already running for user {user_id}")]
    AlreadyRunning { user_id: UserId },
    #[error("failed to spawn agent process: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("no process is running for user {user_id}")]
    NotRunning { user_id: UserId },
    #[error("agent stdin is closed")]
    StdinClosed,
    #[error("agent is not reading its stdin; try again later")]
    StdinBusy,
    #[error("task parameters could not be encoded: {source}")]
    InvalidParams {
        #[source]
        source: serde_json::Error,
    },
}

impl ProcessError {
    pub(crate) fn spawn(source: std::io::Error) -> Self {
        Self::Spawn { source }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProcessError::AlreadyRunning { .. } => "already_running",
            ProcessError::Spawn { .. } => "spawn_failed",
            ProcessError::NotRunning { .. } => "no_process",
            ProcessError::StdinClosed => "stdin_closed",
            ProcessError::StdinBusy => "stdin_busy",
            ProcessError::InvalidParams { .. } => "invalid_params",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
