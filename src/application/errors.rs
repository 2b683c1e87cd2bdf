//! Application layer errors

use std::time::Duration;
use thiserror::Error;

/// General bot errors
///
/// Every variant carries owned strings so a failure can be sent back over a
/// link as the result of a remote call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BotError {
    /// Bad arguments, permission out of range, wrong setting value type
    #[error("{0}")]
    Validation(String),

    /// Mount of a mounted plugin, unmount of an unmounted one, duplicate command
    #[error("{0}")]
    Lifecycle(String),

    /// Send to a dead or unlinked unit
    #[error("link error: {0}")]
    Link(String),

    #[error("remote call '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("connector error: {message}")]
    Connector { message: String, fatal: bool },

    /// A unit with the same identity already exists
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BotError {
    pub fn validation(msg: impl Into<String>) -> Self {
        BotError::Validation(msg.into())
    }

    pub fn lifecycle(msg: impl Into<String>) -> Self {
        BotError::Lifecycle(msg.into())
    }

    pub fn link(msg: impl Into<String>) -> Self {
        BotError::Link(msg.into())
    }

    pub fn connector(msg: impl Into<String>) -> Self {
        BotError::Connector {
            message: msg.into(),
            fatal: false,
        }
    }

    pub fn fatal_connector(msg: impl Into<String>) -> Self {
        BotError::Connector {
            message: msg.into(),
            fatal: true,
        }
    }

    /// Whether the owning unit must stop and leave recovery to the supervisor
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::Connector { fatal: true, .. })
    }

    /// The reply shown in chat when a handler or remote call fails
    pub fn user_message(&self) -> String {
        format!("Error: {}", self)
    }
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<StorageError> for BotError {
    fn from(e: StorageError) -> Self {
        BotError::Persistence(e.to_string())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<ConfigError> for BotError {
    fn from(e: ConfigError) -> Self {
        BotError::Config(e.to_string())
    }
}
