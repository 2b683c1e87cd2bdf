use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::application::errors::BotError;
use crate::domain::entities::ConnectorEvent;
use crate::infrastructure::config::AccountConfig;

/// Connector trait - abstraction over one chat-platform account connection
#[async_trait]
pub trait Connector: Send + Sync {
    /// Start (or resume) the login flow
    async fn login(&self) -> Result<(), BotError>;

    async fn logout(&self) -> Result<(), BotError>;

    /// Drop the connection for good; no further events are emitted
    async fn terminate(&self);

    /// Send a message to a user, returning the platform message id
    async fn send_private_message(&self, user_id: &str, text: &str) -> Result<String, BotError>;

    /// Send a message to a group, returning the platform message id
    async fn send_group_message(&self, group_id: &str, text: &str) -> Result<String, BotError>;

    fn nickname(&self) -> String;

    fn is_online(&self) -> bool;

    async fn group_list(&self) -> Result<Vec<GroupInfo>, BotError>;

    async fn friend_list(&self) -> Result<Vec<FriendInfo>, BotError>;

    fn stat(&self) -> ConnectorStat;
}

/// A group the account belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: String,
    pub name: String,
}

impl GroupInfo {
    pub fn new(group_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendInfo {
    pub user_id: String,
    pub nickname: String,
}

/// Traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorStat {
    pub sent: u64,
    pub received: u64,
    pub online_since: Option<DateTime<Utc>>,
}

/// A live connection plus its event stream
pub struct ConnectorSession {
    pub connector: Arc<dyn Connector>,
    pub events: mpsc::UnboundedReceiver<ConnectorEvent>,
}

/// Opens a connector for an account; called again on every bot restart
pub trait ConnectorFactory: Send + Sync {
    fn connect(&self, account: &AccountConfig) -> Result<ConnectorSession, BotError>;
}
