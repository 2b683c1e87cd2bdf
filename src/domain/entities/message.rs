use super::{GroupSetting, PermissionLevel, User};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Where a message was sent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChatScope {
    Group { group_id: String },
    Private,
}

impl ChatScope {
    pub fn group_id(&self) -> Option<&str> {
        match self {
            ChatScope::Group { group_id } => Some(group_id),
            ChatScope::Private => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ChatScope::Group { .. })
    }
}

/// Represents an incoming chat message
///
/// `permission` and `setting` are filled in by the bot unit before the
/// message is fanned out to plugins.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    /// Account that received the message
    pub self_id: String,
    pub scope: ChatScope,
    pub sender: User,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub permission: PermissionLevel,
    pub setting: Option<Arc<GroupSetting>>,
}

impl Message {
    pub fn new(self_id: impl Into<String>, scope: ChatScope, sender: User, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            self_id: self_id.into(),
            scope,
            sender,
            text: text.into(),
            timestamp: Utc::now(),
            permission: PermissionLevel::MIN,
            setting: None,
        }
    }

    pub fn group(self_id: impl Into<String>, group_id: impl Into<String>, sender: User, text: impl Into<String>) -> Self {
        Self::new(self_id, ChatScope::Group { group_id: group_id.into() }, sender, text)
    }

    pub fn private(self_id: impl Into<String>, sender: User, text: impl Into<String>) -> Self {
        Self::new(self_id, ChatScope::Private, sender, text)
    }

    pub fn with_permission(mut self, level: PermissionLevel) -> Self {
        self.permission = level;
        self
    }

    pub fn with_setting(mut self, setting: Arc<GroupSetting>) -> Self {
        self.setting = Some(setting);
        self
    }
}

/// Group membership change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupNotice {
    pub group_id: String,
    pub group_name: Option<String>,
    pub user_id: String,
}

/// Login flow progress reported by a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginEvent {
    /// The platform wants an interactive step (captcha, device check, ...)
    Challenge { kind: String, detail: String },
    Failed { reason: String, fatal: bool },
}

/// Everything a connector can emit
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    Message(Message),
    GroupIncrease(GroupNotice),
    GroupDecrease(GroupNotice),
    Online,
    Offline { reason: String },
    Login(LoginEvent),
}

impl ConnectorEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorEvent::Message(m) if m.scope.is_group() => "message.group",
            ConnectorEvent::Message(_) => "message.private",
            ConnectorEvent::GroupIncrease(_) => "notice.group.increase",
            ConnectorEvent::GroupDecrease(_) => "notice.group.decrease",
            ConnectorEvent::Online => "system.online",
            ConnectorEvent::Offline { .. } => "system.offline",
            ConnectorEvent::Login(_) => "login",
        }
    }
}
