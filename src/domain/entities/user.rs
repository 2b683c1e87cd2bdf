use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a sender inside a group chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Owner,
    Admin,
    #[default]
    Member,
}

/// Represents a user in the system
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct User {
    pub id: String,
    pub nickname: Option<String>,
    /// Only meaningful for group messages
    pub role: GroupRole,
    /// Platform activity metric (group level, chat points, ...)
    pub activity: u32,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nickname: None,
            role: GroupRole::Member,
            activity: 0,
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn with_role(mut self, role: GroupRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_activity(mut self, activity: u32) -> Self {
        self.activity = activity;
        self
    }

    pub fn display_name(&self) -> String {
        self.nickname.clone().unwrap_or_else(|| self.id.clone())
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
