//! Frames exchanged over a link and the control messages each unit accepts

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::application::errors::BotError;
use crate::domain::entities::{GroupNotice, Message};
use crate::plugins::PluginManifest;

use super::link::{BotLink, LinkId, PluginLink};

/// Outcome of a remote call
pub type RemoteResult = Result<Value, BotError>;

/// Events a bot fans out to its plugins
#[derive(Debug, Clone)]
pub enum PluginEvent {
    Message(Arc<Message>),
    GroupIncrease(GroupNotice),
    GroupDecrease(GroupNotice),
    Online,
    Offline,
}

/// Subscribable event kinds; messages go through the command table instead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    GroupIncrease,
    GroupDecrease,
    Online,
    Offline,
}

impl PluginEvent {
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            PluginEvent::Message(_) => None,
            PluginEvent::GroupIncrease(_) => Some(EventKind::GroupIncrease),
            PluginEvent::GroupDecrease(_) => Some(EventKind::GroupDecrease),
            PluginEvent::Online => Some(EventKind::Online),
            PluginEvent::Offline => Some(EventKind::Offline),
        }
    }
}

/// Requests a bot forwards to the supervisor on a plugin's behalf
#[derive(Debug, Clone, PartialEq)]
pub enum SuperviseRequest {
    Mount(String),
    Unmount(String),
    Reload(String),
    Login(String),
    Logout(String),
    Restart,
    Shutdown,
}

/// Methods a plugin can invoke on its bot
#[derive(Debug, Clone, PartialEq)]
pub enum BotCall {
    SendPrivateMessage { user_id: String, text: String },
    SendGroupMessage { group_id: String, text: String },
    Status,
    GroupList,
    FriendList,
    GroupSetting { group_id: String },
    MutateSetting {
        group_id: String,
        plugin: String,
        key: String,
        value: Value,
        /// Message that asked for the change; the bot resolves its sender's level
        message_id: String,
    },
    SetApply {
        group_id: String,
        plugin: String,
        apply: bool,
        message_id: String,
    },
    EnablePlugin { name: String },
    DisablePlugin { name: String },
    Plugins,
    Help { topic: Option<String> },
    Supervise(SuperviseRequest),
}

impl BotCall {
    pub fn method(&self) -> &'static str {
        match self {
            BotCall::SendPrivateMessage { .. } => "send_private_message",
            BotCall::SendGroupMessage { .. } => "send_group_message",
            BotCall::Status => "status",
            BotCall::GroupList => "group_list",
            BotCall::FriendList => "friend_list",
            BotCall::GroupSetting { .. } => "group_setting",
            BotCall::MutateSetting { .. } => "mutate_setting",
            BotCall::SetApply { .. } => "set_apply",
            BotCall::EnablePlugin { .. } => "enable_plugin",
            BotCall::DisablePlugin { .. } => "disable_plugin",
            BotCall::Plugins => "plugins",
            BotCall::Help { .. } => "help",
            BotCall::Supervise(_) => "supervise",
        }
    }
}

/// Methods a bot can invoke on a plugin
#[derive(Debug, Clone, PartialEq)]
pub enum PluginCall {
    Describe,
}

impl PluginCall {
    pub fn method(&self) -> &'static str {
        match self {
            PluginCall::Describe => "describe",
        }
    }
}

/// Bot to plugin frames
#[derive(Debug)]
pub enum ToPlugin {
    Event(PluginEvent),
    Request { id: u64, call: PluginCall },
    Response { id: u64, result: RemoteResult },
}

/// Plugin to bot frames
#[derive(Debug)]
pub enum ToBot {
    Request { id: u64, call: BotCall },
    Response { id: u64, result: RemoteResult },
}

/// Plugin unit mailbox
pub enum PluginInbox {
    Frame { link: LinkId, from: String, frame: ToPlugin },
    Attach { endpoint: BotLink, ack: oneshot::Sender<()> },
    Detach { account: String, link: LinkId },
    Tick { job: usize },
    Terminate,
}

/// Bot unit mailbox
pub enum BotInbox {
    Frame { link: LinkId, from: String, frame: ToBot },
    Attach {
        endpoint: PluginLink,
        manifest: PluginManifest,
        ack: oneshot::Sender<()>,
    },
    Detach { plugin: String, link: LinkId },
    /// `logout` signs the account off before the connector is torn down
    Terminate { logout: bool },
}

impl fmt::Debug for PluginInbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginInbox::Frame { link, from, frame } => write!(f, "Frame({} from {}: {:?})", link, from, frame),
            PluginInbox::Attach { endpoint, .. } => write!(f, "Attach({})", endpoint.account()),
            PluginInbox::Detach { account, link } => write!(f, "Detach({} {})", account, link),
            PluginInbox::Tick { job } => write!(f, "Tick({})", job),
            PluginInbox::Terminate => write!(f, "Terminate"),
        }
    }
}

impl fmt::Debug for BotInbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotInbox::Frame { link, from, frame } => write!(f, "Frame({} from {}: {:?})", link, from, frame),
            BotInbox::Attach { endpoint, .. } => write!(f, "Attach({})", endpoint.plugin()),
            BotInbox::Detach { plugin, link } => write!(f, "Detach({} {})", plugin, link),
            BotInbox::Terminate { logout } => write!(f, "Terminate(logout={})", logout),
        }
    }
}

/// One row of a `help` listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSummary {
    pub signature: String,
    pub description: Option<String>,
    pub scope: String,
    pub permission: String,
}

/// Reply to [`PluginCall::Describe`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSummary {
    pub name: String,
    pub description: Option<String>,
    pub prefix: String,
    pub core: bool,
    pub commands: Vec<CommandSummary>,
}

/// One row of the [`BotCall::Plugins`] reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    pub name: String,
    pub core: bool,
    pub disabled: bool,
}

/// Reply to [`BotCall::Status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotStatus {
    pub uin: String,
    pub nickname: String,
    pub online: bool,
    pub groups: usize,
    pub friends: usize,
    pub plugins: usize,
    pub sent: u64,
    pub received: u64,
}
