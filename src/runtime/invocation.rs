//! Contexts handed to plugin code

use serde_json::Value;
use std::sync::Arc;

use crate::application::errors::BotError;
use crate::domain::entities::{Args, ChatScope, Message, PluginOption};

use super::link::BotLink;
use super::protocol::{BotCall, PluginEvent};

/// A matched command ready to run
#[derive(Clone)]
pub struct Invocation {
    pub message: Arc<Message>,
    pub args: Args,
    /// Plugin that owns the command
    pub plugin: String,
    /// Link back to the bot that delivered the message
    pub bot: BotLink,
}

impl Invocation {
    pub fn group_id(&self) -> Option<&str> {
        self.message.scope.group_id()
    }

    pub fn account(&self) -> &str {
        self.bot.account()
    }

    /// This plugin's option in the group the message came from
    pub fn option(&self) -> Option<&PluginOption> {
        self.message.setting.as_ref()?.plugin.get(&self.plugin)
    }

    /// Read one key of this plugin's group option
    pub fn option_value(&self, key: &str) -> Option<Value> {
        self.option().and_then(|o| o.get(key))
    }

    /// Send text back to wherever the message came from
    pub async fn reply(&self, text: impl Into<String>) -> Result<(), BotError> {
        reply_to(&self.bot, &self.message, text.into()).await
    }

    pub async fn call(&self, call: BotCall) -> Result<Value, BotError> {
        self.bot.request(call).await
    }
}

pub(crate) async fn reply_to(bot: &BotLink, message: &Message, text: String) -> Result<(), BotError> {
    let call = match &message.scope {
        ChatScope::Group { group_id } => BotCall::SendGroupMessage {
            group_id: group_id.clone(),
            text,
        },
        ChatScope::Private => BotCall::SendPrivateMessage {
            user_id: message.sender.id.clone(),
            text,
        },
    };
    bot.request(call).await.map(|_| ())
}

/// Context of one scheduled job run
#[derive(Clone)]
pub struct JobContext {
    pub plugin: String,
    pub job: String,
    /// Every bot linked when the tick fired
    pub bots: Vec<BotLink>,
}

/// Context of a subscribed event
#[derive(Clone)]
pub struct EventContext {
    pub plugin: String,
    pub event: PluginEvent,
    pub bot: BotLink,
}
