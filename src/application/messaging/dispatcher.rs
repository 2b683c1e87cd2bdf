//! Message dispatcher - Routes a message to one plugin command and runs it

use std::sync::Arc;
use tracing::{debug, warn};

use crate::application::errors::BotError;
use crate::domain::entities::{Args, Command, CommandRegistry, Handler, Message};
use crate::runtime::invocation::reply_to;
use crate::runtime::{BotLink, Invocation};

use super::gate::{GateChain, GateContext, Verdict};
use super::router::{CommandRouter, RouteOutcome};

/// What to do with a matched command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Run,
    Stop,
    /// Reply without running a handler (usage, permission denial)
    Reply(String),
}

/// A message matched to one command
#[derive(Debug, Clone)]
pub struct Routed {
    pub command: Command,
    pub args: Args,
    pub action: Action,
}

/// Routes messages against one plugin's command table
pub struct MessageDispatcher {
    plugin: String,
    core: bool,
    router: CommandRouter,
    gates: GateChain,
    commands: Arc<CommandRegistry>,
}

impl MessageDispatcher {
    pub fn new(plugin: impl Into<String>, prefix: impl Into<String>, core: bool, commands: Arc<CommandRegistry>) -> Self {
        Self {
            plugin: plugin.into(),
            core,
            router: CommandRouter::new(prefix),
            gates: GateChain::standard(),
            commands,
        }
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn prefix(&self) -> &str {
        self.router.prefix()
    }

    /// First command in registration order that matches wins; commands do not compose
    pub fn route(&self, message: &Message) -> Option<Routed> {
        let (command, outcome) = self
            .commands
            .candidates(&message.scope)
            .map(|c| (c, self.router.route(c, &message.text)))
            .find(|(_, outcome)| outcome.is_match())?;

        let routed = match outcome {
            RouteOutcome::Usage(text) => Routed {
                command: command.clone(),
                args: Args::default(),
                action: Action::Reply(text),
            },
            RouteOutcome::Bound(args) => {
                let ctx = GateContext {
                    plugin: &self.plugin,
                    core: self.core,
                    command,
                    message,
                };
                let action = match self.gates.evaluate(&ctx) {
                    Verdict::Pass => Action::Run,
                    Verdict::Stop => Action::Stop,
                    Verdict::Deny(text) => Action::Reply(text),
                };
                Routed {
                    command: command.clone(),
                    args,
                    action,
                }
            }
            RouteOutcome::NoMatch => return None,
        };

        debug!(plugin = %self.plugin, command = %routed.command.name(), action = ?routed.action, "message routed");
        Some(routed)
    }

    /// Run a routed command and deliver its reply through the bot that sent it
    pub async fn execute(plugin: String, routed: Routed, message: Arc<Message>, bot: BotLink) {
        let name = routed.command.name().to_string();
        let handler = match routed.action {
            Action::Reply(text) => {
                deliver(&bot, &message, text, &name).await;
                return;
            }
            Action::Run => Some(routed.command.handler.clone()),
            Action::Stop => routed.command.stop_handler.clone(),
        };

        let reply = match handler {
            Some(handler) => {
                let invocation = Invocation {
                    message: message.clone(),
                    args: routed.args,
                    plugin: plugin.clone(),
                    bot: bot.clone(),
                };
                run_guarded(handler, invocation, &name).await
            }
            None => Some(format!("Plugin {} is not applied in this group", plugin)),
        };

        if let Some(text) = reply {
            deliver(&bot, &message, text, &name).await;
        }
    }
}

/// Errors and panics become an `Error: ...` reply
async fn run_guarded(handler: Handler, invocation: Invocation, name: &str) -> Option<String> {
    match tokio::spawn(handler(invocation)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            debug!(command = %name, error = %e, "handler failed");
            Some(e.user_message())
        }
        Err(join) if join.is_panic() => {
            warn!(command = %name, "handler panicked");
            Some(BotError::Internal(format!("command '{}' crashed", name)).user_message())
        }
        Err(_) => None,
    }
}

async fn deliver(bot: &BotLink, message: &Message, text: String, command: &str) {
    if let Err(e) = reply_to(bot, message, text).await {
        warn!(account = %bot.account(), command = %command, error = %e, "failed to deliver reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{CommandSpec, GroupSetting, PluginOption, User};
    use crate::runtime::link::connect;
    use crate::runtime::protocol::{BotCall, BotInbox, ToBot};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn dispatcher(spec: CommandSpec) -> MessageDispatcher {
        let mut registry = CommandRegistry::new();
        registry.register(spec, true).unwrap();
        MessageDispatcher::new("dice", "/", false, Arc::new(registry))
    }

    fn exempt_group_message(text: &str) -> Message {
        let mut setting = GroupSetting::new("g");
        setting.plugin.insert(
            "dice".into(),
            PluginOption {
                apply: false,
                ..PluginOption::default()
            },
        );
        Message::group("1", "100", User::new("9"), text).with_setting(Arc::new(setting))
    }

    /// Run the routed command and capture the text it asks the bot to send
    async fn reply_of(dispatcher: &MessageDispatcher, message: Message) -> String {
        let routed = dispatcher.route(&message).expect("command should match");
        let (bot_tx, mut bot_rx) = mpsc::unbounded_channel();
        let (plugin_tx, _plugin_rx) = mpsc::unbounded_channel();
        let (_for_bot, bot, _alive) = connect(1, "1", "dice", bot_tx, plugin_tx, Duration::from_millis(200));

        let task = tokio::spawn(MessageDispatcher::execute("dice".into(), routed, Arc::new(message), bot));
        let Some(BotInbox::Frame { frame: ToBot::Request { call, .. }, .. }) = bot_rx.recv().await else {
            panic!("expected a send request");
        };
        task.abort();
        match call {
            BotCall::SendGroupMessage { text, .. } | BotCall::SendPrivateMessage { text, .. } => text,
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_handler_replaces_default_reply() {
        let custom = dispatcher(
            CommandSpec::new("roll")
                .with_handler(|_| async { Ok(Some("rolled".to_string())) })
                .with_stop_handler(|inv: Invocation| async move {
                    Ok(Some(format!("Dice are put away in group {}", inv.group_id().unwrap_or("?"))))
                }),
        );
        let reply = reply_of(&custom, exempt_group_message("/roll")).await;
        assert_eq!(reply, "Dice are put away in group 100");

        let plain = dispatcher(CommandSpec::new("roll").with_handler(|_| async { Ok(Some("rolled".to_string())) }));
        let reply = reply_of(&plain, exempt_group_message("/roll")).await;
        assert_eq!(reply, "Plugin dice is not applied in this group");
    }

    #[tokio::test]
    async fn test_panicking_handler_replies_with_error() {
        let dispatcher = dispatcher(CommandSpec::new("boom").with_handler(|inv: Invocation| async move {
            if !inv.message.text.is_empty() {
                panic!("dice fell off the table");
            }
            Ok(None)
        }));

        let message = Message::private("1", User::new("9"), "/boom");
        let reply = reply_of(&dispatcher, message).await;
        assert_eq!(reply, "Error: internal error: command 'boom' crashed");
    }
}
