//! Built-in command surface
//!
//! Every command here is a thin wrapper around a remote call into the bot
//! that received the message; the bot owns all state they touch.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::application::errors::BotError;
use crate::domain::entities::{CommandScope, CommandSpec, GroupSetting, HandlerResult};
use crate::runtime::protocol::{BotCall, BotStatus, PluginState, SuperviseRequest};
use crate::runtime::Invocation;

use super::descriptor::PluginDescriptor;

pub const NAME: &str = "core";

pub fn descriptor(prefix: &str) -> Result<PluginDescriptor, BotError> {
    PluginDescriptor::builder(NAME)
        .description("Bot management")
        .prefix(prefix)
        .core()
        .command(
            CommandSpec::new("help [topic]")
                .with_description("List plugins, or the commands of one plugin")
                .with_handler(help),
        )
        .command(
            CommandSpec::new("bot")
                .with_description("Show this account's status")
                .with_handler(status),
        )
        .command(master("login <uin>", "Log an account in").with_handler(|inv: Invocation| async move {
            let uin = inv.args.require("uin")?.to_string();
            supervise(&inv, SuperviseRequest::Login(uin)).await
        }))
        .command(master("logout <uin>", "Log an account out").with_handler(|inv: Invocation| async move {
            let uin = inv.args.require("uin")?.to_string();
            supervise(&inv, SuperviseRequest::Logout(uin)).await
        }))
        .command(master("enable <name>", "Enable a plugin for this account").with_handler(|inv: Invocation| async move {
            let name = plugin_arg(&inv, "name")?;
            inv.call(BotCall::EnablePlugin { name: name.clone() }).await?;
            Ok(Some(format!("Plugin {} enabled", name)))
        }))
        .command(master("disable <name>", "Disable a plugin for this account").with_handler(|inv: Invocation| async move {
            let name = plugin_arg(&inv, "name")?;
            inv.call(BotCall::DisablePlugin { name: name.clone() }).await?;
            Ok(Some(format!("Plugin {} disabled", name)))
        }))
        .command(master("mount <name>", "Start a plugin and link it to every bot").with_handler(|inv: Invocation| async move {
            let name = plugin_arg(&inv, "name")?;
            supervise(&inv, SuperviseRequest::Mount(name)).await
        }))
        .command(master("unmount <name>", "Stop a plugin").with_handler(|inv: Invocation| async move {
            let name = plugin_arg(&inv, "name")?;
            supervise(&inv, SuperviseRequest::Unmount(name)).await
        }))
        .command(master("reload <name>", "Restart a plugin").with_handler(|inv: Invocation| async move {
            let name = plugin_arg(&inv, "name")?;
            supervise(&inv, SuperviseRequest::Reload(name)).await
        }))
        .command(admin("server", "Show plugin settings of this group").with_handler(server))
        .command(admin("apply <name>", "Turn a plugin on in this group").with_handler(|inv: Invocation| async move {
            set_apply(inv, true).await
        }))
        .command(admin("exempt <name>", "Turn a plugin off in this group").with_handler(|inv: Invocation| async move {
            set_apply(inv, false).await
        }))
        .command(admin("config <plugin> <key> <...value>", "Change a plugin option in this group").with_handler(config))
        .command(master("restart", "Restart the whole process").with_handler(|inv: Invocation| async move {
            inv.reply("Restarting...").await?;
            supervise(&inv, SuperviseRequest::Restart).await.map(|_| None)
        }))
        .command(master("shutdown", "Stop the whole process").with_handler(|inv: Invocation| async move {
            inv.reply("Shutting down...").await?;
            supervise(&inv, SuperviseRequest::Shutdown).await.map(|_| None)
        }))
        .build()
}

fn master(signature: &str, description: &str) -> CommandSpec {
    CommandSpec::new(signature).with_description(description).with_permission(5, 6)
}

fn admin(signature: &str, description: &str) -> CommandSpec {
    CommandSpec::new(signature)
        .with_description(description)
        .with_scope(CommandScope::Group)
        .with_permission(3, 6)
}

fn plugin_arg(inv: &Invocation, name: &str) -> Result<String, BotError> {
    Ok(inv.args.require(name)?.to_lowercase())
}

fn group_of(inv: &Invocation) -> Result<String, BotError> {
    inv.group_id()
        .map(str::to_string)
        .ok_or_else(|| BotError::validation("this command only works in groups"))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, BotError> {
    serde_json::from_value(value).map_err(|e| BotError::Internal(format!("unexpected reply: {}", e)))
}

async fn supervise(inv: &Invocation, request: SuperviseRequest) -> HandlerResult {
    let done = inv.call(BotCall::Supervise(request)).await?;
    Ok(done.as_str().map(str::to_string))
}

async fn help(inv: Invocation) -> HandlerResult {
    let topic = inv.args.get("topic").map(str::to_lowercase);
    let listing = inv.call(BotCall::Help { topic }).await?;
    Ok(listing.as_str().map(str::to_string))
}

async fn status(inv: Invocation) -> HandlerResult {
    let status: BotStatus = decode(inv.call(BotCall::Status).await?)?;
    let plugins: Vec<PluginState> = decode(inv.call(BotCall::Plugins).await?)?;

    let mut out = format!(
        "{} ({})\nonline: {}\ngroups: {}, friends: {}\nsent: {}, received: {}\nplugins:",
        status.nickname,
        status.uin,
        if status.online { "yes" } else { "no" },
        status.groups,
        status.friends,
        status.sent,
        status.received,
    );
    for plugin in plugins {
        let tag = match (plugin.core, plugin.disabled) {
            (true, _) => " (core)",
            (false, true) => " (disabled)",
            (false, false) => "",
        };
        out.push_str(&format!("\n  {}{}", plugin.name, tag));
    }
    Ok(Some(out))
}

async fn server(inv: Invocation) -> HandlerResult {
    let group_id = group_of(&inv)?;
    let setting: GroupSetting = decode(inv.call(BotCall::GroupSetting { group_id: group_id.clone() }).await?)?;

    let mut out = format!("{} ({})", setting.name, group_id);
    for (plugin, option) in &setting.plugin {
        out.push_str(&format!(
            "\n  {}: {}{}",
            plugin,
            if option.apply { "applied" } else { "exempt" },
            if option.lock { ", locked" } else { "" }
        ));
    }
    Ok(Some(out))
}

async fn set_apply(inv: Invocation, apply: bool) -> HandlerResult {
    let group_id = group_of(&inv)?;
    let plugin = plugin_arg(&inv, "name")?;
    inv.call(BotCall::SetApply {
        group_id,
        plugin: plugin.clone(),
        apply,
        message_id: inv.message.id.clone(),
    })
    .await?;
    let state = if apply { "applied" } else { "exempt" };
    Ok(Some(format!("Plugin {} is now {} in this group", plugin, state)))
}

async fn config(inv: Invocation) -> HandlerResult {
    let group_id = group_of(&inv)?;
    let plugin = plugin_arg(&inv, "plugin")?;
    let key = inv.args.require("key")?.to_string();
    let raw = inv.args.list("value").join(" ");
    let value = parse_value(&raw);

    inv.call(BotCall::MutateSetting {
        group_id,
        plugin: plugin.clone(),
        key: key.clone(),
        value: value.clone(),
        message_id: inv.message.id.clone(),
    })
    .await?;
    Ok(Some(format!("{}.{} = {}", plugin, key, value)))
}

/// JSON when it parses, otherwise the raw text as a string
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("12"), json!(12));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("fancy"), json!("fancy"));
        assert_eq!(parse_value("two words"), json!("two words"));
    }

    #[test]
    fn test_surface_permissions() {
        let core = descriptor("/").unwrap();
        let commands = core.commands();

        let shutdown = commands.lookup("all", "shutdown").unwrap().unwrap();
        assert_eq!(shutdown.permission.to_string(), "5..6");

        let apply = commands.lookup("group", "apply").unwrap().unwrap();
        assert_eq!(apply.permission.to_string(), "3..6");
        assert!(commands.lookup("all", "apply").unwrap().is_none());

        let help = commands.lookup("all", "help").unwrap().unwrap();
        assert_eq!(help.permission.to_string(), "0..6");
        assert!(core.is_core());
    }
}
