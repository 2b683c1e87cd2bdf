//! Gates run between a successful match and the handler

use std::sync::Arc;

use crate::domain::entities::{Command, Message};

/// What a gate sees about the pending invocation
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub plugin: &'a str,
    /// Core plugins are never apply-gated
    pub core: bool,
    pub command: &'a Command,
    pub message: &'a Message,
}

/// Outcome of a gate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Reply with this text and do not run anything
    Deny(String),
    /// Run the command's stop handler instead of its action
    Stop,
}

pub trait Gate: Send + Sync {
    fn check(&self, ctx: &GateContext<'_>) -> Verdict;
}

/// Caller level must fall inside the command's range
pub struct PermissionGate;

impl Gate for PermissionGate {
    fn check(&self, ctx: &GateContext<'_>) -> Verdict {
        let level = ctx.message.permission;
        if ctx.command.permission.contains(level) {
            return Verdict::Pass;
        }
        Verdict::Deny(format!(
            "Permission denied: '{}' requires level {}, your level is {}",
            ctx.command.name(),
            ctx.command.permission,
            level
        ))
    }
}

/// Honors the per-group apply flag of non-core plugins
pub struct ApplyGate;

impl Gate for ApplyGate {
    fn check(&self, ctx: &GateContext<'_>) -> Verdict {
        if ctx.core || !ctx.command.requires_apply || !ctx.message.scope.is_group() {
            return Verdict::Pass;
        }
        match &ctx.message.setting {
            Some(setting) if !setting.is_applied(ctx.plugin) => Verdict::Stop,
            _ => Verdict::Pass,
        }
    }
}

/// Ordered gates; the first verdict other than `Pass` wins
#[derive(Clone)]
pub struct GateChain {
    gates: Vec<Arc<dyn Gate>>,
}

impl GateChain {
    pub fn new() -> Self {
        Self { gates: Vec::new() }
    }

    pub fn add<G: Gate + 'static>(mut self, gate: G) -> Self {
        self.gates.push(Arc::new(gate));
        self
    }

    /// Permission first, then the apply flag
    pub fn standard() -> Self {
        Self::new().add(PermissionGate).add(ApplyGate)
    }

    pub fn evaluate(&self, ctx: &GateContext<'_>) -> Verdict {
        for gate in &self.gates {
            match gate.check(ctx) {
                Verdict::Pass => continue,
                other => return other,
            }
        }
        Verdict::Pass
    }
}

impl Default for GateChain {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{
        CommandRegistry, CommandSpec, GroupSetting, PermissionLevel, PluginOption, User,
    };

    fn command(min: u8, max: u8) -> Command {
        let mut registry = CommandRegistry::new();
        registry
            .register(
                CommandSpec::new("roll").with_permission(min, max).with_handler(|_| async { Ok(None) }),
                true,
            )
            .unwrap()
            .clone()
    }

    fn group_message(applied: bool) -> Message {
        let mut setting = GroupSetting::new("g");
        setting.plugin.insert(
            "dice".into(),
            PluginOption {
                apply: applied,
                ..PluginOption::default()
            },
        );
        Message::group("1", "100", User::new("9"), "/roll").with_setting(std::sync::Arc::new(setting))
    }

    #[test]
    fn test_permission_reply_names_range_and_level() {
        let cmd = command(3, 5);
        let msg = Message::private("1", User::new("9"), "/roll").with_permission(PermissionLevel::new(2).unwrap());
        let ctx = GateContext { plugin: "dice", core: false, command: &cmd, message: &msg };

        let Verdict::Deny(text) = PermissionGate.check(&ctx) else {
            panic!("expected denial");
        };
        assert!(text.contains("3..5"));
        assert!(text.contains("your level is 2"));

        let master = msg.clone().with_permission(PermissionLevel::new(5).unwrap());
        let ctx = GateContext { message: &master, ..ctx };
        assert_eq!(PermissionGate.check(&ctx), Verdict::Pass);
    }

    #[test]
    fn test_apply_flag_only_gates_groups() {
        let cmd = command(0, 6);
        let chain = GateChain::standard();

        let msg = group_message(false);
        let ctx = GateContext { plugin: "dice", core: false, command: &cmd, message: &msg };
        assert_eq!(chain.evaluate(&ctx), Verdict::Stop);
        assert_eq!(chain.evaluate(&GateContext { core: true, ..ctx }), Verdict::Pass);

        let msg = group_message(true);
        assert_eq!(chain.evaluate(&GateContext { message: &msg, ..ctx }), Verdict::Pass);

        let msg = Message::private("1", User::new("9"), "/roll");
        assert_eq!(chain.evaluate(&GateContext { message: &msg, ..ctx }), Verdict::Pass);
    }
}
