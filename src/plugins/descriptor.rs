//! Plugin descriptors
//!
//! A plugin is declared with [`PluginDescriptor::builder`] and frozen by
//! [`PluginBuilder::build`]. The result is immutable: the supervisor hands the
//! same descriptor to every incarnation of the plugin's unit.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::application::errors::BotError;
use crate::domain::entities::{CommandRegistry, CommandSpec};
use crate::runtime::protocol::{CommandSummary, EventKind, PluginSummary};
use crate::runtime::{EventContext, JobContext};

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), BotError>> + Send>>;

pub type JobHandler = Arc<dyn Fn(JobContext) -> TaskFuture + Send + Sync>;

pub type EventHandler = Arc<dyn Fn(EventContext) -> TaskFuture + Send + Sync>;

/// A job run on a fixed interval inside the plugin unit
#[derive(Clone)]
pub struct Job {
    pub name: String,
    pub interval: Duration,
    pub handler: JobHandler,
}

/// What a bot needs to know about a plugin when a link is attached
#[derive(Debug, Clone, PartialEq)]
pub struct PluginManifest {
    pub name: String,
    pub core: bool,
    pub defaults: Map<String, Value>,
}

/// Immutable declaration of one plugin
pub struct PluginDescriptor {
    name: String,
    description: Option<String>,
    prefix: String,
    core: bool,
    defaults: Map<String, Value>,
    commands: Arc<CommandRegistry>,
    jobs: Vec<Job>,
    events: HashMap<EventKind, Vec<EventHandler>>,
}

impl PluginDescriptor {
    pub fn builder(name: impl Into<String>) -> PluginBuilder {
        PluginBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_core(&self) -> bool {
        self.core
    }

    pub fn defaults(&self) -> &Map<String, Value> {
        &self.defaults
    }

    pub fn commands(&self) -> Arc<CommandRegistry> {
        self.commands.clone()
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn handlers(&self, kind: EventKind) -> &[EventHandler] {
        self.events.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: self.name.clone(),
            core: self.core,
            defaults: self.defaults.clone(),
        }
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            prefix: self.prefix.clone(),
            core: self.core,
            commands: self
                .commands
                .all()
                .map(|c| CommandSummary {
                    signature: c.signature.raw.clone(),
                    description: c.description.clone(),
                    scope: c.scope.as_str().to_string(),
                    permission: c.permission.to_string(),
                })
                .collect(),
        }
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("core", &self.core)
            .field("commands", &self.commands.len())
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

pub struct PluginBuilder {
    name: String,
    description: Option<String>,
    prefix: String,
    core: bool,
    defaults: Map<String, Value>,
    commands: Vec<CommandSpec>,
    jobs: Vec<Job>,
    events: HashMap<EventKind, Vec<EventHandler>>,
}

impl PluginBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            prefix: "/".to_string(),
            core: false,
            defaults: Map::new(),
            commands: Vec::new(),
            jobs: Vec::new(),
            events: HashMap::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Prefix stripped before exact-form matching; may be empty
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Core plugins ignore the apply flag and cannot be disabled
    pub fn core(mut self) -> Self {
        self.core = true;
        self
    }

    pub fn default_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    pub fn command(mut self, spec: CommandSpec) -> Self {
        self.commands.push(spec);
        self
    }

    pub fn job<F, Fut>(mut self, name: impl Into<String>, interval: Duration, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BotError>> + Send + 'static,
    {
        self.jobs.push(Job {
            name: name.into(),
            interval,
            handler: Arc::new(move |ctx| -> TaskFuture { Box::pin(f(ctx)) }),
        });
        self
    }

    pub fn on_event<F, Fut>(mut self, kind: EventKind, f: F) -> Self
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BotError>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |ctx| -> TaskFuture { Box::pin(f(ctx)) });
        self.events.entry(kind).or_default().push(handler);
        self
    }

    pub fn build(self) -> Result<PluginDescriptor, BotError> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid_name {
            return Err(BotError::validation(format!("invalid plugin name '{}'", self.name)));
        }
        for reserved in ["apply", "lock"] {
            if self.defaults.contains_key(reserved) {
                return Err(BotError::validation(format!(
                    "plugin {} may not declare a default for '{}'",
                    self.name, reserved
                )));
            }
        }

        let mut commands = CommandRegistry::new();
        for spec in self.commands {
            commands.register(spec, !self.core)?;
        }

        let mut job_names = HashSet::new();
        for job in &self.jobs {
            if job.interval.is_zero() {
                return Err(BotError::validation(format!("job '{}' has a zero interval", job.name)));
            }
            if !job_names.insert(job.name.as_str()) {
                return Err(BotError::lifecycle(format!("duplicate job '{}' in {}", job.name, self.name)));
            }
        }

        Ok(PluginDescriptor {
            name: self.name,
            description: self.description,
            prefix: self.prefix,
            core: self.core,
            defaults: self.defaults,
            commands: Arc::new(commands),
            jobs: self.jobs,
            events: self.events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(signature: &str) -> CommandSpec {
        CommandSpec::new(signature).with_handler(|_| async { Ok(None) })
    }

    #[test]
    fn test_build_registers_commands_in_order() {
        let plugin = PluginDescriptor::builder("echo")
            .description("repeats things")
            .default_option("loud", json!(false))
            .command(noop("say <...words>"))
            .command(noop("shout <...words>"))
            .build()
            .unwrap();

        let summary = plugin.summary();
        assert_eq!(summary.commands.len(), 2);
        assert_eq!(summary.commands[0].signature, "say <...words>");
        assert_eq!(summary.commands[0].permission, "0..6");
        assert!(plugin.commands().all().all(|c| c.requires_apply));
        assert_eq!(plugin.manifest().defaults["loud"], json!(false));
    }

    #[test]
    fn test_core_commands_skip_apply() {
        let plugin = PluginDescriptor::builder("core").core().command(noop("bot")).build().unwrap();
        assert!(plugin.commands().all().all(|c| !c.requires_apply));
    }

    #[test]
    fn test_duplicate_command_fails_build() {
        let err = PluginDescriptor::builder("echo")
            .command(noop("say"))
            .command(noop("SAY <x>"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BotError::Lifecycle(_)));
    }

    #[test]
    fn test_rejects_bad_names_and_reserved_defaults() {
        assert!(PluginDescriptor::builder("Echo Bot").build().is_err());
        assert!(PluginDescriptor::builder("echo").default_option("apply", json!(false)).build().is_err());
    }

    #[test]
    fn test_zero_interval_job_rejected() {
        let err = PluginDescriptor::builder("ticker")
            .job("tick", Duration::ZERO, |_| async { Ok(()) })
            .build()
            .unwrap_err();
        assert!(matches!(err, BotError::Validation(_)));
    }
}
