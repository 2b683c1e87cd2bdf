use once_cell::sync::Lazy;
use regex_lite::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use super::{ChatScope, PermissionRange};
use crate::application::errors::BotError;
use crate::runtime::Invocation;

/// Handler result: optional reply text
pub type HandlerResult = Result<Option<String>, BotError>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Command handler function type
pub type Handler = Arc<dyn Fn(Invocation) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |inv| -> HandlerFuture { Box::pin(f(inv)) })
}

static ARG_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:<(\.\.\.)?([A-Za-z_][\w-]*)>|\[(\.\.\.)?([A-Za-z_][\w-]*)\])$")
        .expect("static pattern")
});

/// One positional argument of a signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub name: String,
    pub required: bool,
    pub variadic: bool,
}

/// Parsed command signature: `name <required> [optional] <...rest>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub raw: String,
    pub name: String,
    pub args: Vec<Arg>,
}

impl Signature {
    pub fn parse(raw: &str) -> Result<Self, BotError> {
        let mut tokens = raw.split_whitespace();
        let name = tokens
            .next()
            .filter(|n| !n.starts_with('<') && !n.starts_with('['))
            .ok_or_else(|| BotError::validation(format!("signature '{}' has no command name", raw)))?
            .to_string();

        let mut args: Vec<Arg> = Vec::new();
        for token in tokens {
            let caps = ARG_TOKEN.captures(token).ok_or_else(|| {
                BotError::validation(format!("bad argument '{}' in signature '{}'", token, raw))
            })?;
            let (required, variadic, name) = match (caps.get(2), caps.get(4)) {
                (Some(n), _) => (true, caps.get(1).is_some(), n.as_str()),
                (None, Some(n)) => (false, caps.get(3).is_some(), n.as_str()),
                (None, None) => unreachable!("pattern always captures a name"),
            };

            if args.iter().any(|a| a.variadic) {
                return Err(BotError::validation(format!(
                    "variadic argument must be last in '{}'",
                    raw
                )));
            }
            if required && args.iter().any(|a| !a.required) {
                return Err(BotError::validation(format!(
                    "required argument '{}' follows an optional one in '{}'",
                    name, raw
                )));
            }
            if args.iter().any(|a| a.name == name) {
                return Err(BotError::validation(format!(
                    "argument '{}' declared twice in '{}'",
                    name, raw
                )));
            }
            args.push(Arg {
                name: name.to_string(),
                required,
                variadic,
            });
        }

        Ok(Self {
            raw: raw.split_whitespace().collect::<Vec<_>>().join(" "),
            name,
            args,
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// A bound argument value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Single(String),
    Many(Vec<String>),
}

/// Arguments bound by the router
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args(BTreeMap<String, ArgValue>);

impl Args {
    pub fn insert(&mut self, name: impl Into<String>, value: ArgValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        match self.0.get(name)? {
            ArgValue::Single(s) => Some(s),
            ArgValue::Many(v) => v.first().map(String::as_str),
        }
    }

    pub fn list(&self, name: &str) -> Vec<String> {
        match self.0.get(name) {
            Some(ArgValue::Single(s)) => vec![s.clone()],
            Some(ArgValue::Many(v)) => v.clone(),
            None => Vec::new(),
        }
    }

    pub fn require(&self, name: &str) -> Result<&str, BotError> {
        self.get(name)
            .ok_or_else(|| BotError::validation(format!("missing argument '{}'", name)))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Where a command may be invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandScope {
    All,
    Group,
    Private,
}

impl CommandScope {
    pub fn accepts(&self, scope: &ChatScope) -> bool {
        match self {
            CommandScope::All => true,
            CommandScope::Group => scope.is_group(),
            CommandScope::Private => !scope.is_group(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandScope::All => "all",
            CommandScope::Group => "group",
            CommandScope::Private => "private",
        }
    }
}

impl FromStr for CommandScope {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(CommandScope::All),
            "group" => Ok(CommandScope::Group),
            "private" => Ok(CommandScope::Private),
            other => Err(BotError::validation(format!("unknown command scope '{}'", other))),
        }
    }
}

/// Unvalidated command declaration, checked by [`CommandRegistry::register`]
pub struct CommandSpec {
    pub signature: String,
    pub description: Option<String>,
    pub scope: CommandScope,
    pub permission: (u8, u8),
    pub sugar: Option<String>,
    pub handler: Option<Handler>,
    pub stop_handler: Option<Handler>,
}

impl CommandSpec {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            description: None,
            scope: CommandScope::All,
            permission: (0, 6),
            sugar: None,
            handler: None,
            stop_handler: None,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn with_scope(mut self, scope: CommandScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_permission(mut self, min: u8, max: u8) -> Self {
        self.permission = (min, max);
        self
    }

    pub fn with_sugar(mut self, pattern: impl Into<String>) -> Self {
        self.sugar = Some(pattern.into());
        self
    }

    pub fn with_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handler = Some(handler(f));
        self
    }

    pub fn with_stop_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.stop_handler = Some(handler(f));
        self
    }
}

/// Represents a registered, validated command
#[derive(Clone)]
pub struct Command {
    pub signature: Signature,
    pub description: Option<String>,
    pub scope: CommandScope,
    pub permission: PermissionRange,
    pub sugar: Option<Regex>,
    pub handler: Handler,
    pub stop_handler: Option<Handler>,
    /// False for built-in commands, which ignore the per-group apply flag
    pub requires_apply: bool,
}

impl Command {
    pub fn name(&self) -> &str {
        &self.signature.name
    }

    pub fn matches(&self, input: &str) -> bool {
        self.signature.name.eq_ignore_ascii_case(input)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("signature", &self.signature.raw)
            .field("scope", &self.scope)
            .field("permission", &self.permission)
            .field("requires_apply", &self.requires_apply)
            .finish()
    }
}

/// Ordered command table of one plugin
#[derive(Default, Clone)]
pub struct CommandRegistry {
    commands: Vec<Command>,
    tables: HashMap<CommandScope, HashMap<String, usize>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and append a command; names are unique per scope
    pub fn register(&mut self, spec: CommandSpec, requires_apply: bool) -> Result<&Command, BotError> {
        let signature = Signature::parse(&spec.signature)?;
        let permission = PermissionRange::new(spec.permission.0, spec.permission.1)?;
        let sugar = spec
            .sugar
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| BotError::validation(format!("bad sugar pattern for '{}': {}", signature.name, e)))?;
        let handler = spec
            .handler
            .ok_or_else(|| BotError::validation(format!("command '{}' has no handler", signature.name)))?;

        let key = signature.name.to_lowercase();
        let table = self.tables.entry(spec.scope).or_default();
        if table.contains_key(&key) {
            return Err(BotError::lifecycle(format!(
                "duplicate command '{}' in scope '{}'",
                signature.name,
                spec.scope.as_str()
            )));
        }
        table.insert(key, self.commands.len());

        self.commands.push(Command {
            signature,
            description: spec.description,
            scope: spec.scope,
            permission,
            sugar,
            handler,
            stop_handler: spec.stop_handler,
            requires_apply,
        });
        Ok(&self.commands[self.commands.len() - 1])
    }

    /// Look a command up by scope name; unknown scopes are rejected first
    pub fn lookup(&self, scope: &str, name: &str) -> Result<Option<&Command>, BotError> {
        let scope = CommandScope::from_str(scope)?;
        Ok(self
            .tables
            .get(&scope)
            .and_then(|t| t.get(&name.to_lowercase()))
            .map(|&i| &self.commands[i]))
    }

    /// Commands usable in `scope`, in registration order
    pub fn candidates<'a>(&'a self, scope: &'a ChatScope) -> impl Iterator<Item = &'a Command> + 'a {
        self.commands.iter().filter(move |c| c.scope.accepts(scope))
    }

    pub fn all(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> CommandSpec {
        CommandSpec::new("noop").with_handler(|_| async { Ok(None) })
    }

    #[test]
    fn test_parse_signature() {
        let sig = Signature::parse("tag  <first> [second] [...rest]").unwrap();
        assert_eq!(sig.name, "tag");
        assert_eq!(sig.raw, "tag <first> [second] [...rest]");
        assert_eq!(
            sig.args,
            vec![
                Arg { name: "first".into(), required: true, variadic: false },
                Arg { name: "second".into(), required: false, variadic: false },
                Arg { name: "rest".into(), required: false, variadic: true },
            ]
        );
    }

    #[test]
    fn test_variadic_must_be_last() {
        assert!(Signature::parse("tag <...items> <more>").is_err());
        assert!(Signature::parse("tag <...items>").is_ok());
    }

    #[test]
    fn test_required_after_optional_rejected() {
        assert!(Signature::parse("greet [name] <greeting>").is_err());
        assert!(Signature::parse("<name>").is_err());
        assert!(Signature::parse("greet name").is_err());
    }

    #[test]
    fn test_duplicate_in_same_scope_rejected() {
        let mut registry = CommandRegistry::new();
        registry.register(noop(), true).unwrap();
        let err = registry.register(noop(), true).unwrap_err();
        assert!(matches!(err, BotError::Lifecycle(_)));

        registry
            .register(noop().with_scope(CommandScope::Group), true)
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_invalid_permission_range_rejected() {
        let mut registry = CommandRegistry::new();
        let err = registry.register(noop().with_permission(5, 2), true).unwrap_err();
        assert!(matches!(err, BotError::Validation(_)));
    }

    #[test]
    fn test_lookup_rejects_unknown_scope() {
        let mut registry = CommandRegistry::new();
        registry.register(noop(), true).unwrap();
        assert!(registry.lookup("all", "NOOP").unwrap().is_some());
        assert!(registry.lookup("group", "noop").unwrap().is_none());
        assert!(registry.lookup("channel", "noop").is_err());
    }

    #[test]
    fn test_candidates_follow_scope_and_order() {
        let mut registry = CommandRegistry::new();
        registry
            .register(CommandSpec::new("a").with_scope(CommandScope::Group).with_handler(|_| async { Ok(None) }), true)
            .unwrap();
        registry
            .register(CommandSpec::new("b").with_handler(|_| async { Ok(None) }), true)
            .unwrap();
        registry
            .register(CommandSpec::new("c").with_scope(CommandScope::Private).with_handler(|_| async { Ok(None) }), true)
            .unwrap();

        let group = ChatScope::Group { group_id: "1".into() };
        let names: Vec<_> = registry.candidates(&group).map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let names: Vec<_> = registry.candidates(&ChatScope::Private).map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }
}
