//! Command router - Matches text against one command and binds its arguments

use crate::domain::entities::{ArgValue, Args, Command};

use super::parser::MessageParser;

/// Result of matching one command against one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    NoMatch,
    /// The name matched but required arguments are missing
    Usage(String),
    Bound(Args),
}

impl RouteOutcome {
    pub fn is_match(&self) -> bool {
        !matches!(self, RouteOutcome::NoMatch)
    }
}

pub struct CommandRouter {
    parser: MessageParser,
}

impl CommandRouter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            parser: MessageParser::new(prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        self.parser.prefix()
    }

    /// Exact form first, then the command's sugar pattern on the full text
    pub fn route(&self, command: &Command, text: &str) -> RouteOutcome {
        if let Some(parsed) = self.parser.parse(text) {
            if command.matches(parsed.name) {
                return match bind_positional(command, &parsed.args) {
                    Some(args) => RouteOutcome::Bound(args),
                    None => RouteOutcome::Usage(self.usage(command)),
                };
            }
        }

        match &command.sugar {
            Some(sugar) => match sugar.captures(text.trim()) {
                Some(caps) => {
                    let mut args = Args::default();
                    for name in sugar.capture_names().flatten() {
                        if let Some(m) = caps.name(name) {
                            args.insert(name, ArgValue::Single(m.as_str().to_string()));
                        }
                    }
                    RouteOutcome::Bound(args)
                }
                None => RouteOutcome::NoMatch,
            },
            None => RouteOutcome::NoMatch,
        }
    }

    pub fn usage(&self, command: &Command) -> String {
        format!("Usage: {}{}", self.parser.prefix(), command.signature.raw)
    }
}

/// Bind tokens in order; `None` when a required argument has no token.
/// Tokens beyond the last non-variadic argument are ignored.
fn bind_positional(command: &Command, tokens: &[&str]) -> Option<Args> {
    let mut args = Args::default();
    let mut rest = tokens.iter();

    for arg in &command.signature.args {
        if arg.variadic {
            let items: Vec<String> = rest.by_ref().map(|t| t.to_string()).collect();
            if items.is_empty() {
                if arg.required {
                    return None;
                }
            } else {
                args.insert(arg.name.clone(), ArgValue::Many(items));
            }
            break;
        }

        match rest.next() {
            Some(token) => args.insert(arg.name.clone(), ArgValue::Single(token.to_string())),
            None if arg.required => return None,
            None => break,
        }
    }
    Some(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{CommandRegistry, CommandSpec};

    fn command(signature: &str, sugar: Option<&str>) -> Command {
        let mut spec = CommandSpec::new(signature).with_handler(|_| async { Ok(None) });
        if let Some(pattern) = sugar {
            spec = spec.with_sugar(pattern);
        }
        let mut registry = CommandRegistry::new();
        registry.register(spec, true).unwrap().clone()
    }

    #[test]
    fn test_missing_required_gives_usage() {
        let router = CommandRouter::new("/");
        let greet = command("greet <name>", None);

        assert_eq!(router.route(&greet, "/greet"), RouteOutcome::Usage("Usage: /greet <name>".into()));

        let RouteOutcome::Bound(args) = router.route(&greet, "/greet Alice") else {
            panic!("expected bound args");
        };
        assert_eq!(args.get("name"), Some("Alice"));
    }

    #[test]
    fn test_variadic_consumes_rest() {
        let router = CommandRouter::new("/");
        let tag = command("tag <...items>", None);

        let RouteOutcome::Bound(args) = router.route(&tag, "/tag a b c") else {
            panic!("expected bound args");
        };
        assert_eq!(args.list("items"), vec!["a", "b", "c"]);
        assert!(matches!(router.route(&tag, "/tag"), RouteOutcome::Usage(_)));
    }

    #[test]
    fn test_optional_and_extra_tokens() {
        let router = CommandRouter::new("");
        let roll = command("roll [sides]", None);

        let RouteOutcome::Bound(args) = router.route(&roll, "ROLL") else {
            panic!("expected bound args");
        };
        assert!(args.is_empty());

        let RouteOutcome::Bound(args) = router.route(&roll, "roll 20 extra") else {
            panic!("expected bound args");
        };
        assert_eq!(args.get("sides"), Some("20"));
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_sugar_binds_named_captures() {
        let router = CommandRouter::new("/");
        let roll = command("roll [sides]", Some(r"^roll (a )?d(?P<sides>\d+)$"));

        let RouteOutcome::Bound(args) = router.route(&roll, "roll a d20") else {
            panic!("expected bound args");
        };
        assert_eq!(args.get("sides"), Some("20"));
        assert_eq!(router.route(&roll, "roll a die"), RouteOutcome::NoMatch);
    }

    #[test]
    fn test_other_names_do_not_match() {
        let router = CommandRouter::new("/");
        let greet = command("greet <name>", None);
        assert_eq!(router.route(&greet, "/greeting Alice"), RouteOutcome::NoMatch);
        assert_eq!(router.route(&greet, "greet Alice"), RouteOutcome::NoMatch);
    }
}
