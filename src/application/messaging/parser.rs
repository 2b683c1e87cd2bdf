//! Message parser - Splits raw chat text into a command token and arguments

/// Text after the prefix, split on whitespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand<'a> {
    pub name: &'a str,
    pub args: Vec<&'a str>,
}

/// Parses incoming text for one plugin's prefix
#[derive(Debug, Clone)]
pub struct MessageParser {
    command_prefix: String,
}

impl MessageParser {
    /// An empty prefix is legal and matches bare command names
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            command_prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.command_prefix
    }

    /// Parse a command message; `None` if the prefix is absent or nothing follows it
    pub fn parse<'a>(&self, text: &'a str) -> Option<ParsedCommand<'a>> {
        let cmd_text = text.trim_start().strip_prefix(self.command_prefix.as_str())?;

        let mut parts = cmd_text.split_whitespace();
        let name = parts.next()?;
        Some(ParsedCommand {
            name,
            args: parts.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_prefix() {
        let parser = MessageParser::new("/");
        let parsed = parser.parse("/greet  Alice Bob").unwrap();
        assert_eq!(parsed.name, "greet");
        assert_eq!(parsed.args, vec!["Alice", "Bob"]);

        assert!(parser.parse("greet Alice").is_none());
        assert!(parser.parse("/").is_none());
    }

    #[test]
    fn test_empty_prefix_matches_bare_names() {
        let parser = MessageParser::new("");
        let parsed = parser.parse("roll 20").unwrap();
        assert_eq!(parsed.name, "roll");
        assert_eq!(parsed.args, vec!["20"]);
        assert!(parser.parse("   ").is_none());
    }
}
