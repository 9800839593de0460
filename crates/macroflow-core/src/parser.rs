//! Line-oriented macro parser.
//!
//! Every source line becomes one entry in [`ParsedScript::commands`]: empty
//! lines and `'` comments are kept as placeholders so line numbers used in
//! error messages stay stable. Other lines are a command name followed by
//! parameter tokens:
//!
//! ```text
//! ' fill the search box
//! URL GOTO=https://example.com/?q=rust
//! TAG POS=1 TYPE=INPUT:TEXT ATTR=NAME:q CONTENT="hello world"
//! SET !VAR1 {{!COL1}}
//! ```
//!
//! Parsing never stops at the first problem; all errors are collected so a
//! caller can report them together. `{{name}}` markers are recorded but left
//! unresolved.

use std::iter::Peekable;
use std::str::Chars;

use tracing::debug;

use crate::command::{Command, CommandKind, Parameter, ParseError, ParsedScript};
use crate::variables;

/// Prefix marking a comment line.
pub const COMMENT_PREFIX: char = '\'';

/// Parses a macro that may only use built-in commands.
pub fn parse(source: &str) -> ParsedScript {
    parse_with_commands::<&str>(source, &[])
}

/// Parses a macro, additionally accepting the given custom command names.
///
/// Lines that fail to parse are reported in [`ParsedScript::errors`] and
/// omitted from `commands`, so `commands` is only line-aligned when the
/// script parsed cleanly.
pub fn parse_with_commands<S: AsRef<str>>(source: &str, custom_commands: &[S]) -> ParsedScript {
    let custom: Vec<String> = custom_commands
        .iter()
        .map(|s| s.as_ref().to_ascii_uppercase())
        .collect();

    let mut script = ParsedScript::default();

    for (index, raw) in source.lines().enumerate() {
        let line_number = index + 1;
        match parse_line(raw, line_number, &custom) {
            Ok(command) => script.commands.push(command),
            Err(message) => {
                debug!(line = line_number, %message, "parse error");
                script.errors.push(ParseError { line_number, message });
            }
        }
    }

    script
}

fn parse_line(raw: &str, line_number: usize, custom: &[String]) -> Result<Command, String> {
    let trimmed = raw.trim();

    let placeholder = |kind| Command {
        kind,
        parameters: Vec::new(),
        raw: raw.to_string(),
        line_number,
    };

    if trimmed.is_empty() {
        return Ok(placeholder(CommandKind::Blank));
    }
    if trimmed.starts_with(COMMENT_PREFIX) {
        return Ok(placeholder(CommandKind::Comment));
    }

    let (name, rest) = match trimmed.find(char::is_whitespace) {
        Some(pos) => (&trimmed[..pos], &trimmed[pos..]),
        None => (trimmed, ""),
    };

    let kind = match CommandKind::builtin(name) {
        Some(kind) => kind,
        None => {
            let upper = name.to_ascii_uppercase();
            if custom.contains(&upper) {
                CommandKind::Custom(upper)
            } else {
                return Err(format!("Unknown command: {}", name));
            }
        }
    };

    let parameters = parse_parameters(rest)?;

    Ok(Command {
        kind,
        parameters,
        raw: raw.to_string(),
        line_number,
    })
}

fn parse_parameters(source: &str) -> Result<Vec<Parameter>, String> {
    let mut params = Vec::new();
    let mut chars = source.chars().peekable();

    loop {
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&ch) = chars.peek() else {
            break;
        };

        match ch {
            '"' => {
                chars.next();
                let value = read_quoted(&mut chars)?;
                expect_token_end(&mut chars)?;
                params.push(positional(value));
            }
            '=' => {
                return Err("Missing parameter name before '='".to_string());
            }
            _ => {
                let mut key = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '=' {
                        break;
                    }
                    key.push(c);
                    chars.next();
                }

                if chars.peek() == Some(&'=') {
                    chars.next();
                    let value = if chars.peek() == Some(&'"') {
                        chars.next();
                        let v = read_quoted(&mut chars)?;
                        expect_token_end(&mut chars)?;
                        v
                    } else {
                        read_bare(&mut chars)
                    };
                    params.push(named(&key, value));
                } else {
                    params.push(positional(key));
                }
            }
        }
    }

    Ok(params)
}

fn named(key: &str, raw_value: String) -> Parameter {
    Parameter {
        key: key.to_ascii_uppercase(),
        references: variables::references(&raw_value),
        raw_value,
        positional: false,
    }
}

fn positional(raw_value: String) -> Parameter {
    Parameter {
        key: raw_value.to_ascii_uppercase(),
        references: variables::references(&raw_value),
        raw_value,
        positional: true,
    }
}

/// Reads up to the closing quote; the opening quote is already consumed.
fn read_quoted(chars: &mut Peekable<Chars<'_>>) -> Result<String, String> {
    let mut s = String::new();
    loop {
        match chars.next() {
            Some('\\') => match chars.next() {
                Some('"') => s.push('"'),
                Some('\\') => s.push('\\'),
                Some('n') => s.push('\n'),
                Some('t') => s.push('\t'),
                Some(c) => {
                    s.push('\\');
                    s.push(c);
                }
                None => return Err("Unterminated quoted value".to_string()),
            },
            Some('"') => return Ok(s),
            Some(c) => s.push(c),
            None => return Err("Unterminated quoted value".to_string()),
        }
    }
}

fn read_bare(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut s = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            break;
        }
        s.push(c);
        chars.next();
    }
    s
}

fn expect_token_end(chars: &mut Peekable<Chars<'_>>) -> Result<(), String> {
    match chars.peek() {
        None => Ok(()),
        Some(c) if c.is_whitespace() => Ok(()),
        Some(c) => Err(format!("Unexpected character '{}' after quoted value", c)),
    }
}
