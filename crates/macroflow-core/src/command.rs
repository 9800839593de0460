//! Parsed macro representation.
//!
//! A macro parses into a [`ParsedScript`]: one [`Command`] per source line
//! (blank and comment lines included as placeholders, so that a command's
//! index is always `line_number - 1`) plus every [`ParseError`] found.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The type of a macro command.
///
/// Built-in commands are a closed set; [`CommandKind::Custom`] is the open
/// extension point for names registered by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Version,
    Url,
    Tab,
    Frame,
    Tag,
    Set,
    Add,
    Wait,
    Pause,
    Prompt,
    Extract,
    SaveAs,
    SaveItem,
    Click,
    Event,
    Events,
    Refresh,
    Back,
    Stopwatch,
    Ds,
    Filter,
    OnDownload,
    OnDialog,
    OnLogin,
    OnCertificateDialog,
    OnErrorDialog,
    OnSecurityDialog,
    OnWebpageDialog,
    Clear,
    Search,
    Screenshot,
    Print,
    Proxy,
    Size,
    CmdLine,
    FileDelete,
    ImageClick,
    ImageSearch,
    WinClick,
    Disconnect,
    Redial,
    /// A `'` comment line. Never dispatched.
    Comment,
    /// An empty line. Never dispatched.
    Blank,
    /// A command name registered by the embedding application (upper-case).
    Custom(String),
}

impl CommandKind {
    /// Every built-in command that can appear in a macro.
    pub const BUILTIN: [CommandKind; 41] = [
        CommandKind::Version,
        CommandKind::Url,
        CommandKind::Tab,
        CommandKind::Frame,
        CommandKind::Tag,
        CommandKind::Set,
        CommandKind::Add,
        CommandKind::Wait,
        CommandKind::Pause,
        CommandKind::Prompt,
        CommandKind::Extract,
        CommandKind::SaveAs,
        CommandKind::SaveItem,
        CommandKind::Click,
        CommandKind::Event,
        CommandKind::Events,
        CommandKind::Refresh,
        CommandKind::Back,
        CommandKind::Stopwatch,
        CommandKind::Ds,
        CommandKind::Filter,
        CommandKind::OnDownload,
        CommandKind::OnDialog,
        CommandKind::OnLogin,
        CommandKind::OnCertificateDialog,
        CommandKind::OnErrorDialog,
        CommandKind::OnSecurityDialog,
        CommandKind::OnWebpageDialog,
        CommandKind::Clear,
        CommandKind::Search,
        CommandKind::Screenshot,
        CommandKind::Print,
        CommandKind::Proxy,
        CommandKind::Size,
        CommandKind::CmdLine,
        CommandKind::FileDelete,
        CommandKind::ImageClick,
        CommandKind::ImageSearch,
        CommandKind::WinClick,
        CommandKind::Disconnect,
        CommandKind::Redial,
    ];

    /// Resolves a built-in command name (case-insensitive).
    ///
    /// Returns `None` for anything that is not a built-in, including
    /// placeholder kinds.
    pub fn builtin(name: &str) -> Option<CommandKind> {
        let upper = name.to_ascii_uppercase();
        Self::BUILTIN.iter().find(|k| k.name() == upper).cloned()
    }

    /// Resolves any name, falling back to [`CommandKind::Custom`].
    pub fn from_name(name: &str) -> CommandKind {
        Self::builtin(name).unwrap_or_else(|| CommandKind::Custom(name.to_ascii_uppercase()))
    }

    /// The command's type string as written in macros.
    pub fn name(&self) -> &str {
        match self {
            CommandKind::Version => "VERSION",
            CommandKind::Url => "URL",
            CommandKind::Tab => "TAB",
            CommandKind::Frame => "FRAME",
            CommandKind::Tag => "TAG",
            CommandKind::Set => "SET",
            CommandKind::Add => "ADD",
            CommandKind::Wait => "WAIT",
            CommandKind::Pause => "PAUSE",
            CommandKind::Prompt => "PROMPT",
            CommandKind::Extract => "EXTRACT",
            CommandKind::SaveAs => "SAVEAS",
            CommandKind::SaveItem => "SAVEITEM",
            CommandKind::Click => "CLICK",
            CommandKind::Event => "EVENT",
            CommandKind::Events => "EVENTS",
            CommandKind::Refresh => "REFRESH",
            CommandKind::Back => "BACK",
            CommandKind::Stopwatch => "STOPWATCH",
            CommandKind::Ds => "DS",
            CommandKind::Filter => "FILTER",
            CommandKind::OnDownload => "ONDOWNLOAD",
            CommandKind::OnDialog => "ONDIALOG",
            CommandKind::OnLogin => "ONLOGIN",
            CommandKind::OnCertificateDialog => "ONCERTIFICATEDIALOG",
            CommandKind::OnErrorDialog => "ONERRORDIALOG",
            CommandKind::OnSecurityDialog => "ONSECURITYDIALOG",
            CommandKind::OnWebpageDialog => "ONWEBPAGEDIALOG",
            CommandKind::Clear => "CLEAR",
            CommandKind::Search => "SEARCH",
            CommandKind::Screenshot => "SCREENSHOT",
            CommandKind::Print => "PRINT",
            CommandKind::Proxy => "PROXY",
            CommandKind::Size => "SIZE",
            CommandKind::CmdLine => "CMDLINE",
            CommandKind::FileDelete => "FILEDELETE",
            CommandKind::ImageClick => "IMAGECLICK",
            CommandKind::ImageSearch => "IMAGESEARCH",
            CommandKind::WinClick => "WINCLICK",
            CommandKind::Disconnect => "DISCONNECT",
            CommandKind::Redial => "REDIAL",
            CommandKind::Comment => "COMMENT",
            CommandKind::Blank => "BLANK",
            CommandKind::Custom(name) => name,
        }
    }

    /// Placeholders keep line numbering stable and are skipped at run time.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, CommandKind::Comment | CommandKind::Blank)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One parameter token of a command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Upper-cased key. For positional tokens this is the token itself.
    pub key: String,
    /// Value as written, unquoted and unescaped, with `{{name}}` markers intact.
    pub raw_value: String,
    /// `true` for bare tokens such as the name and value in `SET !VAR1 x`.
    pub positional: bool,
    /// Upper-cased names of the `{{name}}` markers in `raw_value`.
    pub references: Vec<String>,
}

/// A single parsed line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub parameters: Vec<Parameter>,
    /// The source line, untrimmed.
    pub raw: String,
    /// 1-based line number.
    pub line_number: usize,
}

impl Command {
    pub fn kind_name(&self) -> &str {
        self.kind.name()
    }

    /// First named (`KEY=value`) parameter with the given key.
    pub fn param(&self, key: &str) -> Option<&Parameter> {
        let upper = key.to_ascii_uppercase();
        self.parameters.iter().find(|p| !p.positional && p.key == upper)
    }

    /// The `index`-th positional token.
    pub fn positional(&self, index: usize) -> Option<&Parameter> {
        self.parameters.iter().filter(|p| p.positional).nth(index)
    }

    /// All variable names referenced anywhere on the line, in order.
    pub fn variable_references(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.parameters.iter().flat_map(|p| p.references.iter()) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// A syntax error on a specific line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub line_number: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line {}: {}", self.line_number, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Output of [`crate::parser::parse`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedScript {
    pub commands: Vec<Command>,
    pub errors: Vec<ParseError>,
}

impl ParsedScript {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn first_error(&self) -> Option<&ParseError> {
        self.errors.first()
    }

    /// Number of lines, placeholders included.
    pub fn total_lines(&self) -> usize {
        self.commands.len()
    }

    /// The command at a 1-based line.
    pub fn command_at(&self, line: usize) -> Option<&Command> {
        line.checked_sub(1).and_then(|i| self.commands.get(i))
    }

    /// Commands that will actually be dispatched.
    pub fn executable(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter().filter(|c| !c.kind.is_placeholder())
    }
}
