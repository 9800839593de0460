//! The contract between the executor and command implementations.
//!
//! A handler receives a [`CommandContext`] for one macro line and returns a
//! [`CommandResult`]. The context gives read access to the command's
//! parameters (raw or expanded against the current variables) and narrow
//! handles for the side effects a handler may have: variable writes, the
//! datasource, the [`Bridge`] and a [`LogSink`].
//!
//! Handlers are registered by command name in a [`HandlerRegistry`]. The
//! executor awaits each handler to completion before the next line and never
//! imposes a timeout of its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::Bridge;
use crate::command::{Command, Parameter};
use crate::datasource::Datasource;
use crate::error::ErrorCode;
use crate::events::LogSink;
use crate::variables::{self, Variables};

/// What a handler reports back for one line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandResult {
    pub success: bool,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
    /// Text appended to the extract buffer.
    pub output: Option<String>,
    /// Halt even when `!ERRORIGNORE` is on.
    pub stop_execution: bool,
    /// Ask the executor to pause after this line.
    pub pause_requested: bool,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_with_output(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: code,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// A failure that ends the run regardless of `!ERRORIGNORE`.
    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            stop_execution: true,
            ..Self::fail(code, message)
        }
    }

    pub fn paused() -> Self {
        Self {
            success: true,
            pause_requested: true,
            ..Default::default()
        }
    }

    /// The failure code, never `OK` for an unsuccessful result.
    pub fn effective_error_code(&self) -> ErrorCode {
        if self.success {
            ErrorCode::Ok
        } else if self.error_code.is_ok() {
            ErrorCode::UnknownError
        } else {
            self.error_code
        }
    }
}

/// Everything a handler may see or touch while running one line.
pub struct CommandContext<'a> {
    command: &'a Command,
    loop_counter: u32,
    variables: &'a mut Variables,
    datasource: &'a mut Datasource,
    bridge: Arc<dyn Bridge>,
    log: LogSink,
}

impl<'a> CommandContext<'a> {
    pub fn new(
        command: &'a Command,
        loop_counter: u32,
        variables: &'a mut Variables,
        datasource: &'a mut Datasource,
        bridge: Arc<dyn Bridge>,
        log: LogSink,
    ) -> Self {
        Self {
            command,
            loop_counter,
            variables,
            datasource,
            bridge,
            log,
        }
    }

    pub fn command(&self) -> &Command {
        self.command
    }

    /// 1-based macro line.
    pub fn line(&self) -> usize {
        self.command.line_number
    }

    pub fn loop_counter(&self) -> u32 {
        self.loop_counter
    }

    /// The raw value of a named parameter.
    pub fn raw_param(&self, key: &str) -> Option<&str> {
        self.command.param(key).map(|p| p.raw_value.as_str())
    }

    /// A named parameter with `{{name}}` markers expanded and special tokens
    /// such as `<SP>` decoded.
    pub fn param(&self, key: &str) -> Option<String> {
        self.command.param(key).map(|p| self.expand(p))
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.command.param(key).is_some()
    }

    /// Like [`param`](Self::param), but a missing parameter becomes a
    /// ready-to-return `MISSING_PARAMETER` result.
    pub fn require_param(&self, key: &str) -> Result<String, CommandResult> {
        self.param(key).ok_or_else(|| {
            CommandResult::fail(
                ErrorCode::MissingParameter,
                format!(
                    "{} requires parameter {}",
                    self.command.kind_name(),
                    key.to_ascii_uppercase()
                ),
            )
        })
    }

    pub fn raw_positional(&self, index: usize) -> Option<&str> {
        self.command.positional(index).map(|p| p.raw_value.as_str())
    }

    /// The `index`-th bare token, expanded.
    pub fn positional(&self, index: usize) -> Option<String> {
        self.command.positional(index).map(|p| self.expand(p))
    }

    /// Every named parameter, expanded, keyed by upper-case name.
    pub fn expanded_params(&self) -> Vec<(String, String)> {
        self.command
            .parameters
            .iter()
            .filter(|p| !p.positional)
            .map(|p| (p.key.clone(), self.expand(p)))
            .collect()
    }

    fn expand(&self, param: &Parameter) -> String {
        if param.references.is_empty() {
            return variables::decode_special_tokens(&param.raw_value);
        }
        variables::decode_special_tokens(&self.variables.expand(&param.raw_value).expanded)
    }

    pub fn variables(&self) -> &Variables {
        &*self.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut *self.variables
    }

    pub fn datasource(&self) -> &Datasource {
        &*self.datasource
    }

    pub fn datasource_mut(&mut self) -> &mut Datasource {
        &mut *self.datasource
    }

    /// Mutable access to both the datasource and the variables, for
    /// operations that move the row pointer and repopulate columns.
    pub fn datasource_and_variables(&mut self) -> (&mut Datasource, &mut Variables) {
        (&mut *self.datasource, &mut *self.variables)
    }

    pub fn bridge(&self) -> &Arc<dyn Bridge> {
        &self.bridge
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }
}

/// Implementation of one macro command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> CommandResult;

    /// Drops whatever the handler kept from a previous run. Called when a
    /// macro is loaded and when a persisted state is restored.
    fn reset(&self) {}
}

/// Adapter turning a synchronous closure into a [`CommandHandler`].
pub struct FnHandler<F>(F);

/// Wraps `f` so it can be registered as a handler.
///
/// ```
/// use macroflow_core::handler::{handler_fn, CommandResult};
///
/// let shout = handler_fn(|ctx| match ctx.param("TEXT") {
///     Some(text) => CommandResult::ok_with_output(text.to_uppercase()),
///     None => CommandResult::ok(),
/// });
/// # let _ = shout;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut CommandContext<'_>) -> CommandResult + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&mut CommandContext<'_>) -> CommandResult + Send + Sync,
{
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> CommandResult {
        (self.0)(ctx)
    }
}

/// Handlers by upper-case command name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `name`, replacing any previous one.
    pub fn register(&mut self, name: &str, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(name.trim().to_ascii_uppercase(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&name.trim().to_ascii_uppercase()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.trim().to_ascii_uppercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.remove(&name.trim().to_ascii_uppercase())
    }

    /// Calls [`CommandHandler::reset`] on every registered handler.
    pub fn reset_all(&self) {
        for handler in self.handlers.values() {
            handler.reset();
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
