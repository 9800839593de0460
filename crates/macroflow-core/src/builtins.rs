//! Built-in command handlers.
//!
//! The interpreter itself implements the commands that only touch run state:
//! `SET`, `ADD`, `WAIT`, `VERSION`, `PAUSE` and `STOPWATCH`. Everything that
//! needs a browser or the filesystem goes through [`BridgeHandler`], which
//! forwards the command to the attached [`Bridge`](crate::bridge::Bridge).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bridge::{BridgeRequest, BridgeResponse};
use crate::command::CommandKind;
use crate::datasource::{DatasourceError, LoadOptions};
use crate::error::{ErrorCode, MacroError};
use crate::handler::{CommandContext, CommandHandler, CommandResult, HandlerRegistry};
use crate::state::EXTRACT_SEPARATOR;

/// Commands handled in-process by default.
pub const CORE_COMMANDS: [&str; 6] = ["SET", "ADD", "WAIT", "VERSION", "PAUSE", "STOPWATCH"];

/// Step timeout used when `!TIMEOUT_STEP` is unset or invalid.
pub const DEFAULT_STEP_TIMEOUT_SECS: f64 = 6.0;

/// Registers the handlers for [`CORE_COMMANDS`].
pub fn register_defaults(registry: &mut HandlerRegistry) {
    registry.register("SET", Arc::new(SetHandler));
    registry.register("ADD", Arc::new(AddHandler));
    registry.register("WAIT", Arc::new(WaitHandler));
    registry.register("VERSION", Arc::new(VersionHandler));
    registry.register("PAUSE", Arc::new(PauseHandler));
    registry.register("STOPWATCH", Arc::new(StopwatchHandler::default()));
}

/// Built-in command names that are not [`CORE_COMMANDS`] and so need a bridge.
pub fn bridge_command_names() -> Vec<String> {
    CommandKind::BUILTIN
        .iter()
        .map(|k| k.name().to_string())
        .filter(|name| !CORE_COMMANDS.contains(&name.as_str()))
        .collect()
}

/// Registers a shared [`BridgeHandler`] for every name in [`bridge_command_names`].
pub fn register_bridge_commands(registry: &mut HandlerRegistry) {
    let handler: Arc<dyn CommandHandler> = Arc::new(BridgeHandler);
    for name in bridge_command_names() {
        registry.register(&name, Arc::clone(&handler));
    }
}

// ---------------------------------------------------------------------------
// SET
// ---------------------------------------------------------------------------

/// `SET name value`.
#[derive(Debug, Default)]
pub struct SetHandler;

#[async_trait]
impl CommandHandler for SetHandler {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> CommandResult {
        let (Some(name), Some(value)) = (ctx.positional(0), ctx.positional(1)) else {
            return CommandResult::fail(
                ErrorCode::MissingParameter,
                "SET requires a variable name and a value",
            );
        };
        let name = name.trim().to_uppercase();

        match name.as_str() {
            "!DATASOURCE" => load_datasource(ctx, &value).await,
            "!DATASOURCE_LINE" => jump_datasource(ctx, &value),
            "!EXTRACT" => {
                if value.eq_ignore_ascii_case("NULL") {
                    CommandResult::ok()
                } else {
                    CommandResult::ok_with_output(value)
                }
            }
            _ => {
                let result = ctx.variables_mut().set(&name, value);
                if !result.success {
                    ctx.log().debug(format!("ignored write to unknown variable {}", name));
                }
                CommandResult::ok()
            }
        }
    }
}

async fn load_datasource(ctx: &mut CommandContext<'_>, file: &str) -> CommandResult {
    let path = resolve_in_folder(ctx.variables().get("!FOLDER_DATASOURCE").as_deref(), file);
    let delimiter = ctx
        .variables()
        .get("!DATASOURCE_DELIMITER")
        .and_then(|d| parse_delimiter(&d));

    let bridge = Arc::clone(ctx.bridge());
    let response = bridge.send_message(BridgeRequest::ReadFile { path: path.clone() }).await;
    if !response.success {
        return CommandResult::fail(
            ErrorCode::DatasourceError,
            format!("cannot read datasource {}: {}", path, response.error_message()),
        );
    }
    let content = response.data.unwrap_or_default();

    let options = LoadOptions {
        delimiter,
        ..Default::default()
    };
    let (datasource, variables) = ctx.datasource_and_variables();
    if let Err(e) = datasource.load_from_content(&content, &path, options) {
        return datasource_failure(e);
    }
    datasource.populate_variables(variables);
    ctx.log().info(format!(
        "loaded datasource {} ({} rows)",
        path,
        ctx.datasource().row_count()
    ));
    CommandResult::ok()
}

fn jump_datasource(ctx: &mut CommandContext<'_>, value: &str) -> CommandResult {
    let Ok(row) = value.trim().parse::<usize>() else {
        return CommandResult::fail(
            ErrorCode::InvalidParameter,
            format!("!DATASOURCE_LINE must be a positive number, got '{}'", value),
        );
    };
    let (datasource, variables) = ctx.datasource_and_variables();
    if let Err(e) = datasource.go_to_row(row) {
        return datasource_failure(e);
    }
    datasource.populate_variables(variables);
    CommandResult::ok()
}

fn datasource_failure(e: DatasourceError) -> CommandResult {
    let message = e.to_string();
    CommandResult::fail(MacroError::from(e).error_code(), message)
}

/// Joins `file` onto `folder` unless `file` is already absolute.
fn resolve_in_folder(folder: Option<&str>, file: &str) -> String {
    let file = file.trim();
    match folder.map(str::trim) {
        Some(folder) if !folder.is_empty() && !is_absolute(file) => {
            format!("{}/{}", folder.trim_end_matches(['/', '\\']), file)
        }
        _ => file.to_string(),
    }
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
        || path.starts_with('\\')
        || path.as_bytes().get(1) == Some(&b':')
}

/// Accepts a single character, `TAB` or `\t`.
fn parse_delimiter(value: &str) -> Option<char> {
    match value {
        "" => None,
        v if v.eq_ignore_ascii_case("TAB") || v == "\\t" => Some('\t'),
        v => {
            let mut chars = v.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(c),
                _ => None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ADD
// ---------------------------------------------------------------------------

/// `ADD name value`: numeric sum when both sides are numbers, otherwise
/// string concatenation.
#[derive(Debug, Default)]
pub struct AddHandler;

#[async_trait]
impl CommandHandler for AddHandler {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> CommandResult {
        let (Some(name), Some(value)) = (ctx.positional(0), ctx.positional(1)) else {
            return CommandResult::fail(
                ErrorCode::MissingParameter,
                "ADD requires a variable name and a value",
            );
        };
        let current = ctx.variables().get(&name).unwrap_or_default();
        let combined = add_values(&current, &value);
        ctx.variables_mut().set(&name, combined);
        CommandResult::ok()
    }
}

fn add_values(current: &str, value: &str) -> String {
    let lhs = if current.trim().is_empty() {
        Some(0.0)
    } else {
        current.trim().parse::<f64>().ok()
    };
    match (lhs, value.trim().parse::<f64>()) {
        (Some(a), Ok(b)) => format_number(a + b),
        _ => format!("{}{}", current, value),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

// ---------------------------------------------------------------------------
// WAIT / VERSION / PAUSE
// ---------------------------------------------------------------------------

/// `WAIT SECONDS=n`, fractions allowed.
#[derive(Debug, Default)]
pub struct WaitHandler;

#[async_trait]
impl CommandHandler for WaitHandler {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> CommandResult {
        let seconds = match ctx.require_param("SECONDS") {
            Ok(s) => s,
            Err(result) => return result,
        };
        let parsed = seconds.trim().parse::<f64>().ok();
        let Some(duration) = parsed.and_then(|s| Duration::try_from_secs_f64(s).ok()) else {
            return CommandResult::fail(
                ErrorCode::InvalidParameter,
                format!("WAIT SECONDS must be a non-negative number, got '{}'", seconds),
            );
        };
        debug!(line = ctx.line(), secs = duration.as_secs_f64(), "waiting");
        tokio::time::sleep(duration).await;
        CommandResult::ok()
    }
}

#[derive(Debug, Default)]
pub struct VersionHandler;

#[async_trait]
impl CommandHandler for VersionHandler {
    async fn execute(&self, _ctx: &mut CommandContext<'_>) -> CommandResult {
        CommandResult::ok()
    }
}

/// `PAUSE`: stops the run until it is resumed through its run control.
#[derive(Debug, Default)]
pub struct PauseHandler;

#[async_trait]
impl CommandHandler for PauseHandler {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> CommandResult {
        ctx.log().info("paused by macro");
        CommandResult::paused()
    }
}

// ---------------------------------------------------------------------------
// STOPWATCH
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopwatchAction {
    Start,
    Stop,
    Lap,
    Toggle,
}

/// `STOPWATCH ID=x [ACTION=START|STOP|LAP]`.
///
/// Without `ACTION` the watch toggles. `STOP` and `LAP` write the elapsed
/// seconds to `!STOPWATCHTIME`. Running watches are dropped when a new run
/// starts.
#[derive(Debug, Default)]
pub struct StopwatchHandler {
    running: Mutex<HashMap<String, Instant>>,
}

#[async_trait]
impl CommandHandler for StopwatchHandler {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> CommandResult {
        let id = match ctx.require_param("ID") {
            Ok(id) => id.trim().to_uppercase(),
            Err(result) => return result,
        };
        let action = match ctx.param("ACTION").as_deref().map(str::trim) {
            None => StopwatchAction::Toggle,
            Some(a) if a.eq_ignore_ascii_case("START") => StopwatchAction::Start,
            Some(a) if a.eq_ignore_ascii_case("STOP") => StopwatchAction::Stop,
            Some(a) if a.eq_ignore_ascii_case("LAP") => StopwatchAction::Lap,
            Some(other) => {
                return CommandResult::fail(
                    ErrorCode::InvalidParameter,
                    format!("unknown STOPWATCH ACTION '{}'", other),
                )
            }
        };

        let mut running = self.running.lock().await;
        let action = match action {
            StopwatchAction::Toggle if running.contains_key(&id) => StopwatchAction::Stop,
            StopwatchAction::Toggle => StopwatchAction::Start,
            a => a,
        };

        match action {
            StopwatchAction::Start => {
                running.insert(id, Instant::now());
                CommandResult::ok()
            }
            StopwatchAction::Stop | StopwatchAction::Lap => {
                let started = if action == StopwatchAction::Stop {
                    running.remove(&id)
                } else {
                    running.get(&id).copied()
                };
                let Some(started) = started else {
                    return CommandResult::fail(
                        ErrorCode::InvalidParameter,
                        format!("stopwatch {} is not running", id),
                    );
                };
                let secs = format!("{:.3}", started.elapsed().as_secs_f64());
                drop(running);
                ctx.variables_mut().set("!STOPWATCHTIME", secs);
                CommandResult::ok()
            }
            StopwatchAction::Toggle => CommandResult::ok(),
        }
    }

    fn reset(&self) {
        if let Ok(mut running) = self.running.try_lock() {
            running.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge-backed commands
// ---------------------------------------------------------------------------

/// Error code reported when the bridge fails a command of this kind.
pub fn failure_code(kind: &CommandKind) -> ErrorCode {
    match kind {
        CommandKind::Tag | CommandKind::Click | CommandKind::Event | CommandKind::ImageClick => {
            ErrorCode::ElementNotFound
        }
        CommandKind::Frame => ErrorCode::FrameError,
        CommandKind::OnDownload | CommandKind::SaveItem => ErrorCode::DownloadError,
        CommandKind::SaveAs | CommandKind::Screenshot | CommandKind::Print => {
            ErrorCode::FileWriteError
        }
        CommandKind::FileDelete => ErrorCode::FileError,
        _ => ErrorCode::UnknownError,
    }
}

/// `FILEDELETE NAME=` and `SAVEAS TYPE=EXTRACT` are file requests; every
/// other command goes to the browser as is.
fn bridge_request(
    ctx: &CommandContext<'_>,
    kind: &CommandKind,
) -> Result<BridgeRequest, CommandResult> {
    match kind {
        CommandKind::FileDelete => {
            let name = ctx.require_param("NAME")?;
            Ok(BridgeRequest::DeleteFile {
                path: name.trim().to_string(),
            })
        }
        CommandKind::SaveAs if is_extract_type(ctx.param("TYPE").as_deref()) => {
            let file = ctx.require_param("FILE")?;
            let folder = ctx
                .param("FOLDER")
                .filter(|f| f.trim() != "*")
                .or_else(|| ctx.variables().get("!FOLDER_DOWNLOAD"));
            let extract = ctx.variables().get("!EXTRACT").unwrap_or_default();
            Ok(BridgeRequest::WriteFile {
                path: resolve_in_folder(folder.as_deref(), &file),
                content: extract_csv_row(&extract),
                append: true,
            })
        }
        _ => Ok(BridgeRequest::Command {
            command: kind.name().to_string(),
            params: ctx.expanded_params().into_iter().collect::<BTreeMap<_, _>>(),
            line: ctx.line(),
        }),
    }
}

fn is_extract_type(value: Option<&str>) -> bool {
    value.is_some_and(|t| t.trim().eq_ignore_ascii_case("EXTRACT"))
}

/// Extracted values as one CSV line, every field quoted.
fn extract_csv_row(extract: &str) -> String {
    let fields: Vec<String> = extract
        .split(EXTRACT_SEPARATOR)
        .map(|v| format!("\"{}\"", v.replace('"', "\"\"")))
        .collect();
    format!("{}\n", fields.join(","))
}

/// `!TIMEOUT_STEP` as a duration; zero, negative or unrepresentable values
/// fall back to [`DEFAULT_STEP_TIMEOUT_SECS`].
fn step_timeout(secs: Option<f64>) -> Duration {
    secs.filter(|s| *s > 0.0)
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .unwrap_or(Duration::from_secs_f64(DEFAULT_STEP_TIMEOUT_SECS))
}

/// Forwards a command to the bridge.
///
/// The call is bounded by `!TIMEOUT_STEP` seconds. Response data becomes the
/// command's output for `EXTRACT` and for any command with an `EXTRACT=`
/// parameter; for `URL` it is recorded in `!URLCURRENT`.
#[derive(Debug, Default)]
pub struct BridgeHandler;

#[async_trait]
impl CommandHandler for BridgeHandler {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> CommandResult {
        let kind = ctx.command().kind.clone();
        let request = match bridge_request(ctx, &kind) {
            Ok(request) => request,
            Err(result) => return result,
        };

        let limit = step_timeout(ctx.variables().get_number("!TIMEOUT_STEP"));
        let bridge = Arc::clone(ctx.bridge());

        let response: BridgeResponse =
            match tokio::time::timeout(limit, bridge.send_message(request)).await {
                Ok(response) => response,
                Err(_) => {
                    let secs = limit.as_secs_f64();
                    warn!(line = ctx.line(), command = %kind, secs, "bridge call timed out");
                    return CommandResult::fail(
                        ErrorCode::Timeout,
                        format!("{} timed out after {}s", kind, secs),
                    );
                }
            };

        if !response.success {
            return CommandResult::fail(failure_code(&kind), response.error_message().to_string());
        }

        match response.data {
            Some(data) if kind == CommandKind::Url => {
                ctx.variables_mut().set("!URLCURRENT", data);
                CommandResult::ok()
            }
            Some(data) if kind == CommandKind::Extract || ctx.has_param("EXTRACT") => {
                CommandResult::ok_with_output(data)
            }
            _ => CommandResult::ok(),
        }
    }
}
