//! Command-line runner for macroflow automation macros.
//!
//! # Usage
//!
//! ```bash
//! # Run a macro once
//! macroflow run search.iim
//!
//! # Run three passes over a CSV file, reading the macro from stdin
//! cat search.iim | macroflow run - --loops 3 --datasource terms.csv
//!
//! # Exercise a macro without a browser, printing run events
//! macroflow run search.iim --dry-run --events
//!
//! # Seed variables and keep going past failures
//! macroflow run search.iim --var !VAR1=rust --var query=async --error-ignore
//!
//! # Persist the state when the run ends, then pick it up later
//! macroflow run search.iim --save-state run.json
//! macroflow run search.iim --resume run.json
//!
//! # Syntax check only
//! macroflow check search.iim
//!
//! # List the recognized system variables
//! macroflow vars
//! ```
//!
//! A `PAUSE` line ends the process with the run paused; pair it with
//! `--save-state` and continue later with `--resume`.
//!
//! Exit codes: `0` success, `1` command failure, `2` syntax error, `3` user
//! abort, `4` file or datasource error, `5` paused.

mod bridge;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use macroflow_core::config::EngineConfig;
use macroflow_core::datasource::LoadOptions;
use macroflow_core::executor::{MacroExecutor, StepOutcome};
use macroflow_core::state::{is_serialized_state, SerializedState, Status};
use macroflow_core::variables::{Variables, SYSTEM_VARIABLES};
use macroflow_core::{parser, ErrorCode, MacroError, RunResult};

use crate::bridge::LocalBridge;

/// Command-line runner for macroflow automation macros.
#[derive(Parser)]
#[command(name = "macroflow")]
#[command(about = "Run line-oriented browser automation macros")]
#[command(version)]
struct Cli {
    /// Output format: text or json
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Config file (defaults to ~/.macroflow/config.json)
    #[arg(long, env = "MACROFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "MACROFLOW_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a macro
    Run(RunArgs),

    /// Parse a macro and report every syntax error
    Check {
        /// Path to the macro file ("-" for stdin)
        script: PathBuf,
    },

    /// List the recognized system variables and their defaults
    Vars,
}

#[derive(Args)]
struct RunArgs {
    /// Path to the macro file ("-" for stdin)
    script: PathBuf,

    /// Number of passes over the macro
    #[arg(short, long, env = "MACROFLOW_LOOPS")]
    loops: Option<u32>,

    /// Continue past failing commands
    #[arg(short, long)]
    error_ignore: bool,

    /// CSV file whose rows feed !COL1..!COL10
    #[arg(short, long)]
    datasource: Option<PathBuf>,

    /// Write the run state to this file when the run ends
    #[arg(long)]
    save_state: Option<PathBuf>,

    /// Resume from a state file written by --save-state
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Accept browser commands without a browser
    #[arg(long)]
    dry_run: bool,

    /// Print run events to stderr as JSON lines
    #[arg(long)]
    events: bool,

    /// Seed a variable before the run (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    vars: Vec<(String, String)>,
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

#[derive(Debug)]
enum CliError {
    Io(PathBuf, std::io::Error),
    Macro(MacroError),
    InvalidState(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Io(..) => ExitCode::from(4),
            CliError::Macro(MacroError::Parse { .. }) => ExitCode::from(2),
            CliError::Macro(MacroError::Io(_)) => ExitCode::from(4),
            CliError::Macro(_) | CliError::InvalidState(_) => ExitCode::from(1),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Io(path, e) => write!(f, "{}: {}", path.display(), e),
            CliError::Macro(e) => write!(f, "{}", e),
            CliError::InvalidState(msg) => write!(f, "Invalid state file: {}", msg),
        }
    }
}

impl From<MacroError> for CliError {
    fn from(e: MacroError) -> Self {
        CliError::Macro(e)
    }
}

const EXIT_PAUSED: u8 = 5;

/// Process exit code for the final error code of a run.
fn exit_code_for(code: ErrorCode) -> u8 {
    match code {
        ErrorCode::Ok => 0,
        ErrorCode::SyntaxError => 2,
        ErrorCode::UserAbort => 3,
        ErrorCode::FileError
        | ErrorCode::FileNotFound
        | ErrorCode::FileAccessDenied
        | ErrorCode::FileWriteError
        | ErrorCode::DatasourceError => 4,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref(), cli.log_json);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn init_logging(log_file: Option<&Path>, json: bool) {
    let filter =
        EnvFilter::try_from_env("MACROFLOW_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map_or_else(|| "macroflow.log".into(), |n| n.to_os_string());
            let file_appender = tracing_appender::rolling::never(dir, name);
            let builder = builder.with_writer(file_appender).with_ansi(false);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let config = match cli.config {
        Some(ref path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    };

    match cli.command {
        Command::Run(args) => run_macro_file(args, &config, cli.format).await,
        Command::Check { ref script } => check(script, cli.format).await,
        Command::Vars => {
            list_vars(cli.format);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Reads a macro from a file, or from stdin for `-`.
async fn read_script(path: &Path) -> Result<String, CliError> {
    if path == Path::new("-") {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .map_err(|e| CliError::Io(path.to_path_buf(), e))?;
        return Ok(buf);
    }
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CliError::Io(path.to_path_buf(), e))
}

fn macro_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| *s != "-")
        .unwrap_or("stdin")
        .to_string()
}

async fn run_macro_file(
    args: RunArgs,
    config: &EngineConfig,
    format: OutputFormat,
) -> Result<ExitCode, CliError> {
    let source = read_script(&args.script).await?;
    let name = macro_name(&args.script);

    let mut exec_config = config.executor_config(&name);
    if let Some(loops) = args.loops {
        exec_config.max_loops = loops.max(1);
    }
    if args.error_ignore {
        exec_config.error_ignore = true;
    }
    exec_config.variables.extend(args.vars);

    let mut bridge = LocalBridge::new(args.dry_run);
    if let Some(dir) = args.script.parent().filter(|d| !d.as_os_str().is_empty()) {
        bridge = bridge.with_base_dir(dir);
    }

    let mut executor = MacroExecutor::new(exec_config).with_bridge(Arc::new(bridge));
    executor.register_bridge_commands();

    if executor.load_macro(&source).is_err() {
        // the result only carries the first one
        for err in &executor.script().errors {
            eprintln!("{}", err);
        }
    }

    if let Some(ref path) = args.resume {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CliError::Io(path.clone(), e))?;
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| CliError::InvalidState(e.to_string()))?;
        if !is_serialized_state(&value) {
            return Err(CliError::InvalidState(format!(
                "{} is not a saved run",
                path.display()
            )));
        }
        let data: SerializedState =
            serde_json::from_value(value).map_err(|e| CliError::InvalidState(e.to_string()))?;
        executor.load_state(data)?;
        if executor.state().status() == Status::Error {
            executor.clear_error()?;
        }
    }

    if let Some(ref path) = args.datasource {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CliError::Io(path.clone(), e))?;
        executor.load_datasource(&content, &path.display().to_string(), LoadOptions::default())?;
        info!(
            path = %path.display(),
            rows = executor.datasource().row_count(),
            "datasource loaded"
        );
    }

    let event_task = args.events.then(|| {
        let mut rx = executor.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Ok(line) = serde_json::to_string(&event) {
                            eprintln!("{}", line);
                        }
                    }
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "event output lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let control = executor.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting run");
            control.abort();
        }
    });

    let result = loop {
        match executor.step().await {
            StepOutcome::Continue => {}
            StepOutcome::Paused | StepOutcome::Finished => break executor.result(),
        }
    };

    if let Some(ref path) = args.save_state {
        let json = executor.state().to_json()?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| CliError::Io(path.clone(), e))?;
        info!(path = %path.display(), "state saved");
    }

    drop(executor);
    if let Some(task) = event_task {
        let _ = task.await;
    }

    print_result(&result, format);
    if result.status == Status::Paused {
        return Ok(ExitCode::from(EXIT_PAUSED));
    }
    Ok(ExitCode::from(exit_code_for(result.error_code)))
}

fn print_result(result: &RunResult, format: OutputFormat) {
    if format == OutputFormat::Json {
        match serde_json::to_string_pretty(result) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: {}", e),
        }
        return;
    }

    for value in &result.extract_data {
        println!("{}", value);
    }
    for ignored in &result.ignored_errors {
        eprintln!(
            "ignored: line {}: {} ({})",
            ignored.line, ignored.message, ignored.code
        );
    }
    if result.success {
        eprintln!(
            "completed: {} loop(s) in {}ms",
            result.loops_run, result.elapsed_ms
        );
    } else if result.status == Status::Paused {
        eprintln!("paused in loop {}; continue with --resume", result.loops_run);
    } else {
        let line = result
            .error_line
            .map(|l| format!("line {}: ", l))
            .unwrap_or_default();
        eprintln!(
            "{}: {}{} ({})",
            result.status,
            line,
            result.error_message.as_deref().unwrap_or(""),
            result.error_code
        );
    }
}

async fn check(path: &Path, format: OutputFormat) -> Result<ExitCode, CliError> {
    let source = read_script(path).await?;
    let script = parser::parse(&source);

    if format == OutputFormat::Json {
        let output = serde_json::json!({
            "valid": script.is_valid(),
            "lines": script.total_lines(),
            "commands": script.executable().count(),
            "errors": &script.errors,
        });
        println!("{}", output);
    } else if script.is_valid() {
        println!(
            "OK: {} lines, {} commands",
            script.total_lines(),
            script.executable().count()
        );
    } else {
        for err in &script.errors {
            println!("{}", err);
        }
    }

    Ok(if script.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn list_vars(format: OutputFormat) {
    let vars = Variables::new();
    if format == OutputFormat::Json {
        let map: serde_json::Map<String, serde_json::Value> = SYSTEM_VARIABLES
            .iter()
            .map(|name| {
                let value = vars
                    .get(name)
                    .map_or(serde_json::Value::Null, serde_json::Value::String);
                (name.to_string(), value)
            })
            .collect();
        println!("{}", serde_json::Value::Object(map));
        return;
    }
    for name in SYSTEM_VARIABLES {
        match vars.get(name) {
            Some(value) => println!("{} = {}", name, value),
            None => println!("{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_splits_on_first_equals() {
        assert_eq!(
            parse_var("!VAR1=a=b").unwrap(),
            ("!VAR1".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_var("name=").unwrap(), ("name".to_string(), String::new()));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn exit_codes_by_family() {
        assert_eq!(exit_code_for(ErrorCode::Ok), 0);
        assert_eq!(exit_code_for(ErrorCode::SyntaxError), 2);
        assert_eq!(exit_code_for(ErrorCode::UserAbort), 3);
        assert_eq!(exit_code_for(ErrorCode::FileNotFound), 4);
        assert_eq!(exit_code_for(ErrorCode::DatasourceError), 4);
        assert_eq!(exit_code_for(ErrorCode::ElementNotFound), 1);
        assert_eq!(exit_code_for(ErrorCode::UnsupportedCommand), 1);
    }

    #[test]
    fn macro_name_from_path() {
        assert_eq!(macro_name(Path::new("dir/search.iim")), "search");
        assert_eq!(macro_name(Path::new("-")), "stdin");
    }
}
