//! The command dispatch loop.
//!
//! [`MacroExecutor`] owns everything one run needs: the parsed script, the
//! [`ExecutionState`], the datasource, the handler registry and the bridge.
//! [`MacroExecutor::execute`] walks the script line by line, handing each
//! command to its registered handler and applying the [`CommandResult`]:
//!
//! - success: advance to the next line;
//! - failure with `!ERRORIGNORE YES` and no forced stop: record it, advance;
//! - any other failure: stop with that error.
//!
//! At the end of the script the run starts another pass while
//! `loopCounter < maxLoops`, otherwise it completes.
//!
//! # Example
//!
//! ```
//! use macroflow_core::executor::{ExecutorConfig, MacroExecutor};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut executor = MacroExecutor::new(ExecutorConfig {
//!     max_loops: 2,
//!     ..Default::default()
//! });
//! executor.load_macro("SET !VAR1 {{!LOOP}}\nADD !VAR2 1").unwrap();
//!
//! let result = executor.execute().await;
//! assert!(result.success);
//! assert_eq!(result.loops_run, 2);
//! assert_eq!(result.variables["!VAR2"], "2");
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bridge::{Bridge, NoBridge};
use crate::builtins;
use crate::command::{CommandKind, ParsedScript};
use crate::datasource::{Datasource, LoadOptions};
use crate::error::{ErrorCode, MacroError};
use crate::events::{self, ExecutionEvent, LogSink};
use crate::handler::{CommandContext, CommandHandler, CommandResult, HandlerRegistry};
use crate::parser;
use crate::state::{ExecutionState, SerializedState, Status, DEFAULT_SNAPSHOT_CAPACITY};

/// Delay between commands when `!REPLAYSPEED` is `SLOW`.
pub const SLOW_REPLAY_DELAY: Duration = Duration::from_secs(1);

/// Settings for a [`MacroExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub macro_name: String,
    pub max_loops: u32,
    /// Initial value of `!ERRORIGNORE`.
    pub error_ignore: bool,
    pub snapshot_capacity: usize,
    /// Snapshot before every executed line.
    pub snapshot_every_line: bool,
    /// Fixed delay between commands. `None` derives it from `!REPLAYSPEED`.
    pub replay_delay: Option<Duration>,
    /// Variables seeded into every run, after the defaults.
    pub variables: BTreeMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            macro_name: "macro".to_string(),
            max_loops: 1,
            error_ignore: false,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            snapshot_every_line: false,
            replay_delay: None,
            variables: BTreeMap::new(),
        }
    }
}

/// Delay implied by a `!REPLAYSPEED` value.
pub fn replay_delay_for(speed: &str) -> Duration {
    if speed.trim().eq_ignore_ascii_case("SLOW") {
        SLOW_REPLAY_DELAY
    } else {
        Duration::ZERO
    }
}

/// Abort and pause handle for a run. Cheap to clone and safe to move to
/// another task.
///
/// Requests are observed between commands; a running handler is never
/// interrupted.
#[derive(Debug, Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(watch::channel(false).0),
        }
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_pause_requested(&self) -> bool {
        *self.paused.borrow()
    }

    /// Waits until the run is resumed (`true`) or aborted (`false`).
    pub async fn wait_resumed(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// What a single [`MacroExecutor::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A line ran (or was skipped) and the run can go on.
    Continue,
    /// The run is paused and waits for [`RunControl::resume`].
    Paused,
    /// The run reached a terminal status.
    Finished,
}

/// A failure absorbed by `!ERRORIGNORE` or `!ERRORLOOP`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IgnoredError {
    pub line: usize,
    pub code: ErrorCode,
    pub message: String,
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub success: bool,
    pub status: Status,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
    /// Line of the failure that ended the run.
    pub error_line: Option<usize>,
    /// Extract buffer joined with `[EXTRACT]`.
    pub extract: String,
    pub extract_data: Vec<String>,
    pub elapsed_ms: u64,
    pub variables: BTreeMap<String, String>,
    pub ignored_errors: Vec<IgnoredError>,
    pub loops_run: u32,
}

impl RunResult {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Runs macros.
pub struct MacroExecutor {
    config: ExecutorConfig,
    handlers: HandlerRegistry,
    bridge: Arc<dyn Bridge>,
    script: ParsedScript,
    state: ExecutionState,
    datasource: Datasource,
    control: RunControl,
    events: broadcast::Sender<ExecutionEvent>,
    ignored: Vec<IgnoredError>,
    error_line: Option<usize>,
    passes: u32,
    run_id: Uuid,
}

impl MacroExecutor {
    /// Creates an executor with the built-in handlers and no bridge.
    pub fn new(config: ExecutorConfig) -> Self {
        let mut handlers = HandlerRegistry::new();
        builtins::register_defaults(&mut handlers);
        let mut executor = Self {
            config,
            handlers,
            bridge: Arc::new(NoBridge),
            script: ParsedScript::default(),
            state: ExecutionState::default(),
            datasource: Datasource::new(),
            control: RunControl::new(),
            events: events::channel(),
            ignored: Vec::new(),
            error_line: None,
            passes: 1,
            run_id: Uuid::new_v4(),
        };
        executor.reset_state();
        executor
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn Bridge>) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn set_bridge(&mut self, bridge: Arc<dyn Bridge>) {
        self.bridge = bridge;
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Registers a handler for a command name, replacing any existing one.
    ///
    /// Names that are not built-in commands become custom commands accepted
    /// by [`load_macro`](Self::load_macro).
    pub fn register_handler(&mut self, name: &str, handler: impl CommandHandler + 'static) {
        self.handlers.register(name, Arc::new(handler));
    }

    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name)
    }

    /// Routes every browser and file command to the bridge.
    pub fn register_bridge_commands(&mut self) {
        builtins::register_bridge_commands(&mut self.handlers);
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// The abort/pause handle of the currently loaded run.
    ///
    /// Loading a macro or a state starts a new run with a fresh handle.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn script(&self) -> &ParsedScript {
        &self.script
    }

    pub fn datasource(&self) -> &Datasource {
        &self.datasource
    }

    pub fn datasource_mut(&mut self) -> &mut Datasource {
        &mut self.datasource
    }

    /// Loads tabular data and copies its current row into the variables.
    pub fn load_datasource(
        &mut self,
        content: &str,
        path: &str,
        options: LoadOptions,
    ) -> Result<(), MacroError> {
        self.datasource.load_from_content(content, path, options)?;
        self.datasource.populate_variables(self.state.variables_mut());
        Ok(())
    }

    /// Parses `source` and prepares a fresh run.
    ///
    /// On a syntax error the run is put in the error state and `execute()`
    /// returns the error without running any handler.
    pub fn load_macro(&mut self, source: &str) -> Result<(), MacroError> {
        let custom: Vec<String> = self
            .handlers
            .names()
            .into_iter()
            .filter(|name| CommandKind::builtin(name).is_none())
            .collect();
        self.script = parser::parse_with_commands(source, &custom);
        self.reset_state();

        if let Some(err) = self.script.first_error().cloned() {
            warn!(
                macro_name = %self.config.macro_name,
                errors = self.script.errors.len(),
                "macro has syntax errors"
            );
            self.state.set_error(ErrorCode::SyntaxError, err.to_string());
            self.error_line = Some(err.line_number);
            return Err(MacroError::Parse {
                line: err.line_number,
                message: err.message,
            });
        }

        debug!(
            macro_name = %self.config.macro_name,
            lines = self.script.total_lines(),
            "macro loaded"
        );
        Ok(())
    }

    /// Resumes a persisted run against the loaded macro.
    ///
    /// A state saved while running is restored as paused; `execute()` picks
    /// it up from its current line.
    pub fn load_state(&mut self, data: SerializedState) -> Result<(), MacroError> {
        if let Some(err) = self.script.first_error() {
            return Err(MacroError::Parse {
                line: err.line_number,
                message: err.message.clone(),
            });
        }
        let total = self.script.total_lines();
        if let Some(saved) = data.total_lines {
            if saved != total {
                return Err(MacroError::InvalidState(format!(
                    "state was saved for a macro of {} lines, loaded macro has {}",
                    saved, total
                )));
            }
        }

        let mut state = ExecutionState::deserialize(data)?;
        state.set_total_lines(total)?;
        if state.status() == Status::Running {
            state.pause()?;
        }

        self.passes = state.loop_counter();
        self.error_line = (state.status() == Status::Error).then(|| state.current_line());
        self.state = state;
        self.handlers.reset_all();
        self.ignored.clear();
        self.control = RunControl::new();
        self.run_id = Uuid::new_v4();
        info!(
            macro_name = %self.state.macro_name(),
            line = self.state.current_line(),
            loop_counter = self.state.loop_counter(),
            "state restored"
        );
        Ok(())
    }

    /// Persisted form of the current state.
    pub fn save_state(&self) -> SerializedState {
        self.state.serialize()
    }

    /// Clears a recorded error so the failed line runs again on `execute()`.
    pub fn clear_error(&mut self) -> Result<(), MacroError> {
        self.state.clear_error()?;
        self.error_line = None;
        Ok(())
    }

    /// Rewinds to a snapshot taken earlier in this run.
    pub fn restore_snapshot(&mut self, id: Uuid) -> Result<(), MacroError> {
        self.state.restore_snapshot(id)?;
        if self.state.error_code().is_ok() {
            self.error_line = None;
        }
        Ok(())
    }

    fn reset_state(&mut self) {
        let mut state =
            ExecutionState::new(self.config.macro_name.clone(), self.script.total_lines())
                .with_snapshot_capacity(self.config.snapshot_capacity);
        state.set_max_loops(self.config.max_loops);

        let vars = state.variables_mut();
        vars.set("!ERRORIGNORE", if self.config.error_ignore { "YES" } else { "NO" });
        for (name, value) in &self.config.variables {
            vars.set(name, value.clone());
        }

        self.state = state;
        self.handlers.reset_all();
        self.ignored.clear();
        self.error_line = None;
        self.passes = 1;
        self.control = RunControl::new();
        self.run_id = Uuid::new_v4();
    }

    /// Runs until the macro completes, fails, or is aborted.
    ///
    /// Pauses (from `PAUSE` or [`RunControl::pause`]) wait for
    /// [`RunControl::resume`].
    pub async fn execute(&mut self) -> RunResult {
        loop {
            match self.step().await {
                StepOutcome::Continue => {}
                StepOutcome::Paused => {
                    // an abort is picked up by the next step
                    self.control.wait_resumed().await;
                }
                StepOutcome::Finished => break,
            }
        }
        self.result()
    }

    /// Executes at most one line.
    pub async fn step(&mut self) -> StepOutcome {
        let mut just_resumed = false;

        match self.state.status() {
            Status::Completed | Status::Error | Status::Aborted => return StepOutcome::Finished,
            Status::Idle => {
                if let Err(e) = self.begin() {
                    warn!(error = %e, "could not start run");
                    return StepOutcome::Finished;
                }
            }
            Status::Paused => {
                if self.control.is_aborted() {
                    return self.abort_run();
                }
                if self.state.resume().is_err() {
                    return StepOutcome::Finished;
                }
                just_resumed = true;
                let _ = self.events.send(ExecutionEvent::Resumed {
                    line: self.state.current_line(),
                });
            }
            Status::Running => {}
        }

        if self.control.is_aborted() {
            return self.abort_run();
        }
        if !just_resumed && self.control.is_pause_requested() {
            return self.pause_run();
        }
        if self.state.is_loop_limit_reached() {
            return self.fail_loop_limit();
        }
        if !self.state.can_continue() {
            return StepOutcome::Finished;
        }

        let line = self.state.current_line();
        if line == 0 {
            if self.state.total_lines() == 0 {
                return self.complete_run();
            }
            self.state.advance_line();
            return StepOutcome::Continue;
        }

        let Some(command) = self.script.command_at(line).cloned() else {
            self.state.set_error(ErrorCode::ScriptError, format!("no command at line {}", line));
            self.error_line = Some(line);
            return self.finish();
        };
        if command.kind.is_placeholder() {
            return self.advance();
        }

        if self.config.snapshot_every_line {
            self.state.create_snapshot(Some(format!("line {}", line).as_str()));
        }
        let delay = self.replay_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let kind_name = command.kind_name().to_string();
        let _ = self.events.send(ExecutionEvent::LineStarted {
            line,
            command: kind_name.clone(),
        });

        let result = match self.handlers.get(&kind_name) {
            Some(handler) => {
                let span = info_span!("macro_line", line, command = %kind_name);
                let mut ctx = CommandContext::new(
                    &command,
                    self.state.loop_counter(),
                    self.state.variables_mut(),
                    &mut self.datasource,
                    Arc::clone(&self.bridge),
                    LogSink::new(line, self.events.clone()),
                );
                handler.execute(&mut ctx).instrument(span).await
            }
            None => CommandResult::fail(
                ErrorCode::UnsupportedCommand,
                format!("Unsupported command: {}", kind_name),
            ),
        };

        self.apply_result(line, kind_name, result)
    }

    fn apply_result(&mut self, line: usize, command: String, result: CommandResult) -> StepOutcome {
        self.sync_loop_variable();

        if let Some(output) = result.output.as_deref().filter(|o| !o.is_empty()) {
            self.state.add_extract(output);
            let joined = self.state.extract_string();
            self.state.variables_mut().set("!EXTRACT", joined);
        }

        let code = result.effective_error_code();
        let _ = self.events.send(ExecutionEvent::LineFinished {
            line,
            command: command.clone(),
            success: result.success,
            error_code: code,
        });

        if result.success {
            debug!(line, command = %command, "line ok");
            let outcome = self.advance();
            if result.pause_requested && outcome == StepOutcome::Continue {
                self.control.pause();
                return self.pause_run();
            }
            return outcome;
        }

        let message = result
            .error_message
            .clone()
            .unwrap_or_else(|| code.as_str().to_string());
        let vars = self.state.variables();
        let error_loop = vars.flag("!ERRORLOOP");
        let absorbable = !result.stop_execution && (vars.flag("!ERRORIGNORE") || error_loop);

        if absorbable {
            warn!(line, command = %command, code = %code, %message, "error ignored");
            let _ = self.events.send(ExecutionEvent::ErrorIgnored {
                line,
                error_code: code,
                message: message.clone(),
            });
            self.ignored.push(IgnoredError { line, code, message });
            return if error_loop { self.end_of_pass() } else { self.advance() };
        }

        warn!(line, command = %command, code = %code, %message, "line failed");
        self.state.set_error(code, message);
        self.error_line = Some(line);
        self.finish()
    }

    /// Moves to the next line, or ends the pass after the last one.
    fn advance(&mut self) -> StepOutcome {
        if self.state.advance_line() {
            StepOutcome::Continue
        } else {
            self.end_of_pass()
        }
    }

    fn end_of_pass(&mut self) -> StepOutcome {
        if self.state.is_loop_limit_reached() {
            return self.fail_loop_limit();
        }
        if self.state.loop_counter() >= self.state.max_loops() {
            return self.complete_run();
        }

        self.state.reset_for_loop();
        self.state.increment_loop();
        self.passes += 1;
        self.datasource.populate_variables(self.state.variables_mut());
        self.state.advance_line();
        debug!(loop_counter = self.state.loop_counter(), "next loop");
        let _ = self.events.send(ExecutionEvent::LoopStarted {
            loop_counter: self.state.loop_counter(),
        });
        StepOutcome::Continue
    }

    /// Keeps `!LOOP` and the loop counter in step after a handler ran.
    ///
    /// During the first pass a macro may move the counter with `SET !LOOP n`;
    /// later writes are reverted.
    fn sync_loop_variable(&mut self) {
        let counter = self.state.loop_counter();
        let written = self
            .state
            .variables()
            .get("!LOOP")
            .and_then(|v| v.trim().parse::<u32>().ok());
        match written {
            Some(n) if n == counter => {}
            Some(n) if n >= 1 && self.passes == 1 => {
                debug!(from = counter, to = n, "loop counter set by macro");
                self.state.set_loop_counter(n);
            }
            _ => self.state.set_loop_counter(counter),
        }
    }

    fn replay_delay(&self) -> Duration {
        self.config.replay_delay.unwrap_or_else(|| {
            self.state
                .variables()
                .get("!REPLAYSPEED")
                .map_or(Duration::ZERO, |speed| replay_delay_for(&speed))
        })
    }

    fn begin(&mut self) -> Result<(), MacroError> {
        self.state.start()?;
        self.datasource.populate_variables(self.state.variables_mut());
        let _ = self.events.send(ExecutionEvent::Started {
            run_id: self.run_id,
            macro_name: self.state.macro_name().to_string(),
            total_lines: self.state.total_lines(),
            max_loops: self.state.max_loops(),
        });
        Ok(())
    }

    fn pause_run(&mut self) -> StepOutcome {
        if self.state.pause().is_err() {
            return StepOutcome::Finished;
        }
        info!(line = self.state.current_line(), "run paused");
        let _ = self.events.send(ExecutionEvent::Paused {
            line: self.state.current_line(),
        });
        StepOutcome::Paused
    }

    fn abort_run(&mut self) -> StepOutcome {
        if self.state.abort().is_ok() {
            self.error_line = Some(self.state.current_line());
        }
        self.finish()
    }

    fn fail_loop_limit(&mut self) -> StepOutcome {
        let message = format!(
            "loop counter {} exceeds the limit of {}",
            self.state.loop_counter(),
            self.state.max_loops()
        );
        self.state.set_error(ErrorCode::LoopLimit, message);
        self.error_line = Some(self.state.current_line());
        self.finish()
    }

    fn complete_run(&mut self) -> StepOutcome {
        if let Err(e) = self.state.complete() {
            warn!(error = %e, "could not complete run");
        }
        self.finish()
    }

    fn finish(&mut self) -> StepOutcome {
        let _ = self.events.send(ExecutionEvent::Finished {
            status: self.state.status(),
            error_code: self.state.error_code(),
            loops_run: self.passes,
        });
        StepOutcome::Finished
    }

    /// Summary of the run so far.
    pub fn result(&self) -> RunResult {
        let status = self.state.status();
        let error_code = self.state.error_code();
        RunResult {
            success: status == Status::Completed && error_code.is_ok(),
            status,
            error_code,
            error_message: self.state.error_message().map(str::to_string),
            error_line: if error_code.is_ok() { None } else { self.error_line },
            extract: self.state.extract_string(),
            extract_data: self.state.extract_data().to_vec(),
            elapsed_ms: self.state.elapsed().as_millis() as u64,
            variables: self.state.variables().snapshot(),
            ignored_errors: self.ignored.clone(),
            loops_run: self.passes,
        }
    }
}

/// Parses and runs `source` with the built-in handlers and no bridge.
pub async fn run_macro(source: &str, config: ExecutorConfig) -> RunResult {
    let mut executor = MacroExecutor::new(config);
    // a syntax error is reported through the result
    let _ = executor.load_macro(source);
    executor.execute().await
}
