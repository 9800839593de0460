//! Run events and the per-command log sink.
//!
//! A [`MacroExecutor`](crate::executor::MacroExecutor) publishes
//! [`ExecutionEvent`]s on a `tokio` broadcast channel so UIs and recorders can
//! follow a run without holding a reference to it. Sending never blocks and a
//! run with no subscribers simply drops its events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::state::Status;

/// Capacity of the event channel. Slow subscribers see `Lagged` past this.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started {
        run_id: Uuid,
        macro_name: String,
        total_lines: usize,
        max_loops: u32,
    },
    LoopStarted {
        loop_counter: u32,
    },
    LineStarted {
        line: usize,
        command: String,
    },
    LineFinished {
        line: usize,
        command: String,
        success: bool,
        error_code: ErrorCode,
    },
    /// A failure absorbed by `!ERRORIGNORE`.
    ErrorIgnored {
        line: usize,
        error_code: ErrorCode,
        message: String,
    },
    Paused {
        line: usize,
    },
    Resumed {
        line: usize,
    },
    /// A message written by a handler through its [`LogSink`].
    Log {
        line: usize,
        level: LogLevel,
        message: String,
    },
    Finished {
        status: Status,
        error_code: ErrorCode,
        loops_run: u32,
    },
}

/// Creates the sending half of an event channel.
pub fn channel() -> broadcast::Sender<ExecutionEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Logging handle lent to a command handler.
///
/// Each message becomes a `tracing` event tagged with the macro line and an
/// [`ExecutionEvent::Log`] on the run's channel.
#[derive(Debug, Clone)]
pub struct LogSink {
    line: usize,
    events: broadcast::Sender<ExecutionEvent>,
}

impl LogSink {
    pub fn new(line: usize, events: broadcast::Sender<ExecutionEvent>) -> Self {
        Self { line, events }
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(LogLevel::Debug, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message.into());
    }

    fn emit(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => tracing::debug!(line = self.line, "{}", message),
            LogLevel::Info => tracing::info!(line = self.line, "{}", message),
            LogLevel::Warn => tracing::warn!(line = self.line, "{}", message),
            LogLevel::Error => tracing::error!(line = self.line, "{}", message),
        }
        let _ = self.events.send(ExecutionEvent::Log {
            line: self.line,
            level,
            message,
        });
    }
}
