//! Execution state of a single macro run.
//!
//! [`ExecutionState`] records where a run is (line and loop), what it is
//! doing ([`Status`]), how it failed, what it extracted, how long it has been
//! running, and a bounded history of [`Snapshot`]s for stepping back.
//!
//! # Lifecycle
//!
//! ```text
//! idle --start--> running --complete--> completed
//!                  |   ^
//!            pause |   | resume
//!                  v   |
//!                 paused
//!
//! running/paused --abort--> aborted   (error code forced to USER_ABORT)
//! any --set_error(code != OK)--> error --clear_error--> paused
//! ```
//!
//! Elapsed time only accrues while `running`. The clock is
//! [`tokio::time::Instant`], so it follows a paused test runtime.
//!
//! # Persistence
//!
//! [`ExecutionState::serialize`] produces a versioned [`SerializedState`]
//! (camelCase JSON) that survives a host restart; [`ExecutionState::deserialize`]
//! validates and restores it.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorCode, MacroError, StateError};
use crate::variables::Variables;

/// Version written into every [`SerializedState`].
pub const STATE_VERSION: u32 = 1;

/// Default number of snapshots kept before the oldest is evicted.
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 100;

/// Separator used by [`ExecutionState::extract_string`].
pub const EXTRACT_SEPARATOR: &str = "[EXTRACT]";

/// Fields a persisted state document must carry.
pub const REQUIRED_FIELDS: [&str; 6] = [
    "version",
    "currentLine",
    "loopCounter",
    "status",
    "lastUpdateTime",
    "extractData",
];

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Aborted,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Error => "error",
            Status::Aborted => "aborted",
        }
    }

    /// A run in this status will not execute further commands.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Error | Status::Aborted)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named checkpoint of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub line: usize,
    pub loop_counter: u32,
    pub status: Status,
    pub error_code: ErrorCode,
    /// Copy of every variable at capture time.
    pub variables: BTreeMap<String, String>,
}

/// Persisted form of an [`ExecutionState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedState {
    pub version: u32,
    #[serde(default)]
    pub macro_name: String,
    pub current_line: usize,
    #[serde(default)]
    pub total_lines: Option<usize>,
    pub loop_counter: u32,
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    pub status: Status,
    #[serde(default)]
    pub error_code: ErrorCode,
    #[serde(default)]
    pub error_message: Option<String>,
    pub extract_data: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    #[serde(default = "default_snapshot_capacity")]
    pub snapshot_capacity: usize,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    pub last_update_time: DateTime<Utc>,
}

fn default_max_loops() -> u32 {
    1
}

fn default_snapshot_capacity() -> usize {
    DEFAULT_SNAPSHOT_CAPACITY
}

/// Checks that a JSON document has the shape of a [`SerializedState`].
///
/// Only presence and basic JSON types of the required fields are checked;
/// [`ExecutionState::deserialize`] does the full decoding.
pub fn is_serialized_state(value: &serde_json::Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    if !REQUIRED_FIELDS.iter().all(|f| obj.contains_key(*f)) {
        return false;
    }
    obj["version"].is_u64()
        && obj["currentLine"].is_u64()
        && obj["loopCounter"].is_u64()
        && obj["status"].is_string()
        && obj["lastUpdateTime"].is_string()
        && obj["extractData"].is_array()
}

/// Mutable state of one macro run.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    macro_name: String,
    current_line: usize,
    total_lines: usize,
    loop_counter: u32,
    max_loops: u32,
    status: Status,
    error_code: ErrorCode,
    error_message: Option<String>,
    extract_data: Vec<String>,
    variables: Variables,
    snapshots: VecDeque<Snapshot>,
    snapshot_capacity: usize,
    accumulated: Duration,
    running_since: Option<Instant>,
    start_time: Option<DateTime<Utc>>,
    last_update_time: DateTime<Utc>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new("", 0)
    }
}

impl ExecutionState {
    /// Creates an idle state for a macro with `total_lines` lines.
    pub fn new(macro_name: impl Into<String>, total_lines: usize) -> Self {
        Self {
            macro_name: macro_name.into(),
            current_line: 0,
            total_lines,
            loop_counter: 1,
            max_loops: 1,
            status: Status::Idle,
            error_code: ErrorCode::Ok,
            error_message: None,
            extract_data: Vec::new(),
            variables: Variables::new(),
            snapshots: VecDeque::new(),
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            accumulated: Duration::ZERO,
            running_since: None,
            start_time: None,
            last_update_time: Utc::now(),
        }
    }

    /// Sets how many snapshots are kept. Excess snapshots are evicted oldest first.
    pub fn with_snapshot_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_capacity = capacity;
        self.trim_snapshots();
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn macro_name(&self) -> &str {
        &self.macro_name
    }

    pub fn current_line(&self) -> usize {
        self.current_line
    }

    pub fn total_lines(&self) -> usize {
        self.total_lines
    }

    /// Re-targets the state at a macro of `total` lines, e.g. after loading a
    /// persisted run against freshly parsed source.
    pub fn set_total_lines(&mut self, total: usize) -> Result<(), StateError> {
        if self.current_line > total {
            return Err(StateError::LineOutOfRange {
                line: self.current_line,
                total,
            });
        }
        self.total_lines = total;
        Ok(())
    }

    pub fn loop_counter(&self) -> u32 {
        self.loop_counter
    }

    pub fn max_loops(&self) -> u32 {
        self.max_loops
    }

    /// Sets the loop ceiling (at least 1).
    pub fn set_max_loops(&mut self, max_loops: u32) {
        self.max_loops = max_loops.max(1);
        self.touch();
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn error_code(&self) -> ErrorCode {
        self.error_code
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn last_update_time(&self) -> DateTime<Utc> {
        self.last_update_time
    }

    /// Time spent running, excluding paused intervals.
    pub fn elapsed(&self) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + since.elapsed(),
            None => self.accumulated,
        }
    }

    /// `true` only while running with no error set.
    pub fn can_continue(&self) -> bool {
        self.status == Status::Running && self.error_code.is_ok()
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    pub fn start(&mut self) -> Result<(), StateError> {
        self.expect_status(&[Status::Idle], "start")?;
        self.current_line = if self.total_lines > 0 { 1 } else { 0 };
        self.start_time = Some(Utc::now());
        self.variables.set("!LOOP", self.loop_counter.to_string());
        self.set_status(Status::Running);
        info!(macro_name = %self.macro_name, lines = self.total_lines, "run started");
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), StateError> {
        self.expect_status(&[Status::Running], "pause")?;
        self.set_status(Status::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), StateError> {
        self.expect_status(&[Status::Paused], "resume")?;
        self.set_status(Status::Running);
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), StateError> {
        self.expect_status(&[Status::Running], "complete")?;
        self.set_status(Status::Completed);
        info!(
            macro_name = %self.macro_name,
            loops = self.loop_counter,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "run completed"
        );
        Ok(())
    }

    /// Stops the run and records [`ErrorCode::UserAbort`].
    pub fn abort(&mut self) -> Result<(), StateError> {
        self.expect_status(&[Status::Running, Status::Paused], "abort")?;
        self.error_code = ErrorCode::UserAbort;
        self.error_message = Some("Execution aborted by user".to_string());
        self.set_status(Status::Aborted);
        info!(macro_name = %self.macro_name, line = self.current_line, "run aborted");
        Ok(())
    }

    /// Records an error and moves to [`Status::Error`]. Setting
    /// [`ErrorCode::Ok`] does nothing; use [`clear_error`](Self::clear_error).
    pub fn set_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        if code.is_ok() {
            return;
        }
        let message = message.into();
        debug!(code = %code, line = self.current_line, %message, "error set");
        self.error_code = code;
        self.error_message = Some(message);
        self.set_status(Status::Error);
    }

    /// Clears the error and leaves the run paused, ready to resume.
    pub fn clear_error(&mut self) -> Result<(), StateError> {
        self.expect_status(&[Status::Error], "clear error")?;
        self.error_code = ErrorCode::Ok;
        self.error_message = None;
        self.set_status(Status::Paused);
        Ok(())
    }

    fn expect_status(&self, allowed: &[Status], action: &'static str) -> Result<(), StateError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(StateError::InvalidTransition {
                from: self.status,
                action,
            })
        }
    }

    /// Changes status and starts/stops the elapsed clock accordingly.
    fn set_status(&mut self, next: Status) {
        let was_running = self.status == Status::Running;
        let now_running = next == Status::Running;
        if was_running && !now_running {
            if let Some(since) = self.running_since.take() {
                self.accumulated += since.elapsed();
            }
        } else if !was_running && now_running {
            self.running_since = Some(Instant::now());
        }
        self.status = next;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_update_time = Utc::now();
    }

    // ------------------------------------------------------------------
    // Position
    // ------------------------------------------------------------------

    /// Moves to the next line. Returns `false` (and stays put) on the last line.
    pub fn advance_line(&mut self) -> bool {
        if self.current_line < self.total_lines {
            self.current_line += 1;
            self.touch();
            true
        } else {
            false
        }
    }

    /// Moves to an arbitrary line in `0..=total_lines`.
    pub fn jump_to_line(&mut self, line: usize) -> Result<(), StateError> {
        if line > self.total_lines {
            return Err(StateError::LineOutOfRange {
                line,
                total: self.total_lines,
            });
        }
        self.current_line = line;
        self.touch();
        Ok(())
    }

    /// Rewinds to line 0 for another pass. Variables and the loop counter are kept.
    pub fn reset_for_loop(&mut self) {
        self.current_line = 0;
        self.touch();
    }

    /// Bumps the loop counter and mirrors it into `!LOOP`.
    pub fn increment_loop(&mut self) {
        self.set_loop_counter(self.loop_counter.saturating_add(1));
    }

    pub fn set_loop_counter(&mut self, counter: u32) {
        self.loop_counter = counter;
        self.variables.set("!LOOP", counter.to_string());
        self.touch();
    }

    pub fn is_loop_limit_reached(&self) -> bool {
        self.loop_counter > self.max_loops
    }

    /// Whether the current pass is the last one allowed.
    pub fn is_last_loop(&self) -> bool {
        self.loop_counter >= self.max_loops
    }

    // ------------------------------------------------------------------
    // Extract buffer
    // ------------------------------------------------------------------

    pub fn add_extract(&mut self, value: impl Into<String>) {
        self.extract_data.push(value.into());
        self.touch();
    }

    pub fn extract_data(&self) -> &[String] {
        &self.extract_data
    }

    /// The extract buffer joined with [`EXTRACT_SEPARATOR`].
    pub fn extract_string(&self) -> String {
        self.extract_data.join(EXTRACT_SEPARATOR)
    }

    pub fn clear_extract(&mut self) {
        self.extract_data.clear();
        self.touch();
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Captures the current position, status and variables.
    ///
    /// Returns the new snapshot's id. When the history is full the oldest
    /// snapshot is dropped.
    pub fn create_snapshot(&mut self, note: Option<&str>) -> Uuid {
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            note: note.map(str::to_string),
            created_at: Utc::now(),
            line: self.current_line,
            loop_counter: self.loop_counter,
            status: self.status,
            error_code: self.error_code,
            variables: self.variables.snapshot(),
        };
        let id = snapshot.id;
        self.snapshots.push_back(snapshot);
        self.trim_snapshots();
        id
    }

    fn trim_snapshots(&mut self) {
        while self.snapshots.len() > self.snapshot_capacity {
            self.snapshots.pop_front();
        }
    }

    /// Snapshots, oldest first.
    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn snapshot_capacity(&self) -> usize {
        self.snapshot_capacity
    }

    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    /// Reinstates line, loop, status, error code and variables from `snapshot`.
    ///
    /// The error message is not part of a snapshot and is cleared.
    pub fn restore_from_snapshot(&mut self, snapshot: &Snapshot) {
        self.current_line = snapshot.line.min(self.total_lines);
        self.loop_counter = snapshot.loop_counter;
        self.variables.restore(&snapshot.variables);
        self.error_code = snapshot.error_code;
        self.error_message = None;
        self.set_status(snapshot.status);
        debug!(id = %snapshot.id, line = self.current_line, "restored snapshot");
    }

    /// Restores the snapshot with the given id.
    pub fn restore_snapshot(&mut self, id: Uuid) -> Result<(), StateError> {
        let snapshot = self
            .snapshots
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| StateError::SnapshotNotFound(id.to_string()))?;
        self.restore_from_snapshot(&snapshot);
        Ok(())
    }

    /// Restores the `index`-th snapshot, counting from the oldest kept.
    pub fn restore_snapshot_at(&mut self, index: usize) -> Result<(), StateError> {
        let snapshot = self
            .snapshots
            .get(index)
            .cloned()
            .ok_or_else(|| StateError::SnapshotNotFound(format!("#{}", index)))?;
        self.restore_from_snapshot(&snapshot);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn serialize(&self) -> SerializedState {
        SerializedState {
            version: STATE_VERSION,
            macro_name: self.macro_name.clone(),
            current_line: self.current_line,
            total_lines: Some(self.total_lines),
            loop_counter: self.loop_counter,
            max_loops: self.max_loops,
            status: self.status,
            error_code: self.error_code,
            error_message: self.error_message.clone(),
            extract_data: self.extract_data.clone(),
            variables: self.variables.snapshot(),
            elapsed_ms: self.elapsed().as_millis() as u64,
            snapshots: self.snapshots.iter().cloned().collect(),
            snapshot_capacity: self.snapshot_capacity,
            start_time: self.start_time,
            last_update_time: self.last_update_time,
        }
    }

    /// Rebuilds a state from its persisted form.
    ///
    /// A `running` state resumes accruing time from now.
    pub fn deserialize(data: SerializedState) -> Result<Self, MacroError> {
        if data.version > STATE_VERSION {
            return Err(MacroError::UnsupportedVersion(data.version));
        }
        let total_lines = data.total_lines.unwrap_or(data.current_line);
        if data.current_line > total_lines {
            return Err(MacroError::InvalidState(format!(
                "currentLine {} exceeds totalLines {}",
                data.current_line, total_lines
            )));
        }
        if data.loop_counter == 0 {
            return Err(MacroError::InvalidState("loopCounter must be at least 1".to_string()));
        }
        let code_matches_status = match data.status {
            Status::Error => !data.error_code.is_ok(),
            Status::Aborted => data.error_code == ErrorCode::UserAbort,
            _ => data.error_code.is_ok(),
        };
        if !code_matches_status {
            return Err(MacroError::InvalidState(format!(
                "status {} does not match errorCode {}",
                data.status.as_str(),
                data.error_code
            )));
        }

        let mut variables = Variables::empty();
        variables.restore(&data.variables);

        let mut snapshots: VecDeque<Snapshot> = data.snapshots.into_iter().collect();
        while snapshots.len() > data.snapshot_capacity {
            snapshots.pop_front();
        }

        Ok(Self {
            macro_name: data.macro_name,
            current_line: data.current_line,
            total_lines,
            loop_counter: data.loop_counter,
            max_loops: data.max_loops.max(1),
            status: data.status,
            error_code: data.error_code,
            error_message: data.error_message,
            extract_data: data.extract_data,
            variables,
            snapshots,
            snapshot_capacity: data.snapshot_capacity,
            accumulated: Duration::from_millis(data.elapsed_ms),
            running_since: (data.status == Status::Running).then(Instant::now),
            start_time: data.start_time,
            last_update_time: data.last_update_time,
        })
    }

    pub fn to_json(&self) -> Result<String, MacroError> {
        Ok(serde_json::to_string_pretty(&self.serialize())?)
    }

    /// Parses and validates a persisted state document.
    pub fn from_json(json: &str) -> Result<Self, MacroError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if !is_serialized_state(&value) {
            return Err(MacroError::InvalidState(format!(
                "missing or mistyped required fields (need {})",
                REQUIRED_FIELDS.join(", ")
            )));
        }
        let data: SerializedState = serde_json::from_value(value)?;
        Self::deserialize(data)
    }
}
