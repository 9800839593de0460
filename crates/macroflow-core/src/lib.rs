//! # macroflow-core
//!
//! Interpreter core for line-oriented browser automation macros.
//!
//! A macro is plain text, one command per line:
//!
//! ```text
//! VERSION BUILD=1
//! SET !DATASOURCE people.csv
//! SET !DATASOURCE_LINE {{!LOOP}}
//! URL GOTO=https://example.com/search?q={{!COL1}}
//! TAG POS=1 TYPE=SPAN ATTR=CLASS:result EXTRACT=TXT
//! ```
//!
//! This crate parses such macros, expands `{{name}}` variables, drives
//! datasource-backed loops and dispatches each command to a handler. Anything
//! that touches a real browser or file goes through the [`bridge::Bridge`]
//! trait supplied by the embedding application.
//!
//! ## Modules
//!
//! - [`parser`] / [`command`] - Macro text to [`command::ParsedScript`]
//! - [`variables`] - Case-insensitive variable store and `{{name}}` expansion
//! - [`datasource`] - CSV loading and the row pointer behind `!COLn`
//! - [`state`] - Run status, position, snapshots and persistence
//! - [`handler`] / [`builtins`] - The handler contract and built-in commands
//! - [`executor`] - The dispatch loop ([`executor::MacroExecutor`])
//! - [`events`] - Run events broadcast to observers
//! - [`config`] - Persistent defaults in `~/.macroflow/config.json`
//!
//! ## Example
//!
//! ```
//! use macroflow_core::executor::{run_macro, ExecutorConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let source = "SET !VAR1 hello\nSET !EXTRACT {{!VAR1}}";
//! let result = run_macro(source, ExecutorConfig::default()).await;
//! assert!(result.success);
//! assert_eq!(result.extract, "hello");
//! # }
//! ```

pub mod bridge;
pub mod builtins;
pub mod command;
pub mod config;
pub mod datasource;
pub mod error;
pub mod events;
pub mod executor;
pub mod handler;
pub mod parser;
pub mod state;
pub mod variables;

pub use error::{ErrorCode, MacroError};
pub use executor::{MacroExecutor, RunResult};
