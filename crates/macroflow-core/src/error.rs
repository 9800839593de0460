//! Error taxonomy for macro execution.
//!
//! Two kinds of errors live here:
//!
//! - [`ErrorCode`] is the closed, wire-stable taxonomy reported by command
//!   handlers and carried in run results and serialized state.
//! - [`MacroError`] and its per-layer companions are ordinary Rust errors
//!   returned by library operations (loading state, parsing data files, ...).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datasource::DatasourceError;
use crate::state::Status;

/// Result codes reported by commands and by the dispatch loop.
///
/// Serialized as the upper-case name (e.g. `"UNSUPPORTED_COMMAND"`); the names
/// and the numeric values from [`ErrorCode::code`] are both stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[default]
    Ok,
    SyntaxError,
    MissingParameter,
    InvalidParameter,
    ElementNotFound,
    Timeout,
    FrameError,
    DownloadError,
    FileError,
    FileNotFound,
    FileAccessDenied,
    FileWriteError,
    ScriptError,
    DatasourceError,
    DatasourceEnd,
    LoopLimit,
    UserAbort,
    UnsupportedCommand,
    UnknownError,
}

impl ErrorCode {
    /// Every code, in declaration order.
    pub const ALL: [ErrorCode; 19] = [
        ErrorCode::Ok,
        ErrorCode::SyntaxError,
        ErrorCode::MissingParameter,
        ErrorCode::InvalidParameter,
        ErrorCode::ElementNotFound,
        ErrorCode::Timeout,
        ErrorCode::FrameError,
        ErrorCode::DownloadError,
        ErrorCode::FileError,
        ErrorCode::FileNotFound,
        ErrorCode::FileAccessDenied,
        ErrorCode::FileWriteError,
        ErrorCode::ScriptError,
        ErrorCode::DatasourceError,
        ErrorCode::DatasourceEnd,
        ErrorCode::LoopLimit,
        ErrorCode::UserAbort,
        ErrorCode::UnsupportedCommand,
        ErrorCode::UnknownError,
    ];

    /// Numeric value of the code. `0` for [`ErrorCode::Ok`], negative otherwise.
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::UserAbort => -100,
            ErrorCode::SyntaxError => -910,
            ErrorCode::MissingParameter => -911,
            ErrorCode::InvalidParameter => -912,
            ErrorCode::UnsupportedCommand => -915,
            ErrorCode::ElementNotFound => -921,
            ErrorCode::FrameError => -922,
            ErrorCode::Timeout => -930,
            ErrorCode::DownloadError => -950,
            ErrorCode::FileError => -960,
            ErrorCode::FileNotFound => -961,
            ErrorCode::FileAccessDenied => -962,
            ErrorCode::FileWriteError => -963,
            ErrorCode::ScriptError => -970,
            ErrorCode::DatasourceError => -980,
            ErrorCode::DatasourceEnd => -981,
            ErrorCode::LoopLimit => -990,
            ErrorCode::UnknownError => -999,
        }
    }

    /// Upper-case name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::SyntaxError => "SYNTAX_ERROR",
            ErrorCode::MissingParameter => "MISSING_PARAMETER",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::ElementNotFound => "ELEMENT_NOT_FOUND",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::FrameError => "FRAME_ERROR",
            ErrorCode::DownloadError => "DOWNLOAD_ERROR",
            ErrorCode::FileError => "FILE_ERROR",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::FileAccessDenied => "FILE_ACCESS_DENIED",
            ErrorCode::FileWriteError => "FILE_WRITE_ERROR",
            ErrorCode::ScriptError => "SCRIPT_ERROR",
            ErrorCode::DatasourceError => "DATASOURCE_ERROR",
            ErrorCode::DatasourceEnd => "DATASOURCE_END",
            ErrorCode::LoopLimit => "LOOP_LIMIT",
            ErrorCode::UserAbort => "USER_ABORT",
            ErrorCode::UnsupportedCommand => "UNSUPPORTED_COMMAND",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == ErrorCode::Ok
    }

    /// Looks a code up by its wire name (case-insensitive).
    pub fn from_name(name: &str) -> Option<ErrorCode> {
        let upper = name.trim().to_ascii_uppercase();
        Self::ALL.iter().copied().find(|c| c.as_str() == upper)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state-machine transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("cannot {action} while {from}")]
    InvalidTransition { from: Status, action: &'static str },

    #[error("line {line} is outside 0..={total}")]
    LineOutOfRange { line: usize, total: usize },

    #[error("no snapshot matches '{0}'")]
    SnapshotNotFound(String),
}

/// Errors returned by library-level operations.
#[derive(Error, Debug)]
pub enum MacroError {
    /// The macro text did not parse. Carries the first error.
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Datasource error: {0}")]
    Datasource(#[from] DatasourceError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted state document failed validation.
    #[error("Invalid serialized state: {0}")]
    InvalidState(String),

    #[error("Unsupported state version {0}")]
    UnsupportedVersion(u32),
}

impl MacroError {
    /// The taxonomy code closest to this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            MacroError::Parse { .. } => ErrorCode::SyntaxError,
            MacroError::Datasource(DatasourceError::EndOfData { .. }) => ErrorCode::DatasourceEnd,
            MacroError::Datasource(_) => ErrorCode::DatasourceError,
            MacroError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ErrorCode::FileNotFound
            }
            MacroError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorCode::FileAccessDenied
            }
            MacroError::Io(_) => ErrorCode::FileError,
            MacroError::State(_)
            | MacroError::Serialization(_)
            | MacroError::InvalidState(_)
            | MacroError::UnsupportedVersion(_) => ErrorCode::UnknownError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_as_upper_snake_names() {
        let json = serde_json::to_string(&ErrorCode::UnsupportedCommand).unwrap();
        assert_eq!(json, "\"UNSUPPORTED_COMMAND\"");
        let back: ErrorCode = serde_json::from_str("\"LOOP_LIMIT\"").unwrap();
        assert_eq!(back, ErrorCode::LoopLimit);
    }

    #[test]
    fn as_str_matches_serde_name() {
        for code in ErrorCode::ALL {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json.trim_matches('"'), code.as_str());
        }
    }

    #[test]
    fn numeric_codes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::ALL {
            assert!(seen.insert(code.code()), "duplicate numeric code for {}", code);
        }
        assert_eq!(ErrorCode::Ok.code(), 0);
    }

    #[test]
    fn from_name_is_case_insensitive() {
        assert_eq!(ErrorCode::from_name("timeout"), Some(ErrorCode::Timeout));
        assert_eq!(ErrorCode::from_name("nope"), None);
    }

    #[test]
    fn io_errors_map_to_file_codes() {
        let err = MacroError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "x"));
        assert_eq!(err.error_code(), ErrorCode::FileNotFound);
        let err = MacroError::from(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "x"));
        assert_eq!(err.error_code(), ErrorCode::FileAccessDenied);
    }
}
