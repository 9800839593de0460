//! Persistent engine configuration.
//!
//! Stores user defaults in `~/.macroflow/config.json`: loop count, error
//! handling, timeouts and the folders that relative file names resolve
//! against. Command-line flags override these values.
//!
//! # Example
//!
//! ```no_run
//! use macroflow_core::config::EngineConfig;
//!
//! // Load (returns defaults if the file doesn't exist)
//! let config = EngineConfig::load();
//! let executor_config = config.executor_config("demo");
//! assert!(executor_config.max_loops >= 1);
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::executor::ExecutorConfig;
use crate::state::DEFAULT_SNAPSHOT_CAPACITY;

const CONFIG_FILENAME: &str = "config.json";

/// Returns the engine directory (`~/.macroflow/`), falling back to
/// `./.macroflow` when no home directory is known.
pub fn engine_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".macroflow")
}

/// Default location of the config file.
pub fn config_path() -> PathBuf {
    engine_dir().join(CONFIG_FILENAME)
}

/// Persistent engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of passes over a macro.
    pub max_loops: u32,
    /// Initial value of `!ERRORIGNORE`.
    pub error_ignore: bool,
    pub snapshot_capacity: usize,
    /// Take a snapshot before every executed line.
    pub snapshot_every_line: bool,
    /// Initial value of `!TIMEOUT_STEP`, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<f64>,
    /// Initial value of `!REPLAYSPEED` (`FAST`, `MEDIUM` or `SLOW`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_datasource: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_download: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_macros: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loops: 1,
            error_ignore: false,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            snapshot_every_line: false,
            step_timeout_secs: None,
            replay_speed: None,
            folder_datasource: None,
            folder_download: None,
            folder_macros: None,
        }
    }
}

impl EngineConfig {
    /// Load config from `~/.macroflow/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    /// Load config from an explicit path, with the same fallback as [`load`](Self::load).
    pub fn load_from(path: &Path) -> Self {
        let Ok(text) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable config");
                Self::default()
            }
        }
    }

    /// Save config to `~/.macroflow/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let path = config_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }

    /// System variables seeded into every run.
    pub fn seed_variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        if let Some(secs) = self.step_timeout_secs {
            vars.insert("!TIMEOUT_STEP".to_string(), secs.to_string());
        }
        if let Some(ref speed) = self.replay_speed {
            vars.insert("!REPLAYSPEED".to_string(), speed.to_uppercase());
        }
        let folders = [
            ("!FOLDER_DATASOURCE", &self.folder_datasource),
            ("!FOLDER_DOWNLOAD", &self.folder_download),
            ("!FOLDER_MACROS", &self.folder_macros),
        ];
        for (name, folder) in folders {
            if let Some(dir) = folder {
                vars.insert(name.to_string(), dir.display().to_string());
            }
        }
        vars
    }

    /// Builds the executor settings for a run of `macro_name`.
    pub fn executor_config(&self, macro_name: &str) -> ExecutorConfig {
        ExecutorConfig {
            macro_name: macro_name.to_string(),
            max_loops: self.max_loops.max(1),
            error_ignore: self.error_ignore,
            snapshot_capacity: self.snapshot_capacity,
            snapshot_every_line: self.snapshot_every_line,
            variables: self.seed_variables(),
            ..ExecutorConfig::default()
        }
    }
}
