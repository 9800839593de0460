//! Bridge used by the command-line runner.
//!
//! File requests go to the local file system. There is no browser behind
//! this bridge: browser commands fail, or are logged and accepted when the
//! runner is in dry-run mode.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use macroflow_core::bridge::{Bridge, BridgeRequest, BridgeResponse};

pub const NO_BROWSER: &str = "no browser attached";

pub struct LocalBridge {
    dry_run: bool,
    base_dir: Option<PathBuf>,
}

impl LocalBridge {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            base_dir: None,
        }
    }

    /// Relative paths resolve against `dir` instead of the working directory.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    async fn read_file(&self, path: &str) -> BridgeResponse {
        let full = self.resolve(path);
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => {
                debug!(path = %full.display(), bytes = content.len(), "read file");
                BridgeResponse::ok_with_data(content)
            }
            Err(e) => BridgeResponse::failure(format!("{}: {}", full.display(), e)),
        }
    }

    async fn write_file(&self, path: &str, content: &str, append: bool) -> BridgeResponse {
        let full = self.resolve(path);
        let result = async {
            if let Some(dir) = full.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&full)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                debug!(path = %full.display(), append, "wrote file");
                BridgeResponse::ok()
            }
            Err(e) => BridgeResponse::failure(format!("{}: {}", full.display(), e)),
        }
    }

    async fn delete_file(&self, path: &str) -> BridgeResponse {
        let full = self.resolve(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => BridgeResponse::ok(),
            Err(e) => BridgeResponse::failure(format!("{}: {}", full.display(), e)),
        }
    }
}

#[async_trait]
impl Bridge for LocalBridge {
    async fn send_message(&self, request: BridgeRequest) -> BridgeResponse {
        match request {
            BridgeRequest::ReadFile { path } => self.read_file(&path).await,
            BridgeRequest::WriteFile {
                path,
                content,
                append,
            } => self.write_file(&path, &content, append).await,
            BridgeRequest::DeleteFile { path } => self.delete_file(&path).await,
            BridgeRequest::Command {
                command,
                params,
                line,
            } => {
                if !self.dry_run {
                    return BridgeResponse::failure(NO_BROWSER);
                }
                info!(line, command = %command, ?params, "dry run");
                match (command.as_str(), params.get("GOTO")) {
                    ("URL", Some(url)) => BridgeResponse::ok_with_data(url.clone()),
                    _ => BridgeResponse::ok(),
                }
            }
        }
    }
}
