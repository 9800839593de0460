//! Shared test helpers for macroflow-core integration tests.
//!
//! Provides a programmable mock bridge and a handler that records every line
//! it is asked to run.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use macroflow_core::bridge::{Bridge, BridgeRequest, BridgeResponse};
use macroflow_core::executor::{ExecutorConfig, MacroExecutor};
use macroflow_core::handler::{CommandContext, CommandHandler, CommandResult};

// ---------------------------------------------------------------------------
// Programmable mock bridge
// ---------------------------------------------------------------------------

/// What the mock does with the next request for a command.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Answer immediately.
    Respond(BridgeResponse),
    /// Answer after a delay.
    Delay(Duration, BridgeResponse),
}

/// A bridge with scripted answers per command name and an in-memory file system.
#[derive(Default)]
pub struct MockBridge {
    scripted: Mutex<HashMap<String, VecDeque<MockBehavior>>>,
    files: Mutex<HashMap<String, String>>,
    requests: Mutex<Vec<BridgeRequest>>,
}

impl MockBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a behavior for the next `command` request. Unscripted commands succeed.
    pub fn script(&self, command: &str, behavior: MockBehavior) {
        self.scripted
            .lock()
            .unwrap()
            .entry(command.to_ascii_uppercase())
            .or_default()
            .push_back(behavior);
    }

    pub fn add_file(&self, path: &str, content: &str) {
        self.files.lock().unwrap().insert(path.to_string(), content.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn requests(&self) -> Vec<BridgeRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Names of the browser commands received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                BridgeRequest::Command { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Bridge for MockBridge {
    async fn send_message(&self, request: BridgeRequest) -> BridgeResponse {
        self.requests.lock().unwrap().push(request.clone());
        match request {
            BridgeRequest::Command { command, .. } => {
                let next = self
                    .scripted
                    .lock()
                    .unwrap()
                    .get_mut(&command)
                    .and_then(|q| q.pop_front());
                match next {
                    Some(MockBehavior::Respond(resp)) => resp,
                    Some(MockBehavior::Delay(delay, resp)) => {
                        tokio::time::sleep(delay).await;
                        resp
                    }
                    None => BridgeResponse::ok(),
                }
            }
            BridgeRequest::ReadFile { path } => match self.file(&path) {
                Some(content) => BridgeResponse::ok_with_data(content),
                None => BridgeResponse::failure(format!("file not found: {}", path)),
            },
            BridgeRequest::WriteFile { path, content, append } => {
                let mut files = self.files.lock().unwrap();
                let entry = files.entry(path).or_default();
                if !append {
                    entry.clear();
                }
                entry.push_str(&content);
                BridgeResponse::ok()
            }
            BridgeRequest::DeleteFile { path } => match self.files.lock().unwrap().remove(&path) {
                Some(_) => BridgeResponse::ok(),
                None => BridgeResponse::failure(format!("file not found: {}", path)),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Recording handler
// ---------------------------------------------------------------------------

/// Records `(line, loop)` for every call and returns a fixed result.
pub struct RecordingHandler {
    calls: Arc<Mutex<Vec<(usize, u32)>>>,
    result: CommandResult,
}

impl RecordingHandler {
    pub fn new(result: CommandResult) -> (Self, Arc<Mutex<Vec<(usize, u32)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                calls: Arc::clone(&calls),
                result,
            },
            calls,
        )
    }
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> CommandResult {
        self.calls.lock().unwrap().push((ctx.line(), ctx.loop_counter()));
        self.result.clone()
    }
}

// ---------------------------------------------------------------------------
// Executor helpers
// ---------------------------------------------------------------------------

/// An executor wired to `bridge` with every browser command routed to it.
pub fn bridged_executor(bridge: Arc<MockBridge>, config: ExecutorConfig) -> MacroExecutor {
    let mut executor = MacroExecutor::new(config).with_bridge(bridge);
    executor.register_bridge_commands();
    executor
}

pub fn loops(max_loops: u32) -> ExecutorConfig {
    ExecutorConfig {
        max_loops,
        ..Default::default()
    }
}
