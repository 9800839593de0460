//! Boundary to the component that performs real browser and file I/O.
//!
//! The interpreter never touches a browser or the filesystem directly. Every
//! side effect travels as a [`BridgeRequest`] through an implementation of
//! [`Bridge`] and comes back as a [`BridgeResponse`]. Requests and responses
//! are plain serde types so a bridge can forward them over any channel.
//!
//! ```
//! use macroflow_core::bridge::{BridgeRequest, BridgeResponse};
//!
//! let req = BridgeRequest::ReadFile { path: "data.csv".to_string() };
//! let json = serde_json::to_string(&req).unwrap();
//! assert!(json.contains(r#""type":"ReadFile""#));
//!
//! let resp = BridgeResponse::ok_with_data("a,b");
//! assert!(resp.success);
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A request sent to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeRequest {
    /// Perform a browser command with its expanded parameters.
    Command {
        command: String,
        params: BTreeMap<String, String>,
        line: usize,
    },
    /// Read a whole text file.
    ReadFile { path: String },
    /// Write (or append to) a text file.
    WriteFile {
        path: String,
        content: String,
        #[serde(default)]
        append: bool,
    },
    DeleteFile { path: String },
}

impl BridgeRequest {
    /// Short label used in logs.
    pub fn label(&self) -> &str {
        match self {
            BridgeRequest::Command { command, .. } => command,
            BridgeRequest::ReadFile { .. } => "ReadFile",
            BridgeRequest::WriteFile { .. } => "WriteFile",
            BridgeRequest::DeleteFile { .. } => "DeleteFile",
        }
    }
}

/// The bridge's answer to a [`BridgeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl BridgeResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
        }
    }

    pub fn ok_with_data(data: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data.into()),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: None,
        }
    }

    /// The error text, or a generic message when the bridge gave none.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("bridge request failed")
    }
}

/// Something that can carry out [`BridgeRequest`]s.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn send_message(&self, request: BridgeRequest) -> BridgeResponse;
}

/// A bridge that rejects every request. Used when none is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBridge;

#[async_trait]
impl Bridge for NoBridge {
    async fn send_message(&self, request: BridgeRequest) -> BridgeResponse {
        BridgeResponse::failure(format!("no bridge attached for {}", request.label()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_tagged_by_type() {
        let req = BridgeRequest::Command {
            command: "URL".to_string(),
            params: BTreeMap::from([("GOTO".to_string(), "https://example.com".to_string())]),
            line: 3,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], "Command");
        assert_eq!(value["command"], "URL");
        assert_eq!(value["params"]["GOTO"], "https://example.com");
        assert_eq!(value["line"], 3);
    }

    #[test]
    fn write_file_append_defaults_false() {
        let req: BridgeRequest =
            serde_json::from_str(r#"{"type":"WriteFile","path":"out.txt","content":"x"}"#).unwrap();
        assert_eq!(
            req,
            BridgeRequest::WriteFile {
                path: "out.txt".to_string(),
                content: "x".to_string(),
                append: false
            }
        );
    }

    #[test]
    fn response_omits_empty_fields() {
        let json = serde_json::to_string(&BridgeResponse::ok()).unwrap();
        assert_eq!(json, r#"{"success":true}"#);
        let resp: BridgeResponse = serde_json::from_str(r#"{"success":false}"#).unwrap();
        assert_eq!(resp.error_message(), "bridge request failed");
    }

    #[tokio::test]
    async fn no_bridge_fails_everything() {
        let resp = NoBridge
            .send_message(BridgeRequest::DeleteFile { path: "x".to_string() })
            .await;
        assert!(!resp.success);
        assert!(resp.error_message().contains("DeleteFile"));
    }
}
