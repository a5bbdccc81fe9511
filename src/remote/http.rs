//! Shared HTTP plumbing for the build triggers

use crate::core::{config::RemoteConfig, OrchestratorError};
use crate::remote::ToolType;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;

const USER_AGENT: &str = concat!("pipeline-orchestrator/", env!("CARGO_PKG_VERSION"));

/// Connection settings common to every tool
#[derive(Debug, Clone)]
pub struct RemoteClient {
    pub tool: ToolType,
    pub client: Client,
    /// Endpoint without a trailing slash
    pub endpoint: String,
    pub token: Option<String>,
}

impl RemoteClient {
    pub fn new(tool: ToolType, config: &RemoteConfig) -> Result<Self, OrchestratorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| OrchestratorError::remote(tool.as_str(), format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            tool,
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    pub fn error(&self, message: impl Into<String>) -> OrchestratorError {
        OrchestratorError::remote(self.tool.as_str(), message)
    }

    /// Send a request, turning transport errors and non-2xx replies into dispatch errors
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, OrchestratorError> {
        let response = request
            .send()
            .await
            .map_err(|e| self.error(format!("request failed: {}", e)))?;

        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(self.error(format!("{} responded {}: {}", self.tool, status, truncate(&body, 200))))
    }

    pub async fn json(&self, request: RequestBuilder) -> Result<Value, OrchestratorError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| self.error(format!("invalid JSON response: {}", e)))
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Percent-encode a path segment such as a GitLab project path
pub fn encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}
