//! MCP wire transport: JSON request/response over HTTP.
//!
//! The trait is the seam for tests; production uses `HttpMcpTransport`.

use crate::error::{McpError, McpResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[async_trait::async_trait]
pub trait McpTransport: Send + Sync {
    /// Invoke a tool. Returns the result value, a tool-tagged error, or a
    /// transport error.
    async fn call_tool(&self, endpoint: &str, tool: &str, args: &Value) -> McpResult<Value>;

    /// Cheap liveness probe.
    async fn health(&self, endpoint: &str) -> McpResult<()>;
}

#[derive(Serialize)]
struct InvokeRequest<'a> {
    tool: &'a str,
    arguments: &'a Value,
}

#[derive(Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    kind: String,
    message: String,
}

pub struct HttpMcpTransport {
    client: reqwest::Client,
    health_client: reqwest::Client,
}

impl HttpMcpTransport {
    pub fn new(dispatch_timeout: Duration, health_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(dispatch_timeout)
            .build()
            .unwrap_or_default();
        let health_client = reqwest::Client::builder()
            .timeout(health_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            health_client,
        }
    }
}

#[async_trait::async_trait]
impl McpTransport for HttpMcpTransport {
    async fn call_tool(&self, endpoint: &str, tool: &str, args: &Value) -> McpResult<Value> {
        let url = format!("{}/invoke", endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&InvokeRequest {
                tool,
                arguments: args,
            })
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!("{status}: {body}")));
        }

        let parsed: InvokeResponse = response
            .json()
            .await
            .map_err(|e| McpError::Transport(format!("malformed response: {e}")))?;

        if let Some(err) = parsed.error {
            // "user" errors (bad arguments) are the caller's fault and must
            // not trip the breaker.
            let server_fault = err.kind != "user";
            return Err(McpError::tool_error(err.message, server_fault));
        }
        parsed
            .result
            .ok_or_else(|| McpError::Transport("response carried neither result nor error".into()))
    }

    async fn health(&self, endpoint: &str) -> McpResult<()> {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let response = self
            .health_client
            .get(&url)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(McpError::Transport(format!(
                "health returned {}",
                response.status()
            )))
        }
    }
}
