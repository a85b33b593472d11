//! The `custom_http` tool: outbound REST calls for agents whose playbook
//! integrates a tenant-specific service.
//!
//! Parameters: `{"url": "...", "method": "GET|POST|PUT|DELETE|PATCH",
//! "headers": {..}, "query": {..}, "body": {..}}`. Only `url` is required;
//! the method defaults to GET. The response is
//! `{"status": u16, "body": <json or string>}`.
//!
//! Requests to domains outside the allowlist (when one is configured) fail
//! permanently without leaving the process. Upstream 5xx and transport
//! errors are transient; the broker retries them for GET only.

use crate::domainflow::broker::{ToolContext, ToolError, ToolProvider};
use crate::domainflow::types::ToolName;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

pub struct CustomHttpProvider {
    client: Client,
    allowed_domains: Vec<String>,
}

impl CustomHttpProvider {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            allowed_domains: Vec::new(),
        }
    }

    /// Restrict requests to the given domain (builder pattern). With no
    /// allowlist configured, every domain is reachable.
    pub fn allow_domain(mut self, domain: impl Into<String>) -> Self {
        self.allowed_domains.push(domain.into());
        self
    }

    fn check_domain(&self, url: &reqwest::Url) -> Result<(), ToolError> {
        if self.allowed_domains.is_empty() {
            return Ok(());
        }
        let host = url
            .host_str()
            .ok_or_else(|| ToolError::Permanent("url has no host".to_string()))?;
        if self.allowed_domains.iter().any(|d| d == host) {
            Ok(())
        } else {
            Err(ToolError::Permanent(format!(
                "domain '{}' is not in the allowlist",
                host
            )))
        }
    }
}

impl Default for CustomHttpProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProvider for CustomHttpProvider {
    fn tool(&self) -> ToolName {
        ToolName::CustomHttp
    }

    async fn invoke(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let url_str = params
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| ToolError::Permanent("missing 'url' parameter".to_string()))?;
        let url = reqwest::Url::parse(url_str)
            .map_err(|e| ToolError::Permanent(format!("invalid url: {}", e)))?;
        self.check_domain(&url)?;

        let method = params
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ToolError::Permanent(format!("unsupported method '{}'", method)))?;

        let mut request = self.client.request(method, url);
        if let Some(headers) = params.get("headers").and_then(|h| h.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(query) = params.get("query").and_then(|q| q.as_object()) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = params.get("body") {
            if !body.is_null() {
                request = request.json(body);
            }
        }

        let response = request.send().await.map_err(|e| {
            // Transport failures are worth retrying; the broker decides.
            ToolError::Transient(format!("request failed: {}", e))
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Transient(format!("read body failed: {}", e)))?;
        if body.len() > MAX_RESPONSE_BYTES {
            return Err(ToolError::Permanent(format!(
                "response of {} bytes exceeds the {} byte limit",
                body.len(),
                MAX_RESPONSE_BYTES
            )));
        }

        if status.is_server_error() {
            return Err(ToolError::Transient(format!(
                "upstream returned {}",
                status.as_u16()
            )));
        }

        let parsed = serde_json::from_str::<serde_json::Value>(&body)
            .unwrap_or(serde_json::Value::String(body));
        Ok(serde_json::json!({
            "status": status.as_u16(),
            "body": parsed,
        }))
    }
}
