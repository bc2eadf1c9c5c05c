//! Integration clients.
//!
//! Clients report failures as [`RawError`] values so the healing engine can
//! classify them; they never classify themselves.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use self_healing::{ConnectionInfo, RawError};
use tracing::debug;

/// One call against an integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationRequest {
    pub execution_id: String,
    pub task_id: String,
    pub tool_id: String,
    /// Integration-specific action (`send_message`, `list_rows`, ...)
    pub operation: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub connection: Option<ConnectionInfo>,
}

#[async_trait]
pub trait IntegrationClient: Send + Sync {
    async fn execute(&self, request: &IntegrationRequest) -> Result<Value, RawError>;

    /// Cheap reachability probe used during integration setup
    async fn health_check(&self) -> Result<(), RawError> {
        Ok(())
    }
}

/// Clients keyed by tool id
#[derive(Default)]
pub struct IntegrationRegistry {
    clients: RwLock<HashMap<String, Arc<dyn IntegrationClient>>>,
}

impl std::fmt::Debug for IntegrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationRegistry")
            .field("tools", &self.tool_ids())
            .finish()
    }
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Into<String>>(&self, tool_id: S, client: Arc<dyn IntegrationClient>) {
        let tool_id = tool_id.into();
        debug!(tool_id = %tool_id, "Registered integration client");
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tool_id, client);
    }

    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn IntegrationClient>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool_id)
            .cloned()
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tool_id)
    }

    pub fn tool_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// JSON-over-HTTP integration: `POST {base_url}/{operation}` with the
/// params as body.
pub struct HttpIntegrationClient {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    health_path: String,
}

impl HttpIntegrationClient {
    pub fn new<S: Into<String>>(base_url: S, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
            health_path: "health".to_string(),
        })
    }

    pub fn bearer_token<S: Into<String>>(mut self, token: S) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn health_path<S: Into<String>>(mut self, path: S) -> Self {
        self.health_path = path.into().trim_start_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn into_result(response: reqwest::Response) -> Result<Value, RawError> {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let body = response.text().await.map_err(transport_error)?;
        let parsed: Value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).unwrap_or_else(|_| Value::String(body.clone()))
        };

        if status.is_success() {
            return Ok(parsed);
        }

        let mut payload = match parsed {
            Value::Object(map) => Value::Object(map),
            Value::Null => json!({ "message": status.canonical_reason().unwrap_or("request failed") }),
            other => json!({ "message": other }),
        };
        if let Value::Object(map) = &mut payload {
            map.insert("status".to_string(), Value::from(status.as_u16()));
            if let Some(seconds) = retry_after {
                map.insert("retryAfter".to_string(), Value::from(seconds));
            }
        }
        Err(RawError::Payload(payload))
    }
}

fn transport_error(err: reqwest::Error) -> RawError {
    if err.is_timeout() {
        RawError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        RawError::Connection(err.to_string())
    } else {
        RawError::Message(err.to_string())
    }
}

#[async_trait]
impl IntegrationClient for HttpIntegrationClient {
    async fn execute(&self, request: &IntegrationRequest) -> Result<Value, RawError> {
        let mut builder = self.client.post(self.url(&request.operation)).json(&request.params);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(transport_error)?;
        Self::into_result(response).await
    }

    async fn health_check(&self) -> Result<(), RawError> {
        let response = self
            .client
            .get(self.url(&self.health_path))
            .send()
            .await
            .map_err(transport_error)?;
        Self::into_result(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl IntegrationClient for Echo {
        async fn execute(&self, request: &IntegrationRequest) -> Result<Value, RawError> {
            Ok(request.params.clone())
        }
    }

    #[tokio::test]
    async fn registry_resolves_clients() {
        let registry = IntegrationRegistry::new();
        registry.register("echo", Arc::new(Echo));

        assert!(registry.contains("echo"));
        assert!(registry.get("slack").is_none());

        let client = registry.get("echo").unwrap();
        let request = IntegrationRequest {
            execution_id: "e".into(),
            task_id: "t".into(),
            tool_id: "echo".into(),
            operation: "ping".into(),
            params: json!({"x": 1}),
            connection: None,
        };
        assert_eq!(client.execute(&request).await.unwrap(), json!({"x": 1}));
        assert!(client.health_check().await.is_ok());
    }

    #[test]
    fn http_client_normalizes_urls() {
        let client = HttpIntegrationClient::new("https://api.example.com/", Duration::from_secs(5))
            .unwrap()
            .health_path("/status");
        assert_eq!(client.url("send_message"), "https://api.example.com/send_message");
        assert_eq!(client.url(&client.health_path), "https://api.example.com/status");
    }
}
