//! External message queue client.
//!
//! [`MessageQueue`] is the reserve / batch-delete / post surface the `imq`
//! bridge endpoints need. [`IronMqClient`] implements it over the IronMQ v3
//! HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors returned by message queue clients.
#[derive(Debug, Error)]
pub enum MqError {
    #[error("Invalid message queue options: {0}")]
    InvalidOptions(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Message queue API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),
}

/// A message reserved from a queue; deleting it needs both ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedMessage {
    pub id: String,
    pub body: String,
    #[serde(default)]
    pub reservation_id: String,
    #[serde(default)]
    pub reserved_count: u32,
}

/// Reserve/acknowledge/post operations of an external message queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Reserve up to `n` messages for `timeout`.
    async fn reserve(
        &self,
        queue: &str,
        n: u32,
        timeout: Duration,
    ) -> Result<Vec<ReservedMessage>, MqError>;

    /// Delete reserved messages in one request.
    async fn delete_reserved(
        &self,
        queue: &str,
        messages: &[ReservedMessage],
    ) -> Result<(), MqError>;

    async fn post(&self, queue: &str, body: String) -> Result<(), MqError>;
}

/// Options of the `kued/providers/imq` provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IronMqOptions {
    pub token: String,
    pub project_id: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

fn default_host() -> String {
    "mq-aws-us-east-1-1.iron.io".to_string()
}

fn default_protocol() -> String {
    "https".to_string()
}

fn check_credential(field: &str, value: &str) -> Result<(), MqError> {
    if value.len() < 10 || !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(MqError::InvalidOptions(format!(
            "\"{}\" must be alphanumeric and at least 10 characters long",
            field
        )));
    }
    Ok(())
}

impl IronMqOptions {
    pub fn new(token: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            project_id: project_id.into(),
            host: default_host(),
            protocol: default_protocol(),
            port: None,
        }
    }

    pub fn validate(&self) -> Result<(), MqError> {
        check_credential("token", &self.token)?;
        check_credential("project_id", &self.project_id)?;
        if !matches!(self.protocol.as_str(), "http" | "https") {
            return Err(MqError::InvalidOptions(format!(
                "unsupported protocol '{}'",
                self.protocol
            )));
        }
        Ok(())
    }

    /// Base URL of the project, e.g. `https://host/3/projects/<id>`.
    pub fn project_url(&self) -> String {
        match self.port {
            Some(port) => format!(
                "{}://{}:{}/3/projects/{}",
                self.protocol, self.host, port, self.project_id
            ),
            None => format!(
                "{}://{}/3/projects/{}",
                self.protocol, self.host, self.project_id
            ),
        }
    }
}

#[derive(Debug, Serialize)]
struct ReserveRequest {
    n: u32,
    timeout: u64,
    wait: u32,
}

#[derive(Debug, Deserialize)]
struct ReserveResponse {
    #[serde(default)]
    messages: Vec<ReservedMessage>,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    ids: Vec<DeleteId<'a>>,
}

#[derive(Debug, Serialize)]
struct DeleteId<'a> {
    id: &'a str,
    reservation_id: &'a str,
}

#[derive(Debug, Serialize)]
struct PostRequest {
    messages: Vec<PostMessage>,
}

#[derive(Debug, Serialize)]
struct PostMessage {
    body: String,
}

/// IronMQ v3 HTTP client.
pub struct IronMqClient {
    options: IronMqOptions,
    http_client: Client,
}

impl IronMqClient {
    pub fn new(options: IronMqOptions) -> Result<Self, MqError> {
        options.validate()?;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MqError::RequestFailed(e.to_string()))?;

        Ok(Self {
            options,
            http_client,
        })
    }

    pub fn options(&self) -> &IronMqOptions {
        &self.options
    }

    fn queue_url(&self, queue: &str, path: &str) -> String {
        format!("{}/queues/{}/{}", self.options.project_url(), queue, path)
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response, MqError> {
        let response = self
            .http_client
            .request(method, url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("OAuth {}", self.options.token))
            .json(body)
            .send()
            .await
            .map_err(|e| MqError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(MqError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl MessageQueue for IronMqClient {
    async fn reserve(
        &self,
        queue: &str,
        n: u32,
        timeout: Duration,
    ) -> Result<Vec<ReservedMessage>, MqError> {
        let url = self.queue_url(queue, "reservations");
        let request = ReserveRequest {
            n,
            timeout: timeout.as_secs().max(1),
            wait: 0,
        };

        let response: ReserveResponse = self
            .send(reqwest::Method::POST, &url, &request)
            .await?
            .json()
            .await
            .map_err(|e| MqError::Parse(e.to_string()))?;

        debug!(queue = %queue, count = response.messages.len(), "Reserved messages");
        Ok(response.messages)
    }

    async fn delete_reserved(
        &self,
        queue: &str,
        messages: &[ReservedMessage],
    ) -> Result<(), MqError> {
        if messages.is_empty() {
            return Ok(());
        }

        let url = self.queue_url(queue, "messages");
        let request = DeleteRequest {
            ids: messages
                .iter()
                .map(|m| DeleteId {
                    id: &m.id,
                    reservation_id: &m.reservation_id,
                })
                .collect(),
        };

        self.send(reqwest::Method::DELETE, &url, &request).await?;
        Ok(())
    }

    async fn post(&self, queue: &str, body: String) -> Result<(), MqError> {
        let url = self.queue_url(queue, "messages");
        let request = PostRequest {
            messages: vec![PostMessage { body }],
        };

        self.send(reqwest::Method::POST, &url, &request).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    /// In-memory message queue recording every call.
    #[derive(Default)]
    pub struct StubMessageQueue {
        pub pending: Mutex<HashMap<String, Vec<ReservedMessage>>>,
        pub deleted: Mutex<Vec<(String, Vec<String>)>>,
        pub posted: Mutex<Vec<(String, String)>>,
        pub failing_posts: Mutex<HashSet<String>>,
    }

    impl StubMessageQueue {
        pub fn with_messages(queue: &str, bodies: &[&str]) -> Self {
            let stub = Self::default();
            let messages = bodies
                .iter()
                .enumerate()
                .map(|(i, body)| ReservedMessage {
                    id: format!("{}", i + 1),
                    body: body.to_string(),
                    reservation_id: format!("r{}", i + 1),
                    reserved_count: 1,
                })
                .collect();
            stub.pending
                .lock()
                .expect("lock")
                .insert(queue.to_string(), messages);
            stub
        }

        pub fn deleted_ids(&self) -> Vec<String> {
            self.deleted
                .lock()
                .expect("lock")
                .iter()
                .flat_map(|(_, ids)| ids.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MessageQueue for StubMessageQueue {
        async fn reserve(
            &self,
            queue: &str,
            n: u32,
            _timeout: Duration,
        ) -> Result<Vec<ReservedMessage>, MqError> {
            let mut pending = self.pending.lock().expect("lock");
            let messages = pending.entry(queue.to_string()).or_default();
            let take = messages.len().min(n as usize);
            Ok(messages.drain(..take).collect())
        }

        async fn delete_reserved(
            &self,
            queue: &str,
            messages: &[ReservedMessage],
        ) -> Result<(), MqError> {
            self.deleted.lock().expect("lock").push((
                queue.to_string(),
                messages.iter().map(|m| m.reservation_id.clone()).collect(),
            ));
            Ok(())
        }

        async fn post(&self, queue: &str, body: String) -> Result<(), MqError> {
            if self.failing_posts.lock().expect("lock").contains(queue) {
                return Err(MqError::Api {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            self.posted
                .lock()
                .expect("lock")
                .push((queue.to_string(), body));
            Ok(())
        }
    }
}
