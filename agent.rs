//! Remote agent client.
//!
//! Files on a user-mounted custom drive are only reachable through the
//! companion agent's HTTP API. Every call carries the `path` query parameter
//! and, when configured, a bearer token.
//!
//! ## Failure policy
//!
//! - Connection failures, timeouts and non-2xx answers are all
//!   [`AgentError::Unavailable`], never "not found".
//! - Metadata calls use the short timeout; whole-file transfers the long one.
//! - Nothing is retried, and nothing falls back to local file access.

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::s3_client::{streaming_body, BodyFailure};
use crate::storage::{BlobStream, BoxReader};
use futures::TryStreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// One entry of a directory listing or a `stat` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub size: u64,
    /// Modification time as reported by the agent (RFC 3339)
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub kind: ChangeKind,
    pub path: String,
}

/// Answer to one long-poll `watch` call. Pass `cursor` to the next call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchBatch {
    #[serde(default)]
    pub events: Vec<AgentEvent>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    metadata_timeout: Duration,
    transfer_timeout: Duration,
}

impl AgentClient {
    pub fn new(cfg: &AgentConfig) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .connect_timeout(cfg.metadata_timeout())
            .build()
            .map_err(|e| AgentError::unavailable(format!("building agent http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            metadata_timeout: cfg.metadata_timeout(),
            transfer_timeout: cfg.transfer_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, endpoint: &str, timeout: Duration) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}/{}", self.base_url, endpoint))
            .timeout(timeout);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, op: &str, builder: RequestBuilder) -> Result<Response, AgentError> {
        let response = builder.send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                format!("{} timed out", op)
            } else {
                format!("{} failed: {}", op, e)
            };
            warn!(base_url = %self.base_url, reason = %reason, "agent call failed");
            AgentError::unavailable(reason)
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(base_url = %self.base_url, op, status = %status, "agent rejected call");
            return Err(AgentError::unavailable(format!("{} returned {}", op, status)));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, op: &str, path: &str) -> Result<T, AgentError> {
        let builder = self
            .request(Method::GET, op, self.metadata_timeout)
            .query(&[("path", path)]);
        decode_json(op, self.send(op, builder).await?).await
    }

    async fn post_path(&self, op: &str, query: &[(&str, &str)]) -> Result<(), AgentError> {
        let builder = self
            .request(Method::POST, op, self.metadata_timeout)
            .query(query);
        self.send(op, builder).await?;
        Ok(())
    }

    /// Plain `GET /health`; anything but 200 counts as unavailable.
    pub async fn health(&self) -> Result<(), AgentError> {
        let builder = self.request(Method::GET, "health", self.metadata_timeout);
        let response = self.send("health", builder).await?;
        if response.status() != StatusCode::OK {
            return Err(AgentError::unavailable(format!(
                "health returned {}",
                response.status()
            )));
        }
        debug!(base_url = %self.base_url, "agent healthy");
        Ok(())
    }

    pub async fn list(&self, path: &str) -> Result<Vec<AgentEntry>, AgentError> {
        self.get_json("list", path).await
    }

    pub async fn stat(&self, path: &str) -> Result<AgentEntry, AgentError> {
        self.get_json("stat", path).await
    }

    pub async fn usage(&self, path: &str) -> Result<AgentUsage, AgentError> {
        self.get_json("usage", path).await
    }

    /// Open a file for streaming. The agent's health is checked first so an
    /// offline agent fails fast on the short timeout.
    ///
    /// A failure while the body is streaming surfaces as an `io::Error`
    /// carrying [`AgentError::Unavailable`].
    pub async fn open_read(&self, path: &str) -> Result<BlobStream, AgentError> {
        self.health().await?;

        let builder = self
            .request(Method::GET, "read", self.transfer_timeout)
            .query(&[("path", path)]);
        let response = self.send("read", builder).await?;
        let len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        let body = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| AgentError::unavailable(format!("read body: {}", e)).into_io()),
        );
        debug!(path = %path, bytes = ?len, "agent read opened");
        Ok(BlobStream::new(Box::new(StreamReader::new(body)), len))
    }

    /// Upload `source` to `path`.
    pub async fn write(
        &self,
        path: &str,
        source: BoxReader,
        known_length: Option<u64>,
    ) -> Result<(), AgentError> {
        let failure = BodyFailure::default();
        let mut builder = self
            .request(Method::POST, "write", self.transfer_timeout)
            .query(&[("path", path)])
            .body(streaming_body(source, failure.clone()));
        if let Some(len) = known_length {
            builder = builder.header(CONTENT_LENGTH, len);
        }

        let sent = self.send("write", builder).await;
        if let Some(source_error) = failure.lock().take() {
            return Err(AgentError::unavailable(format!(
                "write aborted by source: {}",
                source_error
            )));
        }
        sent?;
        debug!(path = %path, "agent write complete");
        Ok(())
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), AgentError> {
        self.post_path("mkdir", &[("path", path)]).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), AgentError> {
        let builder = self
            .request(Method::DELETE, "delete", self.metadata_timeout)
            .query(&[("path", path)]);
        self.send("delete", builder).await?;
        Ok(())
    }

    pub async fn rename(&self, path: &str, to: &str) -> Result<(), AgentError> {
        self.post_path("rename", &[("path", path), ("to", to)]).await
    }

    /// Long-poll for changes under `path`. Returns when the agent reports
    /// events or its own poll window closes.
    pub async fn watch(&self, path: &str, cursor: Option<&str>) -> Result<WatchBatch, AgentError> {
        let mut query = vec![("path", path)];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let builder = self
            .request(Method::GET, "watch", self.transfer_timeout)
            .query(&query);
        decode_json("watch", self.send("watch", builder).await?).await
    }
}

async fn decode_json<T: DeserializeOwned>(op: &str, response: Response) -> Result<T, AgentError> {
    let body = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            AgentError::unavailable(format!("{} timed out", op))
        } else {
            AgentError::unavailable(format!("{} body: {}", op, e))
        }
    })?;
    serde_json::from_slice(&body)
        .map_err(|e| AgentError::InvalidResponse(format!("{}: {}", op, e)))
}
