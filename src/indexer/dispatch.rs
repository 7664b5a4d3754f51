// SPDX-License-Identifier: Apache-2.0

//! HTTP dispatch to the cluster.
//!
//! Owns a keep-alive pooled hyper client shared by bulk submissions, the
//! health probe, and template sync. Each bulk request picks a server at
//! random from the configured list and POSTs the batch as NDJSON.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const POOL_MAX_IDLE_PER_HOST: usize = 3;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned {0}")]
    Status(StatusCode),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
}

/// What a successful bulk response reported.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BulkSummary {
    pub took_ms: u64,
    /// Items acknowledged by the cluster.
    pub indexed: u64,
    /// Items that carried a per-item error inside the 2xx response.
    pub item_errors: u64,
}

pub struct Dispatcher {
    client: HyperClient<HttpConnector, Full<Bytes>>,
    servers: Vec<String>,
    /// Configured timeout plus one second of client-side overhead allowance.
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(servers: Vec<String>, timeout_secs: u64) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(timeout_secs)));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .timer(TokioTimer::new())
            .build(connector);

        Self {
            client,
            servers,
            request_timeout: Duration::from_secs(timeout_secs + 1),
        }
    }

    fn pick_server(&self) -> &str {
        let idx = rand::thread_rng().gen_range(0..self.servers.len());
        &self.servers[idx]
    }

    /// Submit one batch to `/_bulk`. Transport failures, timeouts, and
    /// non-2xx statuses are all dispatch errors; a 2xx with an undecodable
    /// body still counts as delivered.
    pub async fn send_bulk(&self, body: Bytes) -> Result<BulkSummary, DispatchError> {
        let server = self.pick_server();
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{server}/_bulk"))
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(Full::new(body))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| DispatchError::Timeout(self.request_timeout))?
            .map_err(|err| DispatchError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status(status));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| DispatchError::Transport(err.to_string()))?
            .to_bytes();

        Ok(parse_bulk_response(&body))
    }

    /// Probe `/_cluster/health`. Any 2xx means the cluster is reachable.
    pub async fn cluster_healthy(&self) -> bool {
        let server = self.pick_server();
        let request = match Request::builder()
            .method(Method::GET)
            .uri(format!("http://{server}/_cluster/health"))
            .body(Full::new(Bytes::new()))
        {
            Ok(req) => req,
            Err(_) => return false,
        };

        match tokio::time::timeout(self.request_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }

    /// Push configured index templates that are missing from the cluster or
    /// differ from the configured spec. Failures are logged and retried at
    /// the next startup; they never block ingestion.
    pub async fn sync_templates(&self, templates: &BTreeMap<String, Value>) {
        for (name, spec) in templates {
            match self.fetch_template(name).await {
                Ok(Some(existing)) if &existing == spec => {
                    debug!(template = name, "template up to date");
                }
                Ok(_) => {
                    if let Err(err) = self.put_template(name, spec).await {
                        warn!(template = name, %err, "template push failed");
                    } else {
                        info!(template = name, "template pushed");
                    }
                }
                Err(err) => {
                    warn!(template = name, %err, "template fetch failed");
                }
            }
        }
    }

    async fn fetch_template(&self, name: &str) -> Result<Option<Value>, DispatchError> {
        let server = self.pick_server();
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("http://{server}/_template/{name}"))
            .body(Full::new(Bytes::new()))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| DispatchError::Timeout(self.request_timeout))?
            .map_err(|err| DispatchError::Transport(err.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DispatchError::Status(response.status()));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| DispatchError::Transport(err.to_string()))?
            .to_bytes();

        // The fetch returns a map of template name to spec.
        let parsed: Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        Ok(parsed.get(name).cloned())
    }

    async fn put_template(&self, name: &str, spec: &Value) -> Result<(), DispatchError> {
        let server = self.pick_server();
        let body = serde_json::to_vec(spec).unwrap_or_default();
        let request = Request::builder()
            .method(Method::PUT)
            .uri(format!("http://{server}/_template/{name}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| DispatchError::Timeout(self.request_timeout))?
            .map_err(|err| DispatchError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(DispatchError::Status(response.status()));
        }
        Ok(())
    }
}

/// Interpret a 2xx bulk response body shaped `{ took, errors, items: [...] }`.
/// Anything else yields an empty summary; the batch is still delivered.
fn parse_bulk_response(body: &[u8]) -> BulkSummary {
    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        return BulkSummary::default();
    };
    let Some(items) = parsed.get("items").and_then(Value::as_array) else {
        return BulkSummary::default();
    };

    let item_errors = items
        .iter()
        .filter(|item| {
            item.get("create")
                .and_then(|action| action.get("error"))
                .is_some()
        })
        .count() as u64;

    BulkSummary {
        took_ms: parsed.get("took").and_then(Value::as_u64).unwrap_or(0),
        indexed: items.len() as u64,
        item_errors,
    }
}
