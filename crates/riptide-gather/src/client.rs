//! The upstream cloud client.
//!
//! `CloudClient` executes plain `Request` descriptions (from
//! riptide-plan) and returns plain `Response`s — it is the single seam
//! between the engine and the outside world. `HttpCloudClient` is the
//! real implementation; tests substitute their own.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use tracing::{debug, warn};

use riptide_plan::steps::{Request, Response, Service};

use crate::error::ClientError;

/// Executes upstream requests. Implementations must be safe to share
/// across concurrently executing steps.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn execute(&self, request: &Request) -> Result<Response, ClientError>;
}

/// Base URLs for the upstream services, plus the auth token sent with
/// every request.
#[derive(Debug, Clone)]
pub struct CloudEndpoints {
    pub compute: String,
    pub clb: String,
    pub pool: String,
    pub orchestration: String,
    pub auth_token: String,
}

impl CloudEndpoints {
    fn base(&self, service: Service) -> &str {
        match service {
            Service::Compute => &self.compute,
            Service::Clb => &self.clb,
            Service::Pool => &self.pool,
            Service::Orchestration => &self.orchestration,
        }
    }
}

/// HTTP implementation of `CloudClient` on hyper's pooled legacy client.
pub struct HttpCloudClient {
    endpoints: CloudEndpoints,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpCloudClient {
    pub fn new(endpoints: CloudEndpoints) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { endpoints, client }
    }
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn execute(&self, request: &Request) -> Result<Response, ClientError> {
        let uri = format!(
            "{}/{}",
            self.endpoints.base(request.service).trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );

        let body = match &request.body {
            Some(value) => serde_json::to_vec(value)
                .map_err(|e| ClientError::Request(e.to_string()))?,
            None => Vec::new(),
        };

        let req = http::Request::builder()
            .method(request.method.as_str())
            .uri(&uri)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .header("x-auth-token", &self.endpoints.auth_token)
            .header("user-agent", "riptide/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ClientError::Request(e.to_string()))?;

        debug!(method = %request.method, %uri, "upstream request");

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let status = response.status().as_u16();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Body(e.to_string()))?
            .to_bytes();

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                // Upstream sometimes sends non-JSON error pages; keep the
                // text so interpretation can still see it.
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };

        Ok(Response { status, body })
    }
}

/// Retry a gather-phase call with bounded exponential backoff: transient
/// failures (connect errors, 5xx, rate limits) double the interval up to
/// the attempt budget; anything else returns immediately.
pub async fn retry_with_backoff<F, Fut>(
    attempts: u32,
    base: Duration,
    mut call: F,
) -> Result<Response, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Response, ClientError>>,
{
    let mut interval = base;
    let mut last_err: Option<ClientError> = None;

    for attempt in 1..=attempts {
        match call().await {
            Ok(response) if response.status >= 500 || response.status == 429 => {
                warn!(status = response.status, attempt, "transient upstream status");
                last_err = Some(ClientError::Status {
                    status: response.status,
                    message: response.body.to_string(),
                });
            }
            Ok(response) => return Ok(response),
            Err(e @ ClientError::Connect(_)) => {
                warn!(error = %e, attempt, "upstream connect failure");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
            interval *= 2;
        }
    }

    Err(last_err.unwrap_or_else(|| ClientError::Request("no attempts made".to_string())))
}
