//! Mediated fetch: the only network primitive available to sandboxed code.
//!
//! Every call runs the same pipeline under `network_timeout_ms`: capability
//! validation (including DNS), rate check, request size check, then the HTTP
//! exchange with the response body streamed against `max_response_bytes`.

use crate::capability::{CapabilityPolicy, ValidatedUrl};
use crate::config::SandboxConfig;
use crate::error::{BodyDirection, NetworkError};
use crate::rate_limit::{RateDecision, RateLimiter};
use async_trait::async_trait;
use extbox_types::ExtensionDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }
}

/// A request as issued by a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Parses the guest's request: a JSON object, or a bare URL for a GET.
    pub fn from_script_bytes(raw: &[u8]) -> Result<Self, NetworkError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| NetworkError::InvalidRequest("request is not utf-8".into()))?
            .trim();
        if text.starts_with('{') {
            serde_json::from_str(text).map_err(|e| NetworkError::InvalidRequest(e.to_string()))
        } else if text.is_empty() {
            Err(NetworkError::InvalidRequest("empty request".into()))
        } else {
            Ok(Self::get(text))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// A validated request handed to the transport. The connection must go to
/// one of `addrs`, never to a fresh resolution of `host`.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub host: String,
    pub addrs: Vec<SocketAddr>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Streaming response body.
#[async_trait]
pub trait ResponseBody: Send {
    /// Next chunk, or `None` at end of body.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, NetworkError>;
}

pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub content_length: Option<u64>,
    pub body: Box<dyn ResponseBody>,
}

/// Performs one HTTP exchange. Redirects must not be followed.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, NetworkError>;
}

/// reqwest-backed transport that connects only to the validated addresses.
/// Redirects are not followed and proxy settings are ignored.
pub struct ReqwestTransport {
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            user_agent: format!("extbox/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct ReqwestBody(reqwest::Response);

#[async_trait]
impl ResponseBody for ReqwestBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, NetworkError> {
        self.0
            .chunk()
            .await
            .map(|c| c.map(|b| b.to_vec()))
            .map_err(|e| NetworkError::Transport(format!("read body: {e}")))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, NetworkError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            // A proxy would resolve the host again and bypass the pinned addresses.
            .no_proxy()
            .resolve_to_addrs(&request.host, &request.addrs)
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| NetworkError::Transport(format!("http client: {e}")))?;

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| NetworkError::InvalidRequest(e.to_string()))?;
        let mut builder = client.request(method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_builder() {
                NetworkError::InvalidRequest(e.to_string())
            } else {
                NetworkError::Transport(format!("fetch failed: {e}"))
            }
        })?;

        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        Ok(TransportResponse {
            status: resp.status().as_u16(),
            headers,
            content_length: resp.content_length(),
            body: Box::new(ReqwestBody(resp)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub network_timeout: Duration,
    pub max_request_bytes: u64,
    pub max_response_bytes: u64,
}

impl From<&SandboxConfig> for FetchLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            network_timeout: config.network_timeout(),
            max_request_bytes: config.max_request_bytes,
            max_response_bytes: config.max_response_bytes,
        }
    }
}

pub struct MediatedFetch {
    policy: Arc<CapabilityPolicy>,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn HttpTransport>,
    limits: FetchLimits,
}

impl MediatedFetch {
    pub fn new(
        policy: Arc<CapabilityPolicy>,
        limiter: Arc<RateLimiter>,
        transport: Arc<dyn HttpTransport>,
        limits: FetchLimits,
    ) -> Self {
        Self {
            policy,
            limiter,
            transport,
            limits,
        }
    }

    pub fn limits(&self) -> FetchLimits {
        self.limits
    }

    /// Performs `request` on behalf of the extension described by `descriptor`.
    pub async fn fetch(
        &self,
        descriptor: &ExtensionDescriptor,
        request: FetchRequest,
    ) -> Result<FetchResponse, NetworkError> {
        let timeout = self.limits.network_timeout;
        tokio::time::timeout(timeout, self.mediate(descriptor, request))
            .await
            .map_err(|_| NetworkError::Timeout(timeout.as_millis() as u64))?
    }

    async fn mediate(
        &self,
        descriptor: &ExtensionDescriptor,
        request: FetchRequest,
    ) -> Result<FetchResponse, NetworkError> {
        let ValidatedUrl { url, host, addrs } = self
            .policy
            .validate(
                &request.url,
                descriptor.network,
                descriptor.network_approved,
                &descriptor.allowlist,
            )
            .await?;

        if let RateDecision::Denied { retry_after } = self.limiter.check(descriptor.rate_key()) {
            return Err(NetworkError::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }

        let body = request.body.map(String::into_bytes).unwrap_or_default();
        if body.len() as u64 > self.limits.max_request_bytes {
            return Err(NetworkError::BodyTooLarge {
                direction: BodyDirection::Request,
                limit: self.limits.max_request_bytes,
            });
        }
        if request.headers.keys().any(|k| k.eq_ignore_ascii_case("host")) {
            return Err(NetworkError::InvalidRequest("host header cannot be overridden".into()));
        }

        debug!(
            tenant_id = %descriptor.tenant_id,
            extension_id = %descriptor.extension_id,
            method = request.method.as_str(),
            host = %host,
            "Mediated fetch"
        );

        let transport_request = TransportRequest {
            method: request.method,
            url,
            host,
            addrs,
            headers: request.headers,
            body,
        };
        self.exchange(transport_request).await
    }

    async fn exchange(&self, request: TransportRequest) -> Result<FetchResponse, NetworkError> {
        let limit = self.limits.max_response_bytes;
        let too_large = NetworkError::BodyTooLarge {
            direction: BodyDirection::Response,
            limit,
        };

        let mut resp = self.transport.send(request).await?;
        if resp.content_length.is_some_and(|len| len > limit) {
            return Err(too_large);
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp.body.next_chunk().await? {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(too_large);
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            status: resp.status,
            headers: resp.headers,
            body,
        })
    }
}
