//! Provider HTTP adapter: typed JSON REST client for deSEC-style DNS APIs.
//!
//! One [`ProviderApi`] exists per configured provider. Throttling (HTTP 429)
//! is not handled here; the rate-limited op manager reads the hold hint via
//! [`retry_hold`] and owns the retry loop.

use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::{ProviderConfig, TlsConfig};
use crate::error::{EnsembleError, Result};

/// How the API key is presented to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthScheme {
    /// `X-API-Key: <key>` header.
    #[serde(rename = "X-API-Key")]
    XApiKey,
    /// `Authorization: token <key>` header (deSEC style).
    #[default]
    #[serde(rename = "Authorization")]
    Token,
    /// No authentication header at all.
    #[serde(rename = "none")]
    None,
}

/// Hold to apply when a 429 carries no usable hint.
pub const DEFAULT_THROTTLE_HOLD: Duration = Duration::from_secs(10);

/// HTTP request timeout for provider calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A provider API response, body included.
#[derive(Debug)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Raw response body.
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// True for any 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True when the provider is throttling us.
    pub fn is_throttled(&self) -> bool {
        self.status == 429
    }

    /// Body as lossy UTF-8, for error detail.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Convert a non-2xx response into the API error for the caller.
    pub fn into_api_error(self) -> EnsembleError {
        EnsembleError::Api {
            status: self.status,
            detail: self.body_text(),
        }
    }
}

/// The RRset representation shared by the supported provider APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRrset {
    /// Owner relative to the zone apex; empty string at the apex.
    pub subname: String,
    /// Record type mnemonic.
    #[serde(rename = "type")]
    pub rrtype: String,
    /// RRset TTL.
    pub ttl: u32,
    /// Record data in presentation format; empty deletes the RRset.
    pub records: Vec<String>,
}

/// deSEC error body shape.
#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    detail: String,
}

/// Extract the throttle hold from a 429 response.
///
/// Prefers the `Retry-After` header; falls back to the first integer in the
/// JSON error detail (deSEC phrasing: `"Request was throttled. Expected
/// available in <N> second."`). Returns `None` when neither parses.
pub fn retry_hold(response: &ApiResponse) -> Option<Duration> {
    if let Some(value) = response.headers.get(RETRY_AFTER) {
        if let Some(secs) = value.to_str().ok().and_then(|s| s.trim().parse::<u64>().ok()) {
            return Some(Duration::from_secs(secs));
        }
    }

    let body: ProviderErrorBody = serde_json::from_slice(&response.body).ok()?;
    let digits: String = body
        .detail
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok().map(Duration::from_secs)
}

/// A single HTTPS client for one provider.
#[derive(Debug, Clone)]
pub struct ProviderApi {
    name: String,
    base_url: String,
    api_key: String,
    scheme: AuthScheme,
    client: reqwest::Client,
}

impl ProviderApi {
    /// Build the client for one configured provider, with TLS trust from the
    /// operator-supplied root bundle or explicitly disabled.
    pub fn new(name: &str, config: &ProviderConfig, tls: &TlsConfig) -> Result<Self> {
        let base_url = if config.address.starts_with("http://")
            || config.address.starts_with("https://")
        {
            format!("{}{}", config.address, config.baseurl)
        } else {
            format!("https://{}{}", config.address, config.baseurl)
        };

        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if tls.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        } else if let Some(path) = &tls.root_ca_pem {
            let pem = std::fs::read(path).map_err(|e| {
                EnsembleError::Config(format!("reading root CA {} failed: {e}", path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                EnsembleError::Config(format!("parsing root CA {} failed: {e}", path.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            name: name.to_string(),
            base_url,
            api_key: config.api_key.clone(),
            scheme: config.auth_scheme,
            client: builder.build()?,
        })
    }

    /// Provider name, for logs and metrics labels.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// GET an endpoint under the base URL.
    pub async fn get(&self, endpoint: &str) -> Result<ApiResponse> {
        self.request(Method::GET, endpoint, None).await
    }

    /// POST a JSON body.
    pub async fn post(&self, endpoint: &str, body: &serde_json::Value) -> Result<ApiResponse> {
        self.request(Method::POST, endpoint, Some(body)).await
    }

    /// PUT a JSON body.
    pub async fn put(&self, endpoint: &str, body: &serde_json::Value) -> Result<ApiResponse> {
        self.request(Method::PUT, endpoint, Some(body)).await
    }

    /// DELETE an endpoint.
    pub async fn delete(&self, endpoint: &str) -> Result<ApiResponse> {
        self.request(Method::DELETE, endpoint, None).await
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse> {
        let url = format!("{}{endpoint}", self.base_url);
        debug!(provider = %self.name, %method, %url, "provider API request");

        let mut req = self
            .client
            .request(method, &url)
            .header(CONTENT_TYPE, "application/json");
        req = match self.scheme {
            AuthScheme::XApiKey => req.header("X-API-Key", &self.api_key),
            AuthScheme::Token => req.header("Authorization", format!("token {}", self.api_key)),
            AuthScheme::None => req,
        };
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

/// Owner name relative to the zone apex, as provider APIs want it.
pub fn subname(owner: &str, zone: &str) -> String {
    let owner = owner.trim_end_matches('.');
    let zone = zone.trim_end_matches('.');
    if owner == zone {
        String::new()
    } else {
        owner
            .strip_suffix(zone)
            .map(|s| s.trim_end_matches('.').to_string())
            .unwrap_or_else(|| owner.to_string())
    }
}
