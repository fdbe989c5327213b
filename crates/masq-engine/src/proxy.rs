//! Proxy client: forwards a normalized request to an origin and captures the
//! response.
//!
//! The forwarded request carries method, path, query, headers, and body
//! verbatim (byte-for-byte for binary bodies), with the `Host` header
//! rewritten to the target authority. The captured response carries the
//! wall-clock round-trip time as proxy-timing metadata; responses whose
//! content-type falls in a binary media family are captured as base64 text
//! with the binary flag set.

use crate::error::EngineError;
use crate::request::{BodyMode, NormalizedRequest, NormalizedResponse};
use base64::Engine as _;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Shared HTTP client for proxy requests.
static HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn shared_client() -> &'static reqwest::Client {
    HTTP_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            // Stale pooled connections surface as spurious proxy failures.
            .pool_max_idle_per_host(0)
            // Forwarding is the engine's own concern; ambient proxy settings
            // must not intercept it.
            .no_proxy()
            .build()
            .expect("failed to build HTTP client")
    })
}

/// Content-type prefixes captured as base64 binary rather than text. The
/// exact boundary is a starting default, not a closed list.
const DEFAULT_BINARY_MEDIA_TYPES: &[&str] =
    &["image/", "audio/", "video/", "application/octet-stream"];

/// Per-call proxy options, passed through from the proxy definition.
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    /// Extra headers set on the forwarded request.
    pub inject_headers: HashMap<String, String>,
    /// Round-trip timeout; the engine enforces none when unset.
    pub timeout_ms: Option<u64>,
}

/// Forwards requests to proxy origins over HTTP(S).
pub struct ProxyClient {
    binary_media_types: Vec<String>,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyClient {
    pub fn new() -> Self {
        Self {
            binary_media_types: DEFAULT_BINARY_MEDIA_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Override the binary-capture content-type list.
    pub fn with_binary_media_types(mut self, types: Vec<String>) -> Self {
        self.binary_media_types = types;
        self
    }

    /// True when a content-type belongs to a binary media family.
    pub fn is_binary_media_type(&self, content_type: &str) -> bool {
        let content_type = content_type.to_ascii_lowercase();
        self.binary_media_types
            .iter()
            .any(|prefix| content_type.starts_with(prefix.as_str()))
    }

    /// Forward `request` to `target` and capture the origin's response.
    /// Never blocks the calling thread; suspends only on network I/O.
    pub async fn to(
        &self,
        target: &str,
        request: &NormalizedRequest,
        options: &ProxyOptions,
    ) -> Result<NormalizedResponse, EngineError> {
        let mut url = reqwest::Url::parse(target).map_err(|_| EngineError::InvalidProxy {
            message: format!("Unable to connect to \"{target}\""),
        })?;
        if !url.has_host() {
            return Err(EngineError::InvalidProxy {
                message: format!("Unable to connect to \"{target}\""),
            });
        }

        url.set_path(&request.path);
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
        }

        self.check_resolvable(&url, target).await?;

        let method = request
            .method
            .as_deref()
            .and_then(|m| reqwest::Method::from_bytes(m.to_uppercase().as_bytes()).ok())
            .unwrap_or(reqwest::Method::GET);

        let mut builder = shared_client().request(method, url.clone());

        // Host is rewritten to the target authority by the client; the
        // original caller's host header must not leak through.
        for (key, value) in &request.headers {
            let lower = key.to_ascii_lowercase();
            if lower != "host" && lower != "content-length" {
                builder = builder.header(key, value);
            }
        }
        for (key, value) in &options.inject_headers {
            builder = builder.header(key, value);
        }

        if let Some(bytes) = request.body_bytes() {
            builder = builder.body(bytes);
        }
        if let Some(timeout_ms) = options.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }

        debug!(%url, "forwarding proxy request");
        let start = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| self.map_send_error(e, target, options))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.map_send_error(e, target, options))?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let content_type = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str())
            .unwrap_or("");

        let (body, mode) = if self.is_binary_media_type(content_type) {
            (
                Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
                BodyMode::Binary,
            )
        } else {
            (
                Some(String::from_utf8_lossy(&bytes).to_string()),
                BodyMode::Text,
            )
        };

        Ok(NormalizedResponse {
            status_code: status,
            headers,
            body,
            mode,
            proxy_response_time_ms: Some(elapsed_ms),
        })
    }

    /// DNS pre-check so unresolvable names get the dedicated error form
    /// instead of a generic connect failure.
    async fn check_resolvable(&self, url: &reqwest::Url, target: &str) -> Result<(), EngineError> {
        let host = url.host_str().unwrap_or("");
        // Literal IPs need no resolution.
        if host.parse::<std::net::IpAddr>().is_ok() {
            return Ok(());
        }
        let port = url.port_or_known_default().unwrap_or(80);
        let resolved = tokio::net::lookup_host((host, port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next());
        if resolved.is_some() {
            Ok(())
        } else {
            Err(EngineError::InvalidProxy {
                message: format!("Cannot resolve \"{target}\""),
            })
        }
    }

    fn map_send_error(
        &self,
        error: reqwest::Error,
        target: &str,
        options: &ProxyOptions,
    ) -> EngineError {
        if error.is_timeout() {
            return EngineError::ProxyTimeout {
                target: target.to_string(),
                timeout_ms: options.timeout_ms.unwrap_or_default(),
            };
        }
        EngineError::InvalidProxy {
            message: format!("Unable to connect to \"{target}\""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unparsable_address_maps_to_invalid_proxy() {
        let client = ProxyClient::new();
        let request = NormalizedRequest::new(Some("GET"), "/");
        let err = tokio_test::block_on(client.to(
            "not a valid address",
            &request,
            &ProxyOptions::default(),
        ))
        .unwrap_err();
        assert_eq!(err.code(), "invalid proxy");
        assert_eq!(err.to_string(), "Unable to connect to \"not a valid address\"");
    }

    #[test]
    fn test_relative_address_rejected() {
        let client = ProxyClient::new();
        let request = NormalizedRequest::new(Some("GET"), "/");
        let err = tokio_test::block_on(client.to(
            "/just/a/path",
            &request,
            &ProxyOptions::default(),
        ))
        .unwrap_err();
        assert_eq!(err.code(), "invalid proxy");
    }

    #[test]
    fn test_resolvable_host_fails_on_connect_not_resolution() {
        let client = ProxyClient::new();
        let request = NormalizedRequest::new(Some("GET"), "/");
        let err = tokio_test::block_on(client.to(
            "http://localhost:1",
            &request,
            &ProxyOptions::default(),
        ))
        .unwrap_err();
        // localhost resolves; the failure is the refused connection.
        assert_eq!(err.to_string(), "Unable to connect to \"http://localhost:1\"");
    }

    #[test]
    fn test_binary_media_classification() {
        let client = ProxyClient::new();
        assert!(client.is_binary_media_type("image/gif"));
        assert!(client.is_binary_media_type("IMAGE/PNG"));
        assert!(client.is_binary_media_type("audio/mpeg"));
        assert!(client.is_binary_media_type("application/octet-stream"));
        assert!(!client.is_binary_media_type("text/html; charset=utf-8"));
        assert!(!client.is_binary_media_type("application/json"));

        let custom = ProxyClient::new().with_binary_media_types(vec!["application/pdf".to_string()]);
        assert!(custom.is_binary_media_type("application/pdf"));
        assert!(!custom.is_binary_media_type("image/gif"));
    }
}
