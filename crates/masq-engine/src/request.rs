//! Protocol-independent request and response types.
//!
//! Transport adapters decode wire bytes into a [`NormalizedRequest`] and
//! encode the [`NormalizedResponse`] they get back. Binary payloads travel
//! through the engine as base64 text with the body mode set to `binary`; the
//! engine never mutates binary payloads, it only forwards the flag so the
//! transport boundary can decode losslessly.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a body string should be interpreted at the transport boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BodyMode {
    /// Body is UTF-8 text (default).
    #[default]
    Text,
    /// Body is base64-encoded binary data.
    Binary,
}

fn is_text_mode(mode: &BodyMode) -> bool {
    *mode == BodyMode::Text
}

/// Protocol-independent view of an inbound call. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRequest {
    /// Method/verb; protocol-dependent and optional (TCP has none).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
    /// Header names are matched case-insensitively; stored as received.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "_mode", default, skip_serializing_if = "is_text_mode")]
    pub mode: BodyMode,
    /// Remote address of the caller, e.g. "127.0.0.1:53912".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_from: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NormalizedRequest {
    /// Build a request with the current timestamp and no caller address.
    pub fn new(method: Option<&str>, path: &str) -> Self {
        Self {
            method: method.map(|m| m.to_string()),
            path: path.to_string(),
            query: HashMap::new(),
            headers: HashMap::new(),
            body: None,
            mode: BodyMode::Text,
            request_from: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    pub fn with_binary_body(mut self, bytes: &[u8]) -> Self {
        self.body = Some(base64::engine::general_purpose::STANDARD.encode(bytes));
        self.mode = BodyMode::Binary;
        self
    }

    pub fn with_request_from(mut self, addr: &str) -> Self {
        self.request_from = Some(addr.to_string());
        self
    }

    /// Case-insensitive header lookup (HTTP header names are case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Raw body bytes: base64-decoded for binary bodies, UTF-8 for text.
    pub fn body_bytes(&self) -> Option<Vec<u8>> {
        let body = self.body.as_ref()?;
        match self.mode {
            BodyMode::Binary => base64::engine::general_purpose::STANDARD.decode(body).ok(),
            BodyMode::Text => Some(body.as_bytes().to_vec()),
        }
    }
}

/// Protocol-independent response handed back to the transport adapter.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedResponse {
    /// Status/result code; meaning is protocol-dependent (HTTP status, etc.).
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "_mode", default, skip_serializing_if = "is_text_mode")]
    pub mode: BodyMode,
    /// Wall-clock proxy round-trip time, set only on proxied responses.
    /// Recorded before behaviors run, so `wait` delays never inflate it.
    #[serde(rename = "_proxyResponseTime", skip_serializing_if = "Option::is_none")]
    pub proxy_response_time_ms: Option<u64>,
}

impl NormalizedResponse {
    /// The protocol default returned when no stub matches: empty 200.
    pub fn protocol_default() -> Self {
        Self {
            status_code: 200,
            ..Default::default()
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Raw body bytes: base64-decoded for binary bodies, UTF-8 for text.
    pub fn body_bytes(&self) -> Option<Vec<u8>> {
        let body = self.body.as_ref()?;
        match self.mode {
            BodyMode::Binary => base64::engine::general_purpose::STANDARD.decode(body).ok(),
            BodyMode::Text => Some(body.as_bytes().to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = NormalizedRequest::new(Some("GET"), "/orders")
            .with_query("page", "2")
            .with_header("Content-Type", "application/json")
            .with_body("{}");
        assert_eq!(request.method.as_deref(), Some("GET"));
        assert_eq!(request.query.get("page"), Some(&"2".to_string()));
        assert_eq!(request.header("content-type"), Some("application/json"));
    }

    #[test]
    fn test_binary_body_round_trip() {
        let request = NormalizedRequest::new(None, "").with_binary_body(&[0, 1, 2, 3]);
        assert_eq!(request.mode, BodyMode::Binary);
        assert_eq!(request.body.as_deref(), Some("AAECAw=="));
        assert_eq!(request.body_bytes(), Some(vec![0, 1, 2, 3]));
    }

    #[test]
    fn test_response_serde_skips_defaults() {
        let response = NormalizedResponse::protocol_default();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert!(json.get("_mode").is_none());
        assert!(json.get("_proxyResponseTime").is_none());
    }
}
