//! The imposter: one virtual server's engine state.
//!
//! Transport adapters consume the engine through exactly two operations:
//! [`Imposter::handle`] resolves a normalized request into a normalized
//! response, and [`Imposter::mutate_stubs`] applies runtime stub edits.
//! Everything else (port binding, wire codecs, TLS) belongs to the adapter.

use crate::behaviors;
use crate::error::EngineError;
use crate::proxy::ProxyClient;
use crate::request::{NormalizedRequest, NormalizedResponse};
use crate::resolver::{self, ResolveContext};
use crate::stubs::{ResponseTemplate, Stub, StubDefinition, StubRepository};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

fn default_protocol() -> String {
    "http".to_string()
}

fn default_max_requests() -> usize {
    1000
}

/// Configuration for creating an imposter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImposterConfig {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Trust boundary: `inject` responses and `decorate` behaviors are only
    /// reachable when explicitly enabled here.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_injection: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub record_requests: bool,
    /// Request-log retention cap; the oldest entry is evicted past it.
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_response: Option<ResponseTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stubs: Vec<StubDefinition>,
}

/// Runtime stub edit, applied atomically: validation failures reject the
/// whole operation with no partial mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StubOperation {
    Add {
        stub: StubDefinition,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    Replace {
        index: usize,
        stub: StubDefinition,
    },
    Remove {
        index: usize,
    },
    ReplaceAll {
        stubs: Vec<StubDefinition>,
    },
}

/// A virtual server bound to one port/protocol, backed by a stub repository.
pub struct Imposter {
    port: u16,
    protocol: String,
    name: Option<String>,
    allow_injection: bool,
    record_requests: bool,
    max_requests: usize,
    default_response: Option<ResponseTemplate>,
    repository: StubRepository,
    proxy_client: ProxyClient,
    /// Bounded log of received requests, oldest evicted first.
    requests: RwLock<VecDeque<NormalizedRequest>>,
    request_count: AtomicU64,
    created_at: DateTime<Utc>,
}

impl Imposter {
    /// Validate the configuration and build the imposter. Malformed stubs
    /// (empty response lists, bad predicates) are rejected here, never at
    /// match time.
    pub fn new(config: ImposterConfig) -> Result<Self, EngineError> {
        let stubs = config
            .stubs
            .into_iter()
            .map(|definition| Stub::from_definition(definition).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            port: config.port,
            protocol: config.protocol,
            name: config.name,
            allow_injection: config.allow_injection,
            record_requests: config.record_requests,
            max_requests: config.max_requests.max(1),
            default_response: config.default_response,
            repository: StubRepository::new(stubs),
            proxy_client: ProxyClient::new(),
            requests: RwLock::new(VecDeque::new()),
            request_count: AtomicU64::new(0),
            created_at: Utc::now(),
        })
    }

    /// Replace the proxy client (used to customize binary classification).
    pub fn with_proxy_client(mut self, proxy_client: ProxyClient) -> Self {
        self.proxy_client = proxy_client;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Resolve a request into a response: select the first matching stub,
    /// resolve its next response definition, then run the stub's behavior
    /// pipeline. No stub match falls back to the imposter's default
    /// response, else the protocol default (empty 200).
    pub async fn handle(
        &self,
        request: NormalizedRequest,
    ) -> Result<NormalizedResponse, EngineError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        if self.record_requests {
            let mut log = self.requests.write();
            if log.len() >= self.max_requests {
                log.pop_front();
            }
            log.push_back(request.clone());
        }

        let Some(stub) = self.repository.select_stub(&request) else {
            debug!(port = self.port, path = %request.path, "no stub matched");
            return Ok(ResponseTemplate::default()
                .instantiate(self.default_response.as_ref()));
        };

        let ctx = ResolveContext {
            allow_injection: self.allow_injection,
            default_response: self.default_response.as_ref(),
            repository: &self.repository,
            proxy_client: &self.proxy_client,
        };
        let response = resolver::resolve(&ctx, &stub, &request).await?;
        behaviors::apply(&stub.behaviors, response, &request, self.allow_injection).await
    }

    /// Apply a runtime stub edit. Out-of-range indices fail with
    /// `InvalidStubIndex` and leave the collection untouched.
    pub fn mutate_stubs(&self, operation: StubOperation) -> Result<(), EngineError> {
        match operation {
            StubOperation::Add { stub, index } => {
                let stub = Arc::new(Stub::from_definition(stub)?);
                self.repository.insert_at(index, stub);
                Ok(())
            }
            StubOperation::Replace { index, stub } => {
                let stub = Arc::new(Stub::from_definition(stub)?);
                self.repository.replace_at(index, stub)
            }
            StubOperation::Remove { index } => self.repository.remove_at(index),
            StubOperation::ReplaceAll { stubs } => {
                // Validate everything before swapping anything.
                let stubs = stubs
                    .into_iter()
                    .map(|definition| Stub::from_definition(definition).map(Arc::new))
                    .collect::<Result<Vec<_>, _>>()?;
                self.repository.replace_all(stubs);
                Ok(())
            }
        }
    }

    /// Current stub definitions in match order, for the collaborator API.
    pub fn stubs(&self) -> Vec<StubDefinition> {
        self.repository.definitions()
    }

    /// Per-stub match counters in match order.
    pub fn match_counts(&self) -> Vec<u64> {
        self.repository.match_counts()
    }

    pub fn stub_count(&self) -> usize {
        self.repository.len()
    }

    /// The bounded request log, oldest first. Read-only contract with the
    /// collaborator API.
    pub fn recorded_requests(&self) -> Vec<NormalizedRequest> {
        self.requests.read().iter().cloned().collect()
    }

    /// Clear the request log and reset the request counter.
    pub fn clear_recorded_requests(&self) {
        self.requests.write().clear();
        self.request_count.store(0, Ordering::SeqCst);
    }

    /// Total requests handled, including unmatched ones.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imposter(json: serde_json::Value) -> Imposter {
        let config: ImposterConfig = serde_json::from_value(json).unwrap();
        Imposter::new(config).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config: ImposterConfig = serde_json::from_str(r#"{"port": 8080}"#).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.protocol, "http");
        assert!(!config.allow_injection);
        assert!(!config.record_requests);
        assert_eq!(config.max_requests, 1000);
        assert!(config.stubs.is_empty());
    }

    #[test]
    fn test_malformed_stub_rejected_at_creation() {
        let config: ImposterConfig = serde_json::from_value(serde_json::json!({
            "port": 8080,
            "stubs": [{"responses": []}]
        }))
        .unwrap();
        assert!(matches!(
            Imposter::new(config),
            Err(EngineError::InvalidStubDefinition(_))
        ));
    }

    #[tokio::test]
    async fn test_no_match_returns_protocol_default() {
        let imposter = imposter(serde_json::json!({"port": 8080}));
        let response = imposter
            .handle(NormalizedRequest::new(Some("GET"), "/anything"))
            .await
            .unwrap();
        assert_eq!(response, NormalizedResponse::protocol_default());
    }

    #[tokio::test]
    async fn test_no_match_uses_default_response() {
        let imposter = imposter(serde_json::json!({
            "port": 8080,
            "defaultResponse": {"statusCode": 404, "body": "no stub"}
        }));
        let response = imposter
            .handle(NormalizedRequest::new(Some("GET"), "/anything"))
            .await
            .unwrap();
        assert_eq!(response.status_code, 404);
        assert_eq!(response.body.as_deref(), Some("no stub"));
    }

    #[tokio::test]
    async fn test_round_robin_through_handle() {
        let imposter = imposter(serde_json::json!({
            "port": 8080,
            "stubs": [{
                "responses": [
                    {"is": {"body": "0"}},
                    {"is": {"body": "1"}},
                    {"is": {"body": "2"}}
                ]
            }]
        }));

        let mut bodies = Vec::new();
        for _ in 0..4 {
            let response = imposter
                .handle(NormalizedRequest::new(Some("GET"), "/"))
                .await
                .unwrap();
            bodies.push(response.body.unwrap());
        }
        assert_eq!(bodies, vec!["0", "1", "2", "0"]);
    }

    #[tokio::test]
    async fn test_request_log_bounded() {
        let imposter = imposter(serde_json::json!({
            "port": 8080,
            "recordRequests": true,
            "maxRequests": 2
        }));

        for path in ["/a", "/b", "/c"] {
            imposter
                .handle(NormalizedRequest::new(Some("GET"), path))
                .await
                .unwrap();
        }

        let log = imposter.recorded_requests();
        assert_eq!(log.len(), 2);
        // Oldest evicted first.
        assert_eq!(log[0].path, "/b");
        assert_eq!(log[1].path, "/c");
        assert_eq!(imposter.request_count(), 3);

        imposter.clear_recorded_requests();
        assert!(imposter.recorded_requests().is_empty());
        assert_eq!(imposter.request_count(), 0);
    }

    #[tokio::test]
    async fn test_mutate_stubs() {
        let imposter = imposter(serde_json::json!({"port": 8080}));

        let stub: StubDefinition = serde_json::from_value(serde_json::json!({
            "predicates": [{"equals": {"path": "/a"}}],
            "responses": [{"is": {"body": "a"}}]
        }))
        .unwrap();
        imposter
            .mutate_stubs(StubOperation::Add {
                stub: stub.clone(),
                index: None,
            })
            .unwrap();
        assert_eq!(imposter.stub_count(), 1);

        let err = imposter
            .mutate_stubs(StubOperation::Remove { index: 5 })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStubIndex(5)));
        assert_eq!(imposter.stub_count(), 1);

        imposter
            .mutate_stubs(StubOperation::ReplaceAll { stubs: vec![stub; 3] })
            .unwrap();
        assert_eq!(imposter.stub_count(), 3);

        imposter
            .mutate_stubs(StubOperation::Remove { index: 0 })
            .unwrap();
        assert_eq!(imposter.stub_count(), 2);
    }

    #[tokio::test]
    async fn test_replace_all_rejects_invalid_without_partial_mutation() {
        let imposter = imposter(serde_json::json!({
            "port": 8080,
            "stubs": [{"responses": [{"is": {"body": "keep"}}]}]
        }));

        let good: StubDefinition =
            serde_json::from_value(serde_json::json!({"responses": [{"is": {}}]})).unwrap();
        let bad: StubDefinition =
            serde_json::from_value(serde_json::json!({"responses": []})).unwrap();

        let err = imposter
            .mutate_stubs(StubOperation::ReplaceAll {
                stubs: vec![good, bad],
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStubDefinition(_)));
        // Original stub untouched.
        assert_eq!(imposter.stub_count(), 1);
    }

    #[tokio::test]
    async fn test_injection_disabled_by_default() {
        let imposter = imposter(serde_json::json!({
            "port": 8080,
            "stubs": [{"responses": [{"inject": "#{ body: \"x\" }"}]}]
        }));
        let err = imposter
            .handle(NormalizedRequest::new(Some("GET"), "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InjectionNotAllowed));
    }
}
