//! Stubs and the per-imposter stub repository.
//!
//! A stub is an ordered list of predicates (conjunctive, vacuously true when
//! empty), a non-empty ordered list of response definitions consumed
//! round-robin, and an optional behavior list. The repository owns the
//! ordered collection and implements first-match selection with a
//! snapshot-per-scan discipline: every mutation publishes a new ordered
//! sequence atomically, so a scan in progress never observes a partially
//! spliced list.

use crate::behaviors::Behavior;
use crate::error::EngineError;
use crate::predicates::{matches_all, Predicate};
use crate::recording::PredicateGenerator;
use crate::request::{BodyMode, NormalizedRequest, NormalizedResponse};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Response definitions
// ============================================================================

/// Literal response template for `is` definitions. Fields left unset fall
/// back to the imposter's default response, then to protocol defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTemplate {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_status_code"
    )]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(rename = "_mode", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<BodyMode>,
}

/// Accept statusCode as either a number or a numeric string.
fn deserialize_status_code<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| D::Error::custom("invalid status code number")),
        Some(Value::String(s)) => s
            .parse::<u16>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid status code string: {s}"))),
        Some(_) => Err(D::Error::custom("statusCode must be a number or string")),
    }
}

impl ResponseTemplate {
    /// Build a template capturing a concrete response (used when recording
    /// proxy traffic).
    pub fn from_response(response: &NormalizedResponse) -> Self {
        Self {
            status_code: Some(response.status_code),
            headers: response.headers.clone(),
            body: response.body.clone().map(Value::String),
            mode: Some(response.mode),
        }
    }

    /// Merge the template over `default` and instantiate a concrete response.
    /// A structured (non-string) body is serialized to JSON text.
    pub fn instantiate(&self, default: Option<&ResponseTemplate>) -> NormalizedResponse {
        let empty = ResponseTemplate::default();
        let default = default.unwrap_or(&empty);

        let mut headers = default.headers.clone();
        headers.extend(self.headers.clone());

        let body = self.body.as_ref().or(default.body.as_ref()).map(|value| {
            match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        });

        NormalizedResponse {
            status_code: self.status_code.or(default.status_code).unwrap_or(200),
            headers,
            body,
            mode: self.mode.or(default.mode).unwrap_or_default(),
            proxy_response_time_ms: None,
        }
    }
}

/// Proxy recording mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ProxyMode {
    /// Record the first response, replay it thereafter (the recorded stub
    /// shadows the proxy on future matches).
    #[default]
    ProxyOnce,
    /// Record every call, each recording inserted ahead of the previous one
    /// so replay order matches original call order.
    ProxyAlways,
    /// Forward without recording.
    ProxyTransparent,
}

/// Target and recording configuration for a `proxy` response definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyDefinition {
    /// Origin address, e.g. "http://localhost:3000".
    pub to: String,
    #[serde(default)]
    pub mode: ProxyMode,
    /// Which request fields recorded stubs should capture as predicates.
    /// Empty means exact-match every field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predicate_generators: Vec<PredicateGenerator>,
    /// Attach a `wait` behavior with the observed origin latency to each
    /// recorded stub.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub add_wait_behavior: bool,
    /// Attach this decorate script to each recorded stub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_decorate_behavior: Option<String>,
    /// Extra headers set on the forwarded request.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inject_headers: HashMap<String, String>,
    /// Optional round-trip timeout; the engine enforces none by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// One of the stub's ordered response definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResponseDefinition {
    /// Literal response template.
    #[serde(rename = "is")]
    Is(ResponseTemplate),
    /// User-supplied script that computes a response from the request.
    /// Only reachable when the imposter enables injection.
    #[serde(rename = "inject")]
    Inject(String),
    /// Forward to an origin, optionally recording the exchange as a new stub.
    #[serde(rename = "proxy")]
    Proxy(ProxyDefinition),
}

// ============================================================================
// Stubs
// ============================================================================

/// Wire shape of a stub, as supplied by callers and exported back to them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StubDefinition {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predicates: Vec<Predicate>,
    pub responses: Vec<ResponseDefinition>,
    #[serde(
        rename = "_behaviors",
        alias = "behaviors",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub behaviors: Vec<Behavior>,
}

/// Runtime stub: immutable rule data plus an atomic match counter that
/// drives round-robin response selection.
#[derive(Debug)]
pub struct Stub {
    pub predicates: Vec<Predicate>,
    pub responses: Vec<ResponseDefinition>,
    pub behaviors: Vec<Behavior>,
    matches: AtomicU64,
}

impl Stub {
    /// Validate a definition and build the runtime stub.
    pub fn from_definition(definition: StubDefinition) -> Result<Self, EngineError> {
        if definition.responses.is_empty() {
            return Err(EngineError::InvalidStubDefinition(
                "stub must have at least one response".to_string(),
            ));
        }
        Ok(Self {
            predicates: definition.predicates,
            responses: definition.responses,
            behaviors: definition.behaviors,
            matches: AtomicU64::new(0),
        })
    }

    pub fn matches_request(&self, request: &NormalizedRequest) -> bool {
        matches_all(&self.predicates, request)
    }

    /// Claim the next match position. Concurrent matches receive distinct,
    /// sequential indices; the Nth match uses response `(N-1) % K`. The
    /// returned sequence is the rollback token for [`Stub::release_match`].
    pub fn claim_match(&self) -> (usize, u64) {
        let n = self.matches.fetch_add(1, Ordering::SeqCst);
        ((n % self.responses.len() as u64) as usize, n)
    }

    /// Roll the counter back after a failed resolution. Only applies when no
    /// other claim interleaved; otherwise the failed slot stays consumed, so
    /// successful matches never receive a duplicate index.
    pub fn release_match(&self, sequence: u64) {
        let _ = self.matches.compare_exchange(
            sequence + 1,
            sequence,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn match_count(&self) -> u64 {
        self.matches.load(Ordering::SeqCst)
    }

    /// Export the wire shape (match counter is process-local state and is
    /// reported separately).
    pub fn definition(&self) -> StubDefinition {
        StubDefinition {
            predicates: self.predicates.clone(),
            responses: self.responses.clone(),
            behaviors: self.behaviors.clone(),
        }
    }
}

// ============================================================================
// Repository
// ============================================================================

/// Ordered stub collection for one imposter.
///
/// Readers take a point-in-time snapshot (`Arc` clone) at scan start; every
/// mutation clones the vector, splices, and atomically swaps the published
/// sequence. Newly inserted stubs are visible only to scans started after
/// the insertion completes.
pub struct StubRepository {
    stubs: RwLock<Arc<Vec<Arc<Stub>>>>,
}

impl StubRepository {
    pub fn new(stubs: Vec<Arc<Stub>>) -> Self {
        Self {
            stubs: RwLock::new(Arc::new(stubs)),
        }
    }

    /// Point-in-time ordered snapshot of the collection.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Stub>>> {
        self.stubs.read().clone()
    }

    /// First-match selection: scan the snapshot in order and return the first
    /// stub whose predicates all evaluate true. Ties are broken by
    /// registration order, never by specificity.
    pub fn select_stub(&self, request: &NormalizedRequest) -> Option<Arc<Stub>> {
        self.snapshot()
            .iter()
            .find(|stub| stub.matches_request(request))
            .cloned()
    }

    pub fn append(&self, stub: Arc<Stub>) {
        let mut guard = self.stubs.write();
        let mut next = guard.as_ref().clone();
        next.push(stub);
        debug!(stubs = next.len(), "appended stub");
        *guard = Arc::new(next);
    }

    /// Insert `stub` immediately before `anchor` so it takes precedence on
    /// future matches. Falls back to appending if the anchor was removed by
    /// a concurrent mutation.
    pub fn insert_before(&self, anchor: &Arc<Stub>, stub: Arc<Stub>) {
        let mut guard = self.stubs.write();
        let mut next = guard.as_ref().clone();
        let index = next
            .iter()
            .position(|s| Arc::ptr_eq(s, anchor))
            .unwrap_or(next.len());
        next.insert(index, stub);
        debug!(index, stubs = next.len(), "inserted stub before anchor");
        *guard = Arc::new(next);
    }

    pub fn remove_at(&self, index: usize) -> Result<(), EngineError> {
        let mut guard = self.stubs.write();
        if index >= guard.len() {
            return Err(EngineError::InvalidStubIndex(index));
        }
        let mut next = guard.as_ref().clone();
        next.remove(index);
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn replace_at(&self, index: usize, stub: Arc<Stub>) -> Result<(), EngineError> {
        let mut guard = self.stubs.write();
        if index >= guard.len() {
            return Err(EngineError::InvalidStubIndex(index));
        }
        let mut next = guard.as_ref().clone();
        next[index] = stub;
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn insert_at(&self, index: Option<usize>, stub: Arc<Stub>) {
        let mut guard = self.stubs.write();
        let mut next = guard.as_ref().clone();
        let index = index.unwrap_or(next.len()).min(next.len());
        next.insert(index, stub);
        *guard = Arc::new(next);
    }

    pub fn replace_all(&self, stubs: Vec<Arc<Stub>>) {
        let mut guard = self.stubs.write();
        debug!(stubs = stubs.len(), "replaced all stubs");
        *guard = Arc::new(stubs);
    }

    pub fn len(&self) -> usize {
        self.stubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.read().is_empty()
    }

    /// Export all stub definitions in current order.
    pub fn definitions(&self) -> Vec<StubDefinition> {
        self.snapshot().iter().map(|s| s.definition()).collect()
    }

    /// Match counters in current order, for diagnostics.
    pub fn match_counts(&self) -> Vec<u64> {
        self.snapshot().iter().map(|s| s.match_count()).collect()
    }
}
