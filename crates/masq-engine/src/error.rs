//! Engine error taxonomy.
//!
//! Every variant carries a stable machine-readable code (for API rendering)
//! plus a human-readable message suitable for direct display. No error from
//! request handling corrupts repository state; mutation errors are rejected
//! before any change is applied.

use thiserror::Error;

/// Errors surfaced by the request-resolution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The proxy origin is unreachable or the address is unparsable.
    #[error("{message}")]
    InvalidProxy { message: String },

    /// A proxy round trip exceeded the caller-supplied timeout.
    #[error("Proxy request to \"{target}\" timed out after {timeout_ms}ms")]
    ProxyTimeout { target: String, timeout_ms: u64 },

    /// An `inject` response or `decorate` behavior was used without the
    /// imposter enabling injection.
    #[error("JavaScript injection is not allowed unless the imposter is created with injection enabled")]
    InjectionNotAllowed,

    /// User-supplied injection logic returned something that is not a
    /// well-formed response.
    #[error("invalid injection result: {0}")]
    InvalidInjectionResult(String),

    /// A behavior in the post-processing pipeline failed; the pipeline is
    /// aborted and the offending behavior is named.
    #[error("behavior '{behavior}' failed: {message}")]
    BehaviorError { behavior: String, message: String },

    /// A stub mutation referenced an index outside the current collection.
    #[error("stub index {0} out of bounds")]
    InvalidStubIndex(usize),

    /// A stub or predicate definition was rejected at creation time.
    #[error("invalid stub definition: {0}")]
    InvalidStubDefinition(String),
}

impl EngineError {
    /// Stable machine-readable error code, rendered by the collaborator API.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidProxy { .. } | EngineError::ProxyTimeout { .. } => "invalid proxy",
            EngineError::InjectionNotAllowed | EngineError::InvalidInjectionResult(_) => {
                "invalid injection"
            }
            EngineError::BehaviorError { .. }
            | EngineError::InvalidStubIndex(_)
            | EngineError::InvalidStubDefinition(_) => "bad data",
        }
    }
}
