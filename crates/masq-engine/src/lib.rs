//! masq-engine: a protocol-agnostic service-virtualization engine.
//!
//! Callers stand up imposters (virtual servers) whose declarative stubs
//! answer normalized requests: predicates select the stub, response
//! definitions produce literal, computed, or proxied responses, and
//! behaviors post-process the result. Transport adapters own the wire;
//! the engine owns matching, resolution, recording, and behaviors.

pub mod behaviors;
pub mod error;
pub mod imposter;
pub mod predicates;
pub mod proxy;
pub mod recording;
pub mod request;
pub mod stubs;

mod resolver;
mod scripting;

pub use error::EngineError;
pub use imposter::{Imposter, ImposterConfig, StubOperation};
pub use proxy::{ProxyClient, ProxyOptions};
pub use request::{BodyMode, NormalizedRequest, NormalizedResponse};
pub use stubs::{
    ProxyDefinition, ProxyMode, ResponseDefinition, ResponseTemplate, Stub, StubDefinition,
    StubRepository,
};
