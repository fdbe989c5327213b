//! Response resolution: pick the stub's next response definition round-robin
//! and produce a concrete response, forwarding to the proxy client and
//! recording new stubs where the definition asks for it.

use crate::error::EngineError;
use crate::proxy::{ProxyClient, ProxyOptions};
use crate::recording::build_recorded_stub;
use crate::request::{NormalizedRequest, NormalizedResponse};
use crate::scripting;
use crate::stubs::{
    ProxyDefinition, ProxyMode, ResponseDefinition, ResponseTemplate, Stub, StubRepository,
};
use std::sync::Arc;
use tracing::debug;

/// Per-imposter collaborators the resolver needs.
pub(crate) struct ResolveContext<'a> {
    pub allow_injection: bool,
    pub default_response: Option<&'a ResponseTemplate>,
    pub repository: &'a StubRepository,
    pub proxy_client: &'a ProxyClient,
}

/// Resolve a response for a stub that matched `request`.
///
/// Claims the stub's next match index (atomic, so concurrent matches get
/// distinct sequential indices) and dispatches on the selected definition.
/// On failure the claim is rolled back; if another claim interleaved, the
/// failed slot stays consumed so successful matches keep distinct indices.
pub(crate) async fn resolve(
    ctx: &ResolveContext<'_>,
    stub: &Arc<Stub>,
    request: &NormalizedRequest,
) -> Result<NormalizedResponse, EngineError> {
    let (index, sequence) = stub.claim_match();
    let definition = stub.responses[index].clone();

    let result = resolve_definition(ctx, stub, &definition, request).await;
    if result.is_err() {
        stub.release_match(sequence);
    }
    result
}

async fn resolve_definition(
    ctx: &ResolveContext<'_>,
    stub: &Arc<Stub>,
    definition: &ResponseDefinition,
    request: &NormalizedRequest,
) -> Result<NormalizedResponse, EngineError> {
    match definition {
        ResponseDefinition::Is(template) => Ok(template.instantiate(ctx.default_response)),
        ResponseDefinition::Inject(script) => {
            if !ctx.allow_injection {
                return Err(EngineError::InjectionNotAllowed);
            }
            let template = scripting::eval_inject(script, request)?;
            Ok(template.instantiate(ctx.default_response))
        }
        ResponseDefinition::Proxy(proxy) => resolve_proxy(ctx, stub, proxy, request).await,
    }
}

async fn resolve_proxy(
    ctx: &ResolveContext<'_>,
    stub: &Arc<Stub>,
    proxy: &ProxyDefinition,
    request: &NormalizedRequest,
) -> Result<NormalizedResponse, EngineError> {
    let options = ProxyOptions {
        inject_headers: proxy.inject_headers.clone(),
        timeout_ms: proxy.timeout_ms,
    };
    let response = ctx.proxy_client.to(&proxy.to, request, &options).await?;

    match proxy.mode {
        ProxyMode::ProxyOnce | ProxyMode::ProxyAlways => {
            let recorded = Stub::from_definition(build_recorded_stub(proxy, request, &response))?;
            // Recorded stubs go ahead of the proxy stub so they shadow it on
            // future matches; under proxyAlways each new recording lands
            // between the last one and the proxy, preserving call order.
            ctx.repository.insert_before(stub, Arc::new(recorded));
            debug!(target = %proxy.to, mode = ?proxy.mode, "recorded proxy response as new stub");
        }
        ProxyMode::ProxyTransparent => {}
    }

    Ok(response)
}
