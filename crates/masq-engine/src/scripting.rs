//! Script evaluation for `inject` responses and the `decorate` behavior.
//!
//! User logic is expressed as a Rhai script evaluated with a `request` map
//! (and, for decorate, a `response` map) in scope. The script's result is
//! converted back through serde and validated as a response template; scripts
//! are only reachable on imposters created with injection enabled.

use crate::error::EngineError;
use crate::request::{NormalizedRequest, NormalizedResponse};
use crate::stubs::ResponseTemplate;
use anyhow::{anyhow, Context, Result};
use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine, Scope};

fn to_scope_value<T: serde::Serialize>(value: &T) -> Result<Dynamic> {
    let json = serde_json::to_value(value).context("cannot serialize scope value")?;
    to_dynamic(&json).map_err(|e| anyhow!("cannot convert scope value: {e}"))
}

fn dynamic_to_template(result: &Dynamic) -> Result<ResponseTemplate> {
    let value: serde_json::Value =
        from_dynamic(result).map_err(|e| anyhow!("script result is not serializable: {e}"))?;
    if !value.is_object() {
        return Err(anyhow!("script must return a response object, got {value}"));
    }
    serde_json::from_value(value).context("script result is not a well-formed response")
}

/// Evaluate an `inject` script. The script sees `request` and must return a
/// response object; the caller instantiates the returned template against
/// the imposter's defaults.
pub fn eval_inject(script: &str, request: &NormalizedRequest) -> Result<ResponseTemplate, EngineError> {
    run_inject(script, request)
        .map_err(|e| EngineError::InvalidInjectionResult(format!("{e:#}")))
}

fn run_inject(script: &str, request: &NormalizedRequest) -> Result<ResponseTemplate> {
    let engine = Engine::new();
    let ast = engine
        .compile(script)
        .map_err(|e| anyhow!("cannot compile script: {e}"))?;

    let mut scope = Scope::new();
    scope.push("request", to_scope_value(request)?);

    let result: Dynamic = engine
        .eval_ast_with_scope(&mut scope, &ast)
        .map_err(|e| anyhow!("script execution failed: {e}"))?;
    dynamic_to_template(&result)
}

/// Evaluate a `decorate` script. The script sees `request` and `response`;
/// it may return a replacement response object, or mutate `response` in
/// scope and return nothing. The result is merged over the original
/// response, so partial objects only override the fields they name.
pub fn eval_decorate(
    script: &str,
    request: &NormalizedRequest,
    response: &NormalizedResponse,
) -> Result<NormalizedResponse> {
    let engine = Engine::new();
    let ast = engine
        .compile(script)
        .map_err(|e| anyhow!("cannot compile script: {e}"))?;

    let mut scope = Scope::new();
    scope.push("request", to_scope_value(request)?);
    scope.push("response", to_scope_value(response)?);

    let result: Dynamic = engine
        .eval_ast_with_scope(&mut scope, &ast)
        .map_err(|e| anyhow!("script execution failed: {e}"))?;

    let result = if result.is_unit() {
        scope
            .get_value::<Dynamic>("response")
            .ok_or_else(|| anyhow!("script removed 'response' from scope"))?
    } else {
        result
    };

    let template = dynamic_to_template(&result)?;
    Ok(template.instantiate(Some(&ResponseTemplate::from_response(response))))
}
