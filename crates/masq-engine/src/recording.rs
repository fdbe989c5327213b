//! Predicate generators and recorded-stub assembly for proxy recording.
//!
//! When a `proxy` response definition records traffic, the predicate
//! generators describe which request fields the new stub should capture as
//! predicates. With no generators configured, every field is captured as an
//! exact match, so a predicate-identical repeat request replays the
//! recording instead of re-invoking the origin.

use crate::behaviors::{Behavior, WaitBehavior};
use crate::predicates::{CompareOp, FieldSelector, Predicate, PredicateOp, PredicateParams};
use crate::request::{NormalizedRequest, NormalizedResponse};
use crate::stubs::{ProxyDefinition, ResponseDefinition, ResponseTemplate, StubDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Which request fields a recorded stub's predicates should capture.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredicateGenerator {
    #[serde(default)]
    pub matches: GeneratorFields,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub case_sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<String>,
    /// Comparison applied to captured fields. Defaults to exact match
    /// (full-mapping equality for query).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate_operator: Option<CompareOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorFields {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub method: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub path: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub query: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub body: bool,
    /// `true` captures all headers; a map captures only the named ones.
    #[serde(default, skip_serializing_if = "HeadersCapture::is_none")]
    pub headers: HeadersCapture,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HeadersCapture {
    All(bool),
    Named(HashMap<String, bool>),
}

impl Default for HeadersCapture {
    fn default() -> Self {
        HeadersCapture::All(false)
    }
}

impl HeadersCapture {
    fn is_none(&self) -> bool {
        matches!(self, HeadersCapture::All(false))
    }

    fn captured(&self, request: &NormalizedRequest) -> Option<HashMap<String, String>> {
        match self {
            HeadersCapture::All(false) => None,
            HeadersCapture::All(true) => Some(request.headers.clone()),
            HeadersCapture::Named(names) => {
                let captured: HashMap<String, String> = names
                    .iter()
                    .filter(|(_, capture)| **capture)
                    .filter_map(|(name, _)| {
                        request.header(name).map(|v| (name.clone(), v.to_string()))
                    })
                    .collect();
                if captured.is_empty() {
                    None
                } else {
                    Some(captured)
                }
            }
        }
    }
}

/// The implicit generator used when a proxy definition configures none:
/// exact-match every field of the triggering request.
fn default_generator() -> PredicateGenerator {
    PredicateGenerator {
        matches: GeneratorFields {
            method: true,
            path: true,
            query: true,
            body: true,
            headers: HeadersCapture::All(false),
        },
        case_sensitive: false,
        except: None,
        predicate_operator: None,
    }
}

/// Derive predicates for a recorded stub from the triggering request.
pub fn generate_predicates(
    generators: &[PredicateGenerator],
    request: &NormalizedRequest,
) -> Vec<Predicate> {
    let default;
    let generators = if generators.is_empty() {
        default = [default_generator()];
        &default[..]
    } else {
        generators
    };

    let mut predicates = Vec::new();
    for generator in generators {
        let params = PredicateParams {
            case_sensitive: generator.case_sensitive,
            except: generator.except.clone(),
        };
        let operator = generator.predicate_operator;
        let mut push = |default_op: CompareOp, field: FieldSelector, expected: Value| {
            predicates.push(Predicate {
                op: PredicateOp::Compare {
                    op: operator.unwrap_or(default_op),
                    field,
                    expected,
                },
                params: params.clone(),
            });
        };

        if generator.matches.method {
            if let Some(method) = &request.method {
                push(
                    CompareOp::Equals,
                    FieldSelector::Method,
                    Value::String(method.clone()),
                );
            }
        }
        if generator.matches.path {
            push(
                CompareOp::Equals,
                FieldSelector::Path,
                Value::String(request.path.clone()),
            );
        }
        if generator.matches.query {
            // Full-mapping equality so extra parameters never replay a
            // recording made for a different request.
            push(
                CompareOp::DeepEquals,
                FieldSelector::Query,
                map_to_value(&request.query),
            );
        }
        if generator.matches.body {
            if let Some(body) = &request.body {
                push(
                    CompareOp::Equals,
                    FieldSelector::Body,
                    Value::String(body.clone()),
                );
            }
        }
        if let Some(headers) = generator.matches.headers.captured(request) {
            push(CompareOp::Equals, FieldSelector::Headers, map_to_value(&headers));
        }
    }
    predicates
}

fn map_to_value(map: &HashMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Assemble the stub recorded for a captured proxy exchange: derived
/// predicates, a sole `is` definition wrapping the captured response, and
/// any behaviors the proxy definition asks for.
pub fn build_recorded_stub(
    proxy: &ProxyDefinition,
    request: &NormalizedRequest,
    response: &NormalizedResponse,
) -> StubDefinition {
    let mut behaviors = Vec::new();
    if proxy.add_wait_behavior {
        behaviors.push(Behavior::Wait(WaitBehavior::Fixed(
            response.proxy_response_time_ms.unwrap_or(0),
        )));
    }
    if let Some(script) = &proxy.add_decorate_behavior {
        behaviors.push(Behavior::Decorate(script.clone()));
    }

    StubDefinition {
        predicates: generate_predicates(&proxy.predicate_generators, request),
        responses: vec![ResponseDefinition::Is(ResponseTemplate::from_response(
            response,
        ))],
        behaviors,
    }
}
