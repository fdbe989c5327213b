//! Predicate evaluation for stub matching.
//!
//! Predicates are a tagged sum type: leaf comparisons (`equals`, `deepEquals`,
//! `contains`, `startsWith`, `endsWith`, `matches`, `exists`) over exactly one
//! request field, and the combinators `not`, `and`, `or` wrapping child
//! predicates. Malformed definitions (unknown operator, bad regex, multiple
//! fields in one leaf) are rejected when the stub is created, so
//! [`evaluate`] is total and never fails at match time.

use crate::request::NormalizedRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The request field a leaf predicate inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSelector {
    Method,
    Path,
    Query,
    Headers,
    Body,
}

impl FieldSelector {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "method" => Some(FieldSelector::Method),
            "path" => Some(FieldSelector::Path),
            "query" => Some(FieldSelector::Query),
            "headers" => Some(FieldSelector::Headers),
            // TCP transports expose the payload as "data"; it maps onto body.
            "body" | "data" => Some(FieldSelector::Body),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldSelector::Method => "method",
            FieldSelector::Path => "path",
            FieldSelector::Query => "query",
            FieldSelector::Headers => "headers",
            FieldSelector::Body => "body",
        }
    }
}

/// String comparison applied by a leaf predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompareOp {
    Equals,
    DeepEquals,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
}

impl CompareOp {
    fn name(&self) -> &'static str {
        match self {
            CompareOp::Equals => "equals",
            CompareOp::DeepEquals => "deepEquals",
            CompareOp::Contains => "contains",
            CompareOp::StartsWith => "startsWith",
            CompareOp::EndsWith => "endsWith",
            CompareOp::Matches => "matches",
        }
    }
}

/// Modifier flags shared by all leaf predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredicateParams {
    /// Comparisons are case-insensitive unless set.
    pub case_sensitive: bool,
    /// Regex whose matches are stripped from both sides before comparing.
    pub except: Option<String>,
}

/// Predicate operation, dispatched by a single exhaustive match in
/// [`evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub enum PredicateOp {
    Compare {
        op: CompareOp,
        field: FieldSelector,
        expected: Value,
    },
    /// `true` payload requires presence, `false` requires absence. For
    /// mapping fields the payload is a map of key to bool.
    Exists {
        field: FieldSelector,
        expected: Value,
    },
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

/// A boolean test against one normalized request field (or a combinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PredicateRaw", into = "PredicateRaw")]
pub struct Predicate {
    pub op: PredicateOp,
    pub params: PredicateParams,
}

impl Predicate {
    /// Convenience constructor for an exact-match leaf (used by predicate
    /// generators and tests).
    pub fn equals(field: FieldSelector, expected: Value) -> Self {
        Predicate {
            op: PredicateOp::Compare {
                op: CompareOp::Equals,
                field,
                expected,
            },
            params: PredicateParams::default(),
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

/// Raw wire shape: operator key plus sibling modifier flags, e.g.
/// `{"startsWith": {"path": "/api"}, "caseSensitive": true}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PredicateRaw {
    #[serde(skip_serializing_if = "Option::is_none")]
    equals: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deep_equals: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    contains: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    starts_with: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ends_with: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    matches: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exists: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    not: Option<Box<PredicateRaw>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    and: Option<Vec<PredicateRaw>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    or: Option<Vec<PredicateRaw>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    case_sensitive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    except: Option<String>,
}

impl TryFrom<PredicateRaw> for Predicate {
    type Error = String;

    fn try_from(raw: PredicateRaw) -> Result<Self, Self::Error> {
        let params = PredicateParams {
            case_sensitive: raw.case_sensitive.unwrap_or(false),
            except: raw.except.clone().filter(|s| !s.is_empty()),
        };
        if let Some(ref pattern) = params.except {
            regex::Regex::new(pattern)
                .map_err(|e| format!("invalid 'except' regex '{pattern}': {e}"))?;
        }

        let mut ops: Vec<PredicateOp> = Vec::new();

        for (name, value, op) in [
            ("equals", &raw.equals, CompareOp::Equals),
            ("deepEquals", &raw.deep_equals, CompareOp::DeepEquals),
            ("contains", &raw.contains, CompareOp::Contains),
            ("startsWith", &raw.starts_with, CompareOp::StartsWith),
            ("endsWith", &raw.ends_with, CompareOp::EndsWith),
            ("matches", &raw.matches, CompareOp::Matches),
        ] {
            if let Some(value) = value {
                let (field, expected) = parse_leaf(name, value)?;
                if op == CompareOp::Matches {
                    validate_regex_fragment(&expected)?;
                }
                ops.push(PredicateOp::Compare {
                    op,
                    field,
                    expected,
                });
            }
        }

        if let Some(ref value) = raw.exists {
            let (field, expected) = parse_leaf("exists", value)?;
            ops.push(PredicateOp::Exists { field, expected });
        }
        if let Some(inner) = raw.not {
            ops.push(PredicateOp::Not(Box::new(Predicate::try_from(*inner)?)));
        }
        if let Some(children) = raw.and {
            ops.push(PredicateOp::And(
                children
                    .into_iter()
                    .map(Predicate::try_from)
                    .collect::<Result<_, _>>()?,
            ));
        }
        if let Some(children) = raw.or {
            ops.push(PredicateOp::Or(
                children
                    .into_iter()
                    .map(Predicate::try_from)
                    .collect::<Result<_, _>>()?,
            ));
        }

        match ops.len() {
            0 => Err("predicate must name exactly one operator".to_string()),
            1 => Ok(Predicate {
                op: ops.into_iter().next().unwrap(),
                params,
            }),
            _ => Err("predicate must name exactly one operator, found several".to_string()),
        }
    }
}

/// A leaf payload is an object naming exactly one request field.
fn parse_leaf(op_name: &str, value: &Value) -> Result<(FieldSelector, Value), String> {
    let obj = value
        .as_object()
        .ok_or_else(|| format!("'{op_name}' expects an object naming a request field"))?;
    if obj.len() != 1 {
        return Err(format!(
            "'{op_name}' must inspect exactly one request field, found {}",
            obj.len()
        ));
    }
    let (name, expected) = obj.iter().next().unwrap();
    let field = FieldSelector::parse(name)
        .ok_or_else(|| format!("unknown request field '{name}' in '{op_name}' predicate"))?;
    Ok((field, expected.clone()))
}

/// Every scalar in a `matches` fragment must compile as a regex.
fn validate_regex_fragment(expected: &Value) -> Result<(), String> {
    match expected {
        Value::String(pattern) => regex::Regex::new(pattern)
            .map(|_| ())
            .map_err(|e| format!("invalid 'matches' regex '{pattern}': {e}")),
        Value::Object(map) => map.values().try_for_each(validate_regex_fragment),
        _ => Ok(()),
    }
}

impl From<Predicate> for PredicateRaw {
    fn from(predicate: Predicate) -> Self {
        let mut raw = PredicateRaw::default();
        if predicate.params.case_sensitive {
            raw.case_sensitive = Some(true);
        }
        raw.except = predicate.params.except;

        match predicate.op {
            PredicateOp::Compare {
                op,
                field,
                expected,
            } => {
                let leaf = Value::Object(
                    std::iter::once((field.name().to_string(), expected)).collect(),
                );
                match op {
                    CompareOp::Equals => raw.equals = Some(leaf),
                    CompareOp::DeepEquals => raw.deep_equals = Some(leaf),
                    CompareOp::Contains => raw.contains = Some(leaf),
                    CompareOp::StartsWith => raw.starts_with = Some(leaf),
                    CompareOp::EndsWith => raw.ends_with = Some(leaf),
                    CompareOp::Matches => raw.matches = Some(leaf),
                }
            }
            PredicateOp::Exists { field, expected } => {
                raw.exists = Some(Value::Object(
                    std::iter::once((field.name().to_string(), expected)).collect(),
                ));
            }
            PredicateOp::Not(inner) => raw.not = Some(Box::new((*inner).into())),
            PredicateOp::And(children) => {
                raw.and = Some(children.into_iter().map(Into::into).collect())
            }
            PredicateOp::Or(children) => {
                raw.or = Some(children.into_iter().map(Into::into).collect())
            }
        }
        raw
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// True iff every predicate in the list matches (vacuously true when empty).
pub fn matches_all(predicates: &[Predicate], request: &NormalizedRequest) -> bool {
    predicates.iter().all(|p| evaluate(p, request))
}

/// Evaluate one predicate against a request. Total; never fails.
pub fn evaluate(predicate: &Predicate, request: &NormalizedRequest) -> bool {
    let params = &predicate.params;
    match &predicate.op {
        PredicateOp::Compare {
            op,
            field,
            expected,
        } => match field {
            FieldSelector::Method => {
                compare_scalar(*op, expected, request.method.as_deref().unwrap_or(""), params)
            }
            FieldSelector::Path => compare_scalar(*op, expected, &request.path, params),
            FieldSelector::Body => {
                compare_scalar(*op, expected, request.body.as_deref().unwrap_or(""), params)
            }
            FieldSelector::Query => {
                // Query values arrive decoded from the transport; expected
                // fragments may still carry percent-escapes.
                let expected = decode_query_fragment(expected);
                compare_mapping(*op, &expected, &request.query, false, params)
            }
            FieldSelector::Headers => {
                compare_mapping(*op, expected, &request.headers, true, params)
            }
        },
        PredicateOp::Exists { field, expected } => check_exists(*field, expected, request),
        PredicateOp::Not(inner) => !evaluate(inner, request),
        // `and` with zero children is true, `or` with zero children is false.
        PredicateOp::And(children) => children.iter().all(|p| evaluate(p, request)),
        PredicateOp::Or(children) => children.iter().any(|p| evaluate(p, request)),
    }
}

/// URL-decode the string values of a query fragment; undecodable values are
/// compared as written.
fn decode_query_fragment(expected: &Value) -> Value {
    match expected {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| match v {
                    Value::String(s) => {
                        let decoded = urlencoding::decode(s)
                            .map(|d| d.into_owned())
                            .unwrap_or_else(|_| s.clone());
                        (k.clone(), Value::String(decoded))
                    }
                    other => (k.clone(), other.clone()),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Strip `except` matches, then case-fold unless case-sensitive.
fn normalize(value: &str, params: &PredicateParams) -> String {
    let stripped = apply_except(value, params);
    if params.case_sensitive {
        stripped
    } else {
        stripped.to_lowercase()
    }
}

fn apply_except(value: &str, params: &PredicateParams) -> String {
    match &params.except {
        // Pattern validity was checked at stub creation.
        Some(pattern) => match regex::Regex::new(pattern) {
            Ok(re) => re.replace_all(value, "").to_string(),
            Err(_) => value.to_string(),
        },
        None => value.to_string(),
    }
}

fn compare_scalar(op: CompareOp, expected: &Value, actual: &str, params: &PredicateParams) -> bool {
    if op == CompareOp::Matches {
        let pattern = match expected {
            Value::String(s) => s.as_str(),
            _ => return false,
        };
        let re = regex::RegexBuilder::new(pattern)
            .case_insensitive(!params.case_sensitive)
            .build();
        return match re {
            Ok(re) => re.is_match(&apply_except(actual, params)),
            Err(_) => false,
        };
    }

    let expected = normalize(&value_to_string(expected), params);
    let actual = normalize(actual, params);
    match op {
        CompareOp::Equals | CompareOp::DeepEquals => expected == actual,
        CompareOp::Contains => actual.contains(&expected),
        CompareOp::StartsWith => actual.starts_with(&expected),
        CompareOp::EndsWith => actual.ends_with(&expected),
        CompareOp::Matches => unreachable!("handled above"),
    }
}

/// Mapping comparison for `query`/`headers` fragments: every expected key must
/// be present (case-insensitively for header names) and its value must
/// satisfy the same comparison. `deepEquals` additionally requires the whole
/// mapping to match, with no extra keys on the actual side.
fn compare_mapping(
    op: CompareOp,
    expected: &Value,
    actual: &HashMap<String, String>,
    keys_case_insensitive: bool,
    params: &PredicateParams,
) -> bool {
    let expected_obj = match expected.as_object() {
        Some(obj) => obj,
        // A scalar fragment against a mapping field never matches.
        None => return false,
    };

    if op == CompareOp::DeepEquals && expected_obj.len() != actual.len() {
        return false;
    }

    expected_obj.iter().all(|(key, expected_val)| {
        let found = actual
            .iter()
            .find(|(k, _)| {
                if keys_case_insensitive {
                    k.eq_ignore_ascii_case(key)
                } else {
                    k.as_str() == key
                }
            })
            .map(|(_, v)| v.as_str());
        match found {
            Some(actual_val) => compare_scalar(op, expected_val, actual_val, params),
            None => false,
        }
    })
}

fn check_exists(field: FieldSelector, expected: &Value, request: &NormalizedRequest) -> bool {
    match field {
        FieldSelector::Method => expected.as_bool().unwrap_or(true) == request.method.is_some(),
        FieldSelector::Path => expected.as_bool().unwrap_or(true) == !request.path.is_empty(),
        FieldSelector::Body => {
            let present = request.body.as_deref().map(|b| !b.is_empty()).unwrap_or(false);
            expected.as_bool().unwrap_or(true) == present
        }
        FieldSelector::Query => check_keys_exist(expected, &request.query, false),
        FieldSelector::Headers => check_keys_exist(expected, &request.headers, true),
    }
}

fn check_keys_exist(
    expected: &Value,
    actual: &HashMap<String, String>,
    keys_case_insensitive: bool,
) -> bool {
    match expected {
        Value::Bool(should_exist) => *should_exist == !actual.is_empty(),
        Value::Object(map) => map.iter().all(|(key, should_exist_val)| {
            let should_exist = should_exist_val.as_bool().unwrap_or(true);
            let present = actual.keys().any(|k| {
                if keys_case_insensitive {
                    k.eq_ignore_ascii_case(key)
                } else {
                    k == key
                }
            });
            present == should_exist
        }),
        _ => false,
    }
}
