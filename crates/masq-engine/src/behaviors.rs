//! Post-resolution response behaviors.
//!
//! Behaviors run strictly in declared order after a response is resolved and
//! before it leaves the imposter:
//!
//! - `wait` - delay delivery by a fixed or sampled duration
//! - `decorate` - scripted post-processing (injection-gated)
//! - `copy` - project request fields into response tokens
//! - `lookup` - row lookup in a CSV data source keyed by a request field
//!
//! A failing behavior aborts the pipeline; the failure names the behavior.

use crate::error::EngineError;
use crate::request::{NormalizedRequest, NormalizedResponse};
use crate::scripting;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::time::Duration;

/// One behavior in a stub's post-processing chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Behavior {
    #[serde(rename = "wait")]
    Wait(WaitBehavior),
    #[serde(rename = "decorate")]
    Decorate(String),
    #[serde(rename = "copy")]
    Copy(CopyBehavior),
    #[serde(rename = "lookup")]
    Lookup(LookupBehavior),
}

/// Wait behavior: fixed delay or a uniformly sampled range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WaitBehavior {
    Fixed(u64),
    Range {
        #[serde(rename = "min")]
        min_ms: u64,
        #[serde(rename = "max")]
        max_ms: u64,
    },
}

impl WaitBehavior {
    pub fn duration_ms(&self) -> u64 {
        match self {
            WaitBehavior::Fixed(ms) => *ms,
            WaitBehavior::Range { min_ms, max_ms } => {
                use rand::Rng;
                rand::thread_rng().gen_range(*min_ms..=(*max_ms).max(*min_ms))
            }
        }
    }
}

/// Copy behavior: extract a request value and substitute it for a token in
/// the response body and header values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CopyBehavior {
    pub from: CopySource,
    /// Token replaced in the response, e.g. `"${NAME}"`.
    pub into: String,
    #[serde(rename = "using")]
    pub extraction: ExtractionMethod,
}

/// Request field to copy from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CopySource {
    /// "path", "method", or "body".
    Simple(String),
    /// {"query": "name"} or {"headers": "Content-Type"}.
    Nested(HashMap<String, String>),
}

impl CopySource {
    pub fn extract(&self, request: &NormalizedRequest) -> Option<String> {
        match self {
            CopySource::Simple(field) => match field.as_str() {
                "path" => Some(request.path.clone()),
                "method" => request.method.clone(),
                "body" | "data" => request.body.clone(),
                _ => None,
            },
            CopySource::Nested(map) => {
                if let Some(param) = map.get("query") {
                    request.query.get(param).cloned()
                } else if let Some(header) = map.get("headers") {
                    request.header(header).map(|v| v.to_string())
                } else {
                    None
                }
            }
        }
    }
}

/// Value extraction applied to a copied source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum ExtractionMethod {
    /// First capture group if the pattern has one, whole match otherwise.
    Regex { selector: String },
}

impl ExtractionMethod {
    fn extract(&self, value: &str) -> Result<Option<String>, String> {
        match self {
            ExtractionMethod::Regex { selector } => {
                let re = regex::Regex::new(selector)
                    .map_err(|e| format!("invalid regex '{selector}': {e}"))?;
                Ok(re.captures(value).map(|caps| {
                    caps.get(1)
                        .or_else(|| caps.get(0))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default()
                }))
            }
        }
    }
}

/// Lookup behavior: extract a key from the request, find the matching row in
/// an external CSV source, and substitute row columns into response tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LookupBehavior {
    pub key: LookupKey,
    pub from_data_source: DataSource,
    /// Row token; columns are referenced as `${row}["column"]`.
    pub into: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LookupKey {
    pub from: CopySource,
    #[serde(rename = "using")]
    pub extraction: ExtractionMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub csv: CsvSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CsvSource {
    pub path: String,
    pub key_column: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_delimiter() -> String {
    ",".to_string()
}

// ============================================================================
// Pipeline
// ============================================================================

/// Apply behaviors in declared order. `wait` suspends; everything else is
/// synchronous. The returned response replaces the resolved one.
pub async fn apply(
    behaviors: &[Behavior],
    mut response: NormalizedResponse,
    request: &NormalizedRequest,
    allow_injection: bool,
) -> Result<NormalizedResponse, EngineError> {
    for behavior in behaviors {
        match behavior {
            Behavior::Wait(wait) => {
                tokio::time::sleep(Duration::from_millis(wait.duration_ms())).await;
            }
            Behavior::Decorate(script) => {
                if !allow_injection {
                    return Err(EngineError::InjectionNotAllowed);
                }
                response = scripting::eval_decorate(script, request, &response).map_err(|e| {
                    EngineError::BehaviorError {
                        behavior: "decorate".to_string(),
                        message: e.to_string(),
                    }
                })?;
            }
            Behavior::Copy(copy) => {
                apply_copy(copy, &mut response, request).map_err(|message| {
                    EngineError::BehaviorError {
                        behavior: "copy".to_string(),
                        message,
                    }
                })?;
            }
            Behavior::Lookup(lookup) => {
                apply_lookup(lookup, &mut response, request).map_err(|message| {
                    EngineError::BehaviorError {
                        behavior: "lookup".to_string(),
                        message,
                    }
                })?;
            }
        }
    }
    Ok(response)
}

fn replace_token(response: &mut NormalizedResponse, token: &str, replacement: &str) {
    if let Some(body) = response.body.as_mut() {
        *body = body.replace(token, replacement);
    }
    for value in response.headers.values_mut() {
        *value = value.replace(token, replacement);
    }
}

fn apply_copy(
    copy: &CopyBehavior,
    response: &mut NormalizedResponse,
    request: &NormalizedRequest,
) -> Result<(), String> {
    let source = copy.from.extract(request).unwrap_or_default();
    let extracted = copy.extraction.extract(&source)?.unwrap_or_default();
    replace_token(response, &copy.into, &extracted);
    Ok(())
}

fn apply_lookup(
    lookup: &LookupBehavior,
    response: &mut NormalizedResponse,
    request: &NormalizedRequest,
) -> Result<(), String> {
    let source = lookup.key.from.extract(request).unwrap_or_default();
    let key = lookup
        .key
        .extraction
        .extract(&source)?
        .ok_or_else(|| format!("lookup key not found in request for '{}'", lookup.into))?;

    let row = read_csv_row(&lookup.from_data_source.csv, &key)?;
    let Some(row) = row else {
        // No matching row leaves the response tokens untouched.
        return Ok(());
    };

    for (column, value) in &row {
        replace_token(response, &format!("{}[\"{}\"]", lookup.into, column), value);
        replace_token(response, &format!("{}['{}']", lookup.into, column), value);
    }
    Ok(())
}

/// Find the first CSV row whose key column equals `key`. Header row names
/// the columns.
fn read_csv_row(
    source: &CsvSource,
    key: &str,
) -> Result<Option<HashMap<String, String>>, String> {
    let file = File::open(&source.path)
        .map_err(|e| format!("cannot open data source '{}': {e}", source.path))?;
    let mut lines = BufReader::new(file).lines();

    let header = match lines.next() {
        Some(line) => line.map_err(|e| format!("cannot read '{}': {e}", source.path))?,
        None => return Ok(None),
    };
    let columns: Vec<String> = header
        .split(&source.delimiter)
        .map(|c| c.trim().to_string())
        .collect();
    let key_index = columns
        .iter()
        .position(|c| c == &source.key_column)
        .ok_or_else(|| {
            format!(
                "key column '{}' not present in '{}'",
                source.key_column, source.path
            )
        })?;

    for line in lines {
        let line = line.map_err(|e| format!("cannot read '{}': {e}", source.path))?;
        let values: Vec<&str> = line.split(&source.delimiter).collect();
        if values.get(key_index).map(|v| v.trim()) == Some(key) {
            return Ok(Some(
                columns
                    .iter()
                    .zip(values.iter())
                    .map(|(c, v)| (c.clone(), v.trim().to_string()))
                    .collect(),
            ));
        }
    }
    Ok(None)
}
