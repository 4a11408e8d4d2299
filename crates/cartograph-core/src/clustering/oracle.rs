//! Boundary to the external grouping oracle.
//!
//! The oracle is untrusted: whatever text it returns is decoded exactly once,
//! here, into [`DecodedResponse`]. Everything downstream works on the typed
//! form and never sees raw JSON.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::config::OracleMode;
use crate::errors::OracleError;
use crate::models::ID_SEPARATOR;

pub const OPEN_TAG: &str = "<GROUPED_COMPONENTS>";
pub const CLOSE_TAG: &str = "</GROUPED_COMPONENTS>";

const PACKAGE_KEYWORDS: &[&str] = &[
    "controller",
    "service",
    "repository",
    "model",
    "dto",
    "config",
    "util",
    "helper",
    "handler",
    "processor",
];

// ---------------------------------------------------------------------------
// Oracle trait
// ---------------------------------------------------------------------------

/// An external service that proposes a partition of components into modules.
pub trait GroupingOracle: Send + Sync {
    fn name(&self) -> &str;

    /// Return the raw response text for a grouping request.
    fn propose<'a>(&'a self, request: &'a GroupingRequest)
        -> BoxFuture<'a, Result<String, OracleError>>;
}

/// Oracle that answers from recorded responses keyed by module path.
///
/// Used to replay a previous run offline; a path with no recording is a
/// transport failure.
#[derive(Debug, Clone, Default)]
pub struct ReplayOracle {
    name: String,
    responses: HashMap<String, String>,
}

impl ReplayOracle {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            responses: HashMap::new(),
        }
    }

    pub fn with_response(mut self, module_path: &str, response: &str) -> Self {
        self.responses
            .insert(module_path.to_string(), response.to_string());
        self
    }
}

impl GroupingOracle for ReplayOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose<'a>(
        &'a self,
        request: &'a GroupingRequest,
    ) -> BoxFuture<'a, Result<String, OracleError>> {
        Box::pin(async move {
            self.responses
                .get(&request.module_path)
                .cloned()
                .ok_or_else(|| OracleError::Transport {
                    oracle: self.name.clone(),
                    message: format!("no recorded response for '{}'", request.module_path),
                })
        })
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateEntry {
    /// What the oracle must echo back: the index in index mode, the id in
    /// name mode.
    pub token: String,
    pub id: String,
    pub display: String,
    pub file: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupingRequest {
    pub mode: OracleMode,
    pub module_path: String,
    pub module_name: Option<String>,
    pub candidates: Vec<CandidateEntry>,
    pub include_source: bool,
}

impl GroupingRequest {
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Highest valid index in index mode.
    pub fn max_index(&self) -> usize {
        self.candidates.len().saturating_sub(1)
    }

    /// File-grouped candidate listing for prompt-building adapters.
    ///
    /// ```text
    /// # src/svc/login.py
    /// 	0: Login (auth-service, service)
    /// ```
    pub fn render_listing(&self) -> String {
        let mut order: Vec<&str> = Vec::new();
        let mut by_file: HashMap<&str, Vec<&CandidateEntry>> = HashMap::new();
        for entry in &self.candidates {
            let bucket = by_file.entry(entry.file.as_str()).or_default();
            if bucket.is_empty() {
                order.push(entry.file.as_str());
            }
            bucket.push(entry);
        }

        let mut out = String::new();
        for file in order {
            out.push_str("# ");
            out.push_str(file);
            out.push('\n');
            for entry in by_file.get(file).into_iter().flatten() {
                out.push_str(&format!(
                    "\t{}: {} ({}, {})\n",
                    entry.token,
                    entry.display,
                    module_hint(&entry.id),
                    package_hint(&entry.id)
                ));
                if self.include_source && !entry.source_text.is_empty() {
                    out.push_str("```\n");
                    out.push_str(entry.source_text.trim_end());
                    out.push_str("\n```\n");
                }
            }
            out.push('\n');
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Hints
// ---------------------------------------------------------------------------

/// Short human label for the module an id lives in.
///
/// `deps.oss-lib.openframe-api-service-core.Login` -> `service-core`;
/// ids without a service-like segment fall back to their first segment.
pub fn module_hint(id: &str) -> String {
    let parts: Vec<&str> = id.split(ID_SEPARATOR).collect();
    for part in &parts {
        if part.contains("-service") || part.contains("-api") {
            let dashed: Vec<&str> = part.split('-').collect();
            if dashed.len() >= 2 {
                return dashed[dashed.len() - 2..].join("-");
            }
        }
    }
    parts
        .first()
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Package category of an id (`controller`, `service`, ...).
pub fn package_hint(id: &str) -> String {
    let lower = id.to_lowercase();
    if let Some(keyword) = PACKAGE_KEYWORDS.iter().find(|k| lower.contains(*k)) {
        return keyword.to_string();
    }
    let parts: Vec<&str> = id.split(ID_SEPARATOR).collect();
    if parts.len() >= 2 {
        return parts[parts.len() - 2].to_string();
    }
    "core".to_string()
}

// ---------------------------------------------------------------------------
// Response decoding
// ---------------------------------------------------------------------------

/// One member token as the oracle wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MemberToken {
    /// A JSON integer.
    Index(i64),
    /// A JSON string.
    Name(String),
    /// Anything else (floats, booleans, nested values), kept as JSON text.
    Garbage(String),
}

impl MemberToken {
    pub fn as_text(&self) -> String {
        match self {
            Self::Index(i) => i.to_string(),
            Self::Name(s) | Self::Garbage(s) => s.clone(),
        }
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Index(i),
                None => Self::Garbage(n.to_string()),
            },
            Value::String(s) => Self::Name(s.clone()),
            other => Self::Garbage(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProposedGroup {
    pub name: String,
    pub path: Option<String>,
    pub members: Vec<MemberToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupingResponse {
    pub groups: Vec<ProposedGroup>,
}

impl GroupingResponse {
    pub fn token_count(&self) -> usize {
        self.groups.iter().map(|g| g.members.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedResponse {
    Valid(GroupingResponse),
    Malformed(String),
}

fn extract_payload(raw: &str) -> &str {
    if let Some(start) = raw.find(OPEN_TAG) {
        let body = &raw[start + OPEN_TAG.len()..];
        let end = body.find(CLOSE_TAG).unwrap_or(body.len());
        return body[..end].trim();
    }
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // drop the info string (```json) then the closing fence
        let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
        return body.trim_end().trim_end_matches("```").trim();
    }
    trimmed
}

/// Decode raw oracle text into a typed grouping response.
pub fn decode_response(raw: &str) -> DecodedResponse {
    let payload = extract_payload(raw);
    if payload.is_empty() {
        return DecodedResponse::Malformed("empty response".to_string());
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => return DecodedResponse::Malformed(format!("invalid JSON: {e}")),
    };
    let Value::Object(map) = value else {
        return DecodedResponse::Malformed("top level is not a JSON object".to_string());
    };

    let mut groups = Vec::with_capacity(map.len());
    for (name, body) in map {
        let Value::Object(body) = body else {
            return DecodedResponse::Malformed(format!("group '{name}' is not an object"));
        };
        let Some(Value::Array(members)) = body.get("components") else {
            return DecodedResponse::Malformed(format!(
                "group '{name}' has no components array"
            ));
        };
        let path = match body.get("path") {
            Some(Value::String(p)) => Some(p.clone()),
            _ => None,
        };
        groups.push(ProposedGroup {
            name,
            path,
            members: members.iter().map(MemberToken::from_value).collect(),
        });
    }
    DecodedResponse::Valid(GroupingResponse { groups })
}
