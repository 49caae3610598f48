//! Intent wire format and extraction from free-form oracle replies.
//!
//! The oracle is untrusted. A reply may wrap its JSON in prose or a markdown
//! fence, but it must contain exactly one JSON object; anything else is
//! rejected rather than coerced. The object is then checked against the
//! embedded intent schema before typed deserialization.

use std::sync::LazyLock;

use jsonschema::Draft;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::validator::Rejection;

const INTENT_SCHEMA: &str = include_str!("../../schemas/intent.schema.json");

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\n?(.*?)\n?```\s*$").unwrap());

static INTENT_VALIDATOR: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(INTENT_SCHEMA).expect("intent schema is valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("intent schema compiles")
});

/// The step the oracle proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    #[serde(alias = "host_check")]
    HostReachability,
    PortScan,
    ServiceDetect,
    OsFingerprint,
    #[serde(alias = "finish")]
    Done,
}

impl IntentKind {
    /// Parse a declared kind, accepting the documented aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(Value::String(raw.to_string())).ok()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IntentKind::HostReachability => "host_reachability",
            IntentKind::PortScan => "port_scan",
            IntentKind::ServiceDetect => "service_detect",
            IntentKind::OsFingerprint => "os_fingerprint",
            IntentKind::Done => "done",
        }
    }
}

/// Recognized intent parameters, normalized to trimmed strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntentParams {
    pub range: Option<String>,
    pub scope: Option<String>,
}

impl IntentParams {
    pub fn is_empty(&self) -> bool {
        self.range.is_none() && self.scope.is_none()
    }
}

/// One parsed oracle proposal. `reason`, `reasoning` and `plan` are carried for logging only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub params: IntentParams,
    pub reason: Option<String>,
    pub reasoning: Option<String>,
    pub plan: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortSpec {
    Text(String),
    Number(u64),
}

impl PortSpec {
    fn into_text(self) -> String {
        match self {
            PortSpec::Text(text) => text,
            PortSpec::Number(number) => number.to_string(),
        }
    }
}

#[derive(Deserialize, Default)]
struct RawParams {
    #[serde(default, alias = "port_range", alias = "portRange")]
    range: Option<PortSpec>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct RawIntent {
    #[serde(alias = "kind")]
    intent: IntentKind,
    #[serde(default)]
    params: Option<RawParams>,
    #[serde(default, alias = "port_range", alias = "portRange")]
    range: Option<PortSpec>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    plan: Option<String>,
}

/// Extract the single JSON object embedded in an oracle reply.
pub fn extract_object(reply: &str) -> Result<Map<String, Value>, Rejection> {
    let text = reply.trim();
    if text.is_empty() {
        return Err(Rejection::NoObject);
    }
    let body = FENCE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map_or(text, |inner| inner.as_str().trim());

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => return Ok(map),
        Ok(_) => return Err(Rejection::Malformed("reply is JSON but not an object".to_string())),
        Err(_) => {}
    }

    let spans = object_spans(body);
    if spans.is_empty() {
        return Err(Rejection::NoObject);
    }
    let mut objects: Vec<Map<String, Value>> = spans
        .iter()
        .filter_map(|span| match serde_json::from_str::<Value>(span) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
        .collect();
    match objects.len() {
        0 => Err(Rejection::Malformed(
            "no well-formed JSON object in reply".to_string(),
        )),
        1 => Ok(objects.remove(0)),
        count => Err(Rejection::Ambiguous(count)),
    }
}

/// Declared kind string (`intent`, or `kind`), before any validation.
pub fn declared_kind(object: &Map<String, Value>) -> Option<&str> {
    object
        .get("intent")
        .or_else(|| object.get("kind"))
        .and_then(Value::as_str)
        .map(str::trim)
}

/// Check the extracted object against the intent schema and build the typed intent.
pub fn parse_intent(object: Map<String, Value>) -> Result<Intent, Rejection> {
    let value = Value::Object(object);
    let violations: Vec<String> = INTENT_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !violations.is_empty() {
        return Err(Rejection::Schema(violations));
    }
    let raw: RawIntent =
        serde_json::from_value(value).map_err(|err| Rejection::Malformed(err.to_string()))?;

    let nested = raw.params.unwrap_or_default();
    let params = IntentParams {
        range: nested
            .range
            .or(raw.range)
            .map(PortSpec::into_text)
            .and_then(non_empty),
        scope: nested.scope.or(raw.scope).and_then(non_empty),
    };
    Ok(Intent {
        kind: raw.intent,
        params,
        reason: raw.reason.and_then(non_empty),
        reasoning: raw.reasoning.and_then(non_empty),
        plan: raw.plan.and_then(non_empty),
    })
}

/// Top-level `{...}` spans, tracking JSON strings only inside a span.
///
/// An unterminated trailing span is returned as-is so it counts as malformed.
fn object_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if depth == 0 {
            if ch == '{' {
                depth = 1;
                start = idx;
            }
            continue;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=idx]);
                }
            }
            _ => {}
        }
    }
    if depth > 0 {
        spans.push(&text[start..]);
    }
    spans
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
