//! Artifact schemas and iteration-envelope validation.
//!
//! The iteration envelope is the one artifact produced by untrusted agent
//! output, so it gets a lenient salvage pass (extract the largest balanced
//! JSON object, repair trivial malformations) followed by strict validation.
//! Salvage is preprocessing only; the validated shape is never relaxed and a
//! document that parses cleanly is used verbatim.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

/// Iteration-envelope validation failures. Any of these disqualify the track
/// with `SchemaDrift`.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no JSON object found in agent output")]
    NoObject,

    #[error("envelope is not valid JSON: {0}")]
    Json(String),

    #[error("envelope field `hypothesis` must be a non-empty string")]
    EmptyHypothesis,

    #[error("envelope field `confidence` must be within [0.0, 1.0], got {0}")]
    ConfidenceRange(f64),
}

/// Agent-declared progress signal for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusSignal {
    Continue,
    SkipToVerify,
    NeedsMoreWork,
    Done,
    Blocked,
}

/// The per-iteration artifact every track must produce (`ITERATION.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationEnvelope {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub hypothesis: String,
    pub experiments: Vec<serde_json::Value>,
    pub proposed_changes: Vec<serde_json::Value>,
    pub confidence: f64,
    pub status_signal: StatusSignal,
    pub observations: Vec<String>,
    #[serde(default)]
    pub patch_present: bool,
}

fn schema_version() -> u32 {
    1
}

/// Run metadata, persisted once at session start (`RUN.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub run_id: String,
    pub mode: crate::config::Mode,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub issue_text: Option<String>,
    pub tracks: Vec<crate::config::TrackConfig>,
    pub config_digest: String,
    #[serde(default)]
    pub container: bool,
}

/// Overall session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "FAIL")]
    Fail,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Running => "RUNNING",
            RunState::Ok => "OK",
            RunState::Done => "DONE",
            RunState::Fail => "FAIL",
        }
    }
}

/// Mutable single-writer status record (`RUN_STATUS.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub run_id: String,
    pub mode: crate::config::Mode,
    pub status: RunState,
    pub phase: String,
    pub message: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub disqualified_tracks: Vec<String>,
}

impl RunStatus {
    pub fn new(run_id: &str, mode: crate::config::Mode, status: RunState, phase: &str) -> Self {
        Self {
            schema_version: 1,
            run_id: run_id.to_string(),
            mode,
            status,
            phase: phase.to_string(),
            message: String::new(),
            updated_at: chrono::Utc::now(),
            disqualified_tracks: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Validation record written alongside each iteration (`CHECK_iterate.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRecord {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub name: String,
    pub ok: bool,
    pub exit_code: i32,
    pub details: String,
}

/// Provision timestamp marker (`tracks/<name>/PROVISION.json`), read by the
/// judge for tie-breaking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRecord {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub track: String,
    pub provisioned_at: chrono::DateTime<chrono::Utc>,
}

/// Validate agent output into an iteration envelope.
///
/// A document that parses strictly as-is is used without modification. Only
/// when that fails does the salvage pass run.
pub fn validate_iteration(text: &str) -> Result<IterationEnvelope, ValidationError> {
    let envelope: IterationEnvelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(_) => {
            let candidate = salvage_object(text).ok_or(ValidationError::NoObject)?;
            serde_json::from_str(&candidate)
                .or_else(|_| {
                    let repaired = repair_json(&candidate);
                    serde_json::from_str(&repaired)
                })
                .map_err(|e| ValidationError::Json(e.to_string()))?
        }
    };
    check_invariants(&envelope)?;
    Ok(envelope)
}

/// Validate an already-parsed JSON value (adapter-extracted envelopes).
pub fn validate_iteration_value(
    value: &serde_json::Value,
) -> Result<IterationEnvelope, ValidationError> {
    let envelope: IterationEnvelope = serde_json::from_value(value.clone())
        .map_err(|e| ValidationError::Json(e.to_string()))?;
    check_invariants(&envelope)?;
    Ok(envelope)
}

fn check_invariants(envelope: &IterationEnvelope) -> Result<(), ValidationError> {
    if envelope.hypothesis.trim().is_empty() {
        return Err(ValidationError::EmptyHypothesis);
    }
    if !(0.0..=1.0).contains(&envelope.confidence) || envelope.confidence.is_nan() {
        return Err(ValidationError::ConfidenceRange(envelope.confidence));
    }
    Ok(())
}

/// Extract the largest balanced `{...}` block from free-form text.
///
/// Brace depth is tracked outside of string literals, honoring escapes, so
/// braces inside values do not confuse the scan. Code fences are stripped
/// first.
pub fn salvage_object(text: &str) -> Option<String> {
    let text = strip_code_fences(text);
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = scan_balanced(bytes, i) {
                let len = end - i;
                if best.is_none_or(|(s, e)| len > e - s) {
                    best = Some((i, end));
                }
                i = end;
                continue;
            }
        }
        i += 1;
    }
    best.map(|(s, e)| text[s..e].to_string())
}

fn scan_balanced(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Repair trivially malformed JSON: trailing commas and unquoted keys.
fn repair_json(text: &str) -> String {
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    static UNQUOTED_KEY: OnceLock<Regex> = OnceLock::new();
    let trailing = TRAILING_COMMA.get_or_init(|| Regex::new(r",\s*([}\]])").unwrap());
    let unquoted =
        UNQUOTED_KEY.get_or_init(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap());
    let out = trailing.replace_all(text, "$1");
    unquoted.replace_all(&out, "$1\"$2\":").into_owned()
}
