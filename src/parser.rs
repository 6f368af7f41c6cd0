//! Defensive extraction of structured output from model text.
//!
//! Models wrap JSON in prose and code fences. [`DraftParser::parse`] strips
//! fences (keeping the longest fenced body), cuts from the first `{` to the last
//! `}`, checks the JSON against the schema generated from the target type and
//! only then deserializes it.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::schema;

/// Violations quoted in a schema error.
const MAX_REPORTED_VIOLATIONS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no JSON object found in model output")]
    Extraction,

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("schema violations: {}", .0.join("; "))]
    Schema(Vec<String>),
}

pub struct DraftParser;

impl DraftParser {
    /// Extracts and validates a `T` from raw model text.
    pub fn parse<T>(raw: &str) -> Result<T, ParseError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let body = strip_fences(raw);
        let json = extract_object(body).ok_or(ParseError::Extraction)?;
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ParseError::Json(e.to_string()))?;

        let mut violations = schema::violations::<T>(&value);
        if !violations.is_empty() {
            violations.truncate(MAX_REPORTED_VIOLATIONS);
            return Err(ParseError::Schema(violations));
        }

        serde_json::from_value(value).map_err(|e| ParseError::Schema(vec![e.to_string()]))
    }

    /// The original prompt followed by a correction that quotes the error.
    pub fn build_retry_prompt(original: &str, error: &ParseError) -> String {
        format!(
            "{original}\n\n\
             Your previous response could not be used: {error}.\n\
             Respond again with a single JSON object that matches the schema exactly. \
             Do not add commentary before or after the JSON."
        )
    }
}

/// Returns the longest fenced body, or the input when it has no complete fence.
pub fn strip_fences(raw: &str) -> &str {
    let mut longest: Option<&str> = None;
    let mut rest = raw;

    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        // The opening fence line may carry a language tag.
        let Some(line_end) = after_open.find('\n') else {
            break;
        };
        let body_start = &after_open[line_end + 1..];
        let Some(close) = body_start.find("```") else {
            break;
        };
        let body = &body_start[..close];
        if longest.is_none_or(|current| body.len() > current.len()) {
            longest = Some(body);
        }
        rest = &body_start[close + 3..];
    }

    longest.unwrap_or(raw).trim()
}

/// Substring from the first `{` to the last `}`, inclusive.
pub fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
