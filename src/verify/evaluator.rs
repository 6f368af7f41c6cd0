use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Finding, VerifyError, matching_items};
use crate::anthropic::MessageSender;
use crate::config::VerificationConfig;
use crate::gate::{CallRequest, ResilienceState, ResilientCallGate};
use crate::parser::DraftParser;
use crate::report::{DraftReport, Field};
use crate::schema;

/// Marker of the evaluator's system prompt.
pub const EVALUATOR_ROLE: &str = "grounding auditor";

/// Shape the evaluator must answer with.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct EvaluationOutput {
    /// Unsupported claims; empty when everything is grounded.
    pub findings: Vec<Finding>,
}

/// Flags draft claims with no textual support in the sources.
pub struct Evaluator<'g, S> {
    gate: &'g ResilientCallGate<S>,
    scope: Vec<String>,
    min_field_chars: usize,
}

impl<'g, S: MessageSender> Evaluator<'g, S> {
    /// Scope defaults to every field path of [`DraftReport`]; configured paths
    /// that do not exist in the report are ignored.
    pub fn new(gate: &'g ResilientCallGate<S>, config: &VerificationConfig) -> Self {
        let all = DraftReport::field_paths();
        let scope = if config.scope.is_empty() {
            all
        } else {
            let (known, unknown): (Vec<String>, Vec<String>) =
                config.scope.iter().cloned().partition(|p| all.contains(p));
            if !unknown.is_empty() {
                warn!(?unknown, "ignoring unknown verification scope paths");
            }
            known
        };
        Self {
            gate,
            scope,
            min_field_chars: config.min_field_chars,
        }
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    /// Returns the findings for the in-scope, substantive fields of `draft`.
    ///
    /// Unparseable evaluator output yields no findings. A call the gate gave
    /// up on is an error, so the caller never mistakes it for a clean draft.
    pub async fn evaluate(
        &self,
        state: &ResilienceState,
        draft: &DraftReport,
        sources: &str,
    ) -> Result<Vec<Finding>, VerifyError> {
        let fields: BTreeMap<String, Field> = draft
            .substantive_fields(self.min_field_chars)
            .into_iter()
            .filter(|(path, _)| self.scope.contains(path))
            .collect();
        if fields.is_empty() {
            debug!("nothing substantive to evaluate");
            return Ok(Vec::new());
        }

        let request = self.request(&fields, sources);
        let text = self
            .gate
            .submit(state, &request)
            .await
            .ok_or(VerifyError::ModelUnavailable("evaluator"))?;

        let output = match DraftParser::parse::<EvaluationOutput>(&text) {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "unparseable evaluator output, treating as no findings");
                return Ok(Vec::new());
            }
        };

        let mut findings: Vec<Finding> = Vec::new();
        for finding in output.findings {
            if !applies_to(&finding, &fields, self.min_field_chars) {
                debug!(path = %finding.section_path, "discarding finding outside evaluated fields");
                continue;
            }
            if !findings.contains(&finding) {
                findings.push(finding);
            }
        }
        Ok(findings)
    }

    fn request(&self, fields: &BTreeMap<String, Field>, sources: &str) -> CallRequest {
        let payload: serde_json::Map<String, Value> = fields
            .iter()
            .map(|(path, field)| {
                let value = match field {
                    Field::Scalar(s) => Value::String(s.clone()),
                    Field::List(items) => {
                        Value::Array(items.iter().cloned().map(Value::String).collect())
                    }
                };
                (path.clone(), value)
            })
            .collect();
        let draft_json =
            serde_json::to_string_pretty(&Value::Object(payload)).unwrap_or_default();
        let paths = fields.keys().cloned().collect::<Vec<_>>().join(", ");

        let system = format!(
            "You are a {EVALUATOR_ROLE}. Compare each claim in the draft fields against the \
             sources. Flag only claims that have no textual support in the sources; do not \
             flag style, tone or missing information. Quote the unsupported text exactly as \
             `excerpt`. Use `rewrite` when a grounded version of the claim exists in the \
             sources and `delete` otherwise.\n\
             Allowed section_path values: {paths}\n\
             Respond with JSON only, matching this schema:\n{}",
            schema::schema_text::<EvaluationOutput>()
        );
        let user = format!("Sources:\n{sources}\n\nDraft fields:\n{draft_json}");
        CallRequest::new("evaluator", system, user)
    }
}

/// Whether a finding targets text that was actually evaluated.
fn applies_to(
    finding: &Finding,
    fields: &BTreeMap<String, Field>,
    min_chars: usize,
) -> bool {
    if finding.excerpt.trim().is_empty() {
        return false;
    }
    match fields.get(&finding.section_path) {
        Some(Field::Scalar(_)) => true,
        Some(Field::List(items)) => {
            !matching_items(items, &finding.excerpt, min_chars).is_empty()
        }
        None => false,
    }
}
