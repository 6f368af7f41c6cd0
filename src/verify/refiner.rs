use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Finding, Instruction, VerifyError, matching_items};
use crate::anthropic::MessageSender;
use crate::config::VerificationConfig;
use crate::gate::{CallRequest, ResilienceState, ResilientCallGate};
use crate::parser::DraftParser;
use crate::report::{DraftReport, Field, SENTINEL};
use crate::schema;

/// Marker of the refiner's system prompt.
pub const REFINER_ROLE: &str = "grounded rewrite editor";

#[derive(Debug, Deserialize, JsonSchema)]
struct Rewrite {
    /// Replacement text supported by the sources; empty when none exists.
    replacement: String,
}

/// Applies evaluator findings to a draft.
pub struct Refiner<'g, S> {
    gate: &'g ResilientCallGate<S>,
    min_field_chars: usize,
}

impl<'g, S: MessageSender> Refiner<'g, S> {
    pub fn new(gate: &'g ResilientCallGate<S>, config: &VerificationConfig) -> Self {
        Self {
            gate,
            min_field_chars: config.min_field_chars,
        }
    }

    /// Applies every finding it can and returns the ones it could not.
    ///
    /// Deletions are local. Rewrites ask the model for replacement text
    /// grounded in `sources`; an empty replacement turns into a deletion.
    pub async fn refine(
        &self,
        state: &ResilienceState,
        mut draft: DraftReport,
        findings: &[Finding],
        sources: &str,
    ) -> Result<(DraftReport, Vec<Finding>), VerifyError> {
        let mut unresolved = Vec::new();

        for finding in findings {
            let Some(field) = draft.field(&finding.section_path) else {
                warn!(path = %finding.section_path, "finding targets unknown section path");
                unresolved.push(finding.clone());
                continue;
            };

            let applied = match finding.instruction {
                Instruction::Delete => delete(&mut draft, finding, field, self.min_field_chars)?,
                Instruction::Rewrite => match self.rewrite_text(state, finding, sources).await {
                    Some(replacement) if replacement.trim().is_empty() => {
                        delete(&mut draft, finding, field, self.min_field_chars)?
                    }
                    Some(replacement) => replace(
                        &mut draft,
                        finding,
                        field,
                        replacement.trim(),
                        self.min_field_chars,
                    )?,
                    None => false,
                },
            };

            if applied {
                debug!(path = %finding.section_path, instruction = ?finding.instruction, "finding applied");
            } else {
                unresolved.push(finding.clone());
            }
        }

        Ok((draft, unresolved))
    }

    async fn rewrite_text(
        &self,
        state: &ResilienceState,
        finding: &Finding,
        sources: &str,
    ) -> Option<String> {
        let system = format!(
            "You are a {REFINER_ROLE}. Rewrite the flagged text so that it states only what \
             the sources support. Keep it about as long as the original. If the sources \
             support nothing in it, return an empty replacement.\n\
             Respond with JSON only, matching this schema:\n{}",
            schema::schema_text::<Rewrite>()
        );
        let user = format!(
            "Sources:\n{sources}\n\nField: {}\nFlagged text: {}\nProblem: {}",
            finding.section_path, finding.excerpt, finding.reason
        );
        let request = CallRequest::new(format!("refine:{}", finding.section_path), system, user);

        let text = self.gate.submit(state, &request).await?;
        match DraftParser::parse::<Rewrite>(&text) {
            Ok(rewrite) => Some(rewrite.replacement),
            Err(e) => {
                warn!(path = %finding.section_path, error = %e, "unparseable rewrite");
                None
            }
        }
    }
}

fn draft_error(e: anyhow::Error) -> VerifyError {
    VerifyError::Draft(e.to_string())
}

/// Removes matching list items or resets a scalar. Returns whether anything changed.
fn delete(
    draft: &mut DraftReport,
    finding: &Finding,
    field: Field,
    min_chars: usize,
) -> Result<bool, VerifyError> {
    match field {
        Field::List(items) => {
            let hits = matching_items(&items, &finding.excerpt, min_chars);
            if hits.is_empty() {
                return Ok(false);
            }
            draft
                .set_field(&finding.section_path, Field::List(without(items, &hits)))
                .map_err(draft_error)?;
        }
        Field::Scalar(_) => {
            draft
                .clear_field(&finding.section_path)
                .map_err(draft_error)?;
        }
    }
    Ok(true)
}

/// Puts `replacement` where the excerpt was. Returns whether anything changed.
///
/// Only the excerpt is swapped when the text quotes it; otherwise the whole
/// item or scalar is replaced.
fn replace(
    draft: &mut DraftReport,
    finding: &Finding,
    field: Field,
    replacement: &str,
    min_chars: usize,
) -> Result<bool, VerifyError> {
    let updated = match field {
        Field::List(mut items) => {
            let hits = matching_items(&items, &finding.excerpt, min_chars);
            if hits.is_empty() {
                return Ok(false);
            }
            for n in hits {
                items[n] = splice(&items[n], &finding.excerpt, replacement)
                    .unwrap_or_else(|| replacement.to_string());
            }
            Field::List(items)
        }
        Field::Scalar(text) => Field::Scalar(
            splice(&text, &finding.excerpt, replacement).unwrap_or_else(|| replacement.to_string()),
        ),
    };
    draft
        .set_field(&finding.section_path, updated)
        .map_err(draft_error)?;
    Ok(true)
}

/// Replaces the first occurrence of `excerpt` in `text`, ignoring ASCII case.
fn splice(text: &str, excerpt: &str, replacement: &str) -> Option<String> {
    let excerpt = excerpt.trim();
    if excerpt.is_empty() {
        return None;
    }
    // ASCII lowercasing keeps byte offsets, so `start` is valid in `text`.
    let start = text
        .find(excerpt)
        .or_else(|| text.to_ascii_lowercase().find(&excerpt.to_ascii_lowercase()))?;
    let end = start + excerpt.len();
    Some(format!("{}{replacement}{}", &text[..start], &text[end..]))
}

fn without(items: Vec<String>, hits: &[usize]) -> Vec<String> {
    items
        .into_iter()
        .enumerate()
        .filter(|(n, _)| !hits.contains(n))
        .map(|(_, item)| item)
        .collect()
}

/// Removes the target of every finding without consulting the model.
///
/// Scalars are reset to the sentinel. List items matching the excerpt are
/// removed; when none match, the whole list is reset.
pub fn force_delete_hallucinations(
    mut draft: DraftReport,
    findings: &[Finding],
    min_chars: usize,
) -> DraftReport {
    for finding in findings {
        let result = match draft.field(&finding.section_path) {
            Some(Field::List(items)) => {
                let hits = matching_items(&items, &finding.excerpt, min_chars);
                if hits.is_empty() {
                    draft.clear_field(&finding.section_path)
                } else {
                    draft.set_field(&finding.section_path, Field::List(without(items, &hits)))
                }
            }
            Some(Field::Scalar(_)) => draft.set_field(
                &finding.section_path,
                Field::Scalar(SENTINEL.to_string()),
            ),
            None => {
                warn!(path = %finding.section_path, "cannot force-delete unknown section path");
                continue;
            }
        };
        if let Err(e) = result {
            warn!(path = %finding.section_path, error = %e, "force delete failed");
        }
    }
    draft
}
