//! Grounding verification of a draft report.
//!
//! The [`VerificationLoop`] alternates the [`Evaluator`], which flags claims
//! the sources do not support, and the [`Refiner`], which rewrites or deletes
//! them. The loop is bounded: when the last pass still has findings they are
//! removed deterministically with [`force_delete_hallucinations`].

mod evaluator;
mod refiner;

pub use evaluator::{EVALUATOR_ROLE, EvaluationOutput, Evaluator};
pub use refiner::{REFINER_ROLE, Refiner, force_delete_hallucinations};

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::anthropic::MessageSender;
use crate::config::VerificationConfig;
use crate::gate::{ResilienceState, ResilientCallGate};
use crate::report::{DraftReport, is_placeholder};

/// What the refiner should do with a flagged excerpt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Instruction {
    Rewrite,
    Delete,
}

/// A claim in the draft with no support in the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Finding {
    /// Dot path of the field holding the claim, e.g. `swot.strengths`.
    pub section_path: String,
    /// The unsupported text, quoted from the field.
    pub excerpt: String,
    /// Why the sources do not support it.
    pub reason: String,
    pub instruction: Instruction,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{0} call returned no output")]
    ModelUnavailable(&'static str),

    #[error("draft update failed: {0}")]
    Draft(String),
}

/// Indices of the list items an excerpt refers to.
///
/// Items containing the excerpt (ignoring case) match. Only when there are
/// none may an item quoted whole inside the excerpt match, and then only if it
/// was substantive enough to have been evaluated.
pub(crate) fn matching_items(items: &[String], excerpt: &str, min_chars: usize) -> Vec<usize> {
    let excerpt = excerpt.trim().to_lowercase();
    if excerpt.is_empty() {
        return Vec::new();
    }
    let lowered: Vec<String> = items.iter().map(|i| i.trim().to_lowercase()).collect();

    let forward: Vec<usize> = lowered
        .iter()
        .enumerate()
        .filter(|(_, item)| item.contains(&excerpt))
        .map(|(n, _)| n)
        .collect();
    if !forward.is_empty() {
        return forward;
    }

    lowered
        .iter()
        .enumerate()
        .filter(|(n, item)| {
            !item.is_empty()
                && !is_placeholder(&items[*n], min_chars)
                && excerpt.contains(item.as_str())
        })
        .map(|(n, _)| n)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopEntry {
    pub loop_index: u32,
    pub findings_before: usize,
    pub findings_after: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationLog {
    pub entries: Vec<LoopEntry>,
    /// The run ended through the deterministic force-delete path.
    pub forced_delete: bool,
}

impl VerificationLog {
    pub fn total_loops(&self) -> usize {
        self.entries.len()
    }

    fn record(&mut self, loop_index: u32, findings_before: usize, findings_after: usize) {
        self.entries.push(LoopEntry {
            loop_index,
            findings_before,
            findings_after,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Evaluating,
    Refining,
    Done,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Evaluating => write!(f, "EVALUATING"),
            LoopState::Refining => write!(f, "REFINING"),
            LoopState::Done => write!(f, "DONE"),
        }
    }
}

/// Bounded evaluate/refine cycle.
pub struct VerificationLoop<'g, S> {
    evaluator: Evaluator<'g, S>,
    refiner: Refiner<'g, S>,
    max_loops: u32,
    min_field_chars: usize,
}

impl<'g, S: MessageSender> VerificationLoop<'g, S> {
    pub fn new(gate: &'g ResilientCallGate<S>, config: &VerificationConfig) -> Self {
        Self {
            evaluator: Evaluator::new(gate, config),
            refiner: Refiner::new(gate, config),
            min_field_chars: config.min_field_chars,
            max_loops: config.max_loops.max(1),
        }
    }

    /// Runs the cycle to completion. Errors never escape; they end the run
    /// through the force-delete path instead.
    pub async fn run(
        &self,
        state: &ResilienceState,
        mut draft: DraftReport,
        sources: &str,
    ) -> (DraftReport, VerificationLog) {
        let mut log = VerificationLog::default();
        let mut findings: Vec<Finding> = Vec::new();
        let mut loop_index = 0;
        let mut current = LoopState::Evaluating;

        while current != LoopState::Done {
            current = match current {
                LoopState::Evaluating => {
                    loop_index += 1;
                    match self.evaluator.evaluate(state, &draft, sources).await {
                        Ok(found) if found.is_empty() => {
                            info!(loop_index, "no unsupported claims found");
                            log.record(loop_index, 0, 0);
                            LoopState::Done
                        }
                        Ok(found) => {
                            info!(loop_index, findings = found.len(), "unsupported claims found");
                            findings = found;
                            if loop_index >= self.max_loops {
                                draft = self.force_delete(draft, &findings, &mut log, loop_index);
                                LoopState::Done
                            } else {
                                LoopState::Refining
                            }
                        }
                        Err(e) => {
                            warn!(loop_index, error = %e, "evaluation failed, forcing deletion");
                            draft = self.force_delete(draft, &findings, &mut log, loop_index);
                            LoopState::Done
                        }
                    }
                }
                LoopState::Refining => {
                    match self
                        .refiner
                        .refine(state, draft.clone(), &findings, sources)
                        .await
                    {
                        Ok((refined, unresolved)) => {
                            draft = refined;
                            log.record(loop_index, findings.len(), unresolved.len());
                            LoopState::Evaluating
                        }
                        Err(e) => {
                            warn!(loop_index, error = %e, "refinement failed, forcing deletion");
                            draft = self.force_delete(draft, &findings, &mut log, loop_index);
                            LoopState::Done
                        }
                    }
                }
                LoopState::Done => LoopState::Done,
            };
        }

        info!(
            total_loops = log.total_loops(),
            forced_delete = log.forced_delete,
            "verification finished"
        );
        (draft, log)
    }

    fn force_delete(
        &self,
        draft: DraftReport,
        findings: &[Finding],
        log: &mut VerificationLog,
        loop_index: u32,
    ) -> DraftReport {
        log.record(loop_index, findings.len(), 0);
        log.forced_delete = true;
        force_delete_hallucinations(draft, findings, self.min_field_chars)
    }
}
