//! Parallel micro-agents for the SWOT and interview sections.
//!
//! Five narrow agents each produce one list. They run concurrently through the
//! gate and are joined before a single dependent call synthesizes the two
//! derived strings from the merged SWOT lists. An agent that fails only costs
//! its own field, which falls back to the sentinel.

use std::collections::{BTreeMap, HashSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::anthropic::MessageSender;
use crate::gate::{CallRequest, ResilienceState, ResilientCallGate};
use crate::parser::{DraftParser, ParseError, extract_object, strip_fences};
use crate::report::{InterviewPrepSection, SENTINEL, SwotSection};

/// Marker shared by every category agent's system prompt.
pub const AGENT_ROLE: &str = "focused research micro-agent";
/// Marker of the follow-up synthesis call.
pub const SYNTHESIS_ROLE: &str = "SWOT synthesis analyst";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    Strengths,
    Weaknesses,
    Opportunities,
    Threats,
    LikelyQuestions,
}

impl AgentCategory {
    pub const ALL: [AgentCategory; 5] = [
        AgentCategory::Strengths,
        AgentCategory::Weaknesses,
        AgentCategory::Opportunities,
        AgentCategory::Threats,
        AgentCategory::LikelyQuestions,
    ];

    /// JSON key the agent may use for its list.
    pub fn key(self) -> &'static str {
        match self {
            AgentCategory::Strengths => "strengths",
            AgentCategory::Weaknesses => "weaknesses",
            AgentCategory::Opportunities => "opportunities",
            AgentCategory::Threats => "threats",
            AgentCategory::LikelyQuestions => "likely_questions",
        }
    }

    fn brief(self) -> &'static str {
        match self {
            AgentCategory::Strengths => "internal strengths the company demonstrably has",
            AgentCategory::Weaknesses => "internal weaknesses or limitations the sources mention",
            AgentCategory::Opportunities => "external opportunities open to the company",
            AgentCategory::Threats => "external threats: competitors, regulation, market shifts",
            AgentCategory::LikelyQuestions => {
                "interview questions a candidate is likely to be asked at this company"
            }
        }
    }
}

/// The response shapes an agent may use. Anything else is a parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentPayload {
    /// `{"items": [...]}`
    Items(Vec<String>),
    /// `{"<category>": [...]}`
    Keyed(String, Vec<String>),
    /// `[...]`
    Bare(Vec<String>),
}

impl AgentPayload {
    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        match value {
            Value::Array(items) => string_list(items, "$").map(AgentPayload::Bare),
            Value::Object(map) if map.len() == 1 => {
                let (key, list) = map.into_iter().next().ok_or(ParseError::Extraction)?;
                let Value::Array(items) = list else {
                    return Err(ParseError::Schema(vec![format!("$.{key}: expected array")]));
                };
                let items = string_list(items, &format!("$.{key}"))?;
                if key == "items" {
                    Ok(AgentPayload::Items(items))
                } else {
                    Ok(AgentPayload::Keyed(key, items))
                }
            }
            Value::Object(map) => Err(ParseError::Schema(vec![format!(
                "$: expected exactly one list-valued key, found {}",
                map.len()
            )])),
            _ => Err(ParseError::Schema(vec![
                "$: expected an object or an array".to_string(),
            ])),
        }
    }

    /// The item list, provided the payload belongs to `category`.
    pub fn into_items(self, category: AgentCategory) -> Result<Vec<String>, ParseError> {
        match self {
            AgentPayload::Items(items) | AgentPayload::Bare(items) => Ok(items),
            AgentPayload::Keyed(key, items) if key == category.key() => Ok(items),
            AgentPayload::Keyed(key, _) => Err(ParseError::Schema(vec![format!(
                "$: unexpected key `{key}`, expected `items` or `{}`",
                category.key()
            )])),
        }
    }
}

fn string_list(items: Vec<Value>, path: &str) -> Result<Vec<String>, ParseError> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::String(s) => Ok(s),
            _ => Err(ParseError::Schema(vec![format!("{path}[{i}]: expected string")])),
        })
        .collect()
}

/// Parses one agent's raw text into its item list.
pub fn parse_agent_items(category: AgentCategory, raw: &str) -> Result<Vec<String>, ParseError> {
    let body = strip_fences(raw);
    let array_first = match (body.find('['), body.find('{')) {
        (Some(bracket), Some(brace)) => bracket < brace,
        (Some(_), None) => true,
        _ => false,
    };
    let json = if array_first {
        extract_array(body)
    } else {
        extract_object(body)
    }
    .ok_or(ParseError::Extraction)?;
    let value: Value = serde_json::from_str(json).map_err(|e| ParseError::Json(e.to_string()))?;
    AgentPayload::from_value(value)?.into_items(category)
}

/// Substring from the first `[` to the last `]`, inclusive.
fn extract_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

/// Drops blank items and exact duplicates, keeping first occurrences in order.
pub fn merge_items(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .filter(|item| !item.trim().is_empty())
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}

fn char_total(items: &[String]) -> usize {
    items.iter().map(|i| i.chars().count()).sum()
}

/// Character accounting for one merged field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldMerge {
    pub field: AgentCategory,
    pub raw_chars: usize,
    pub final_chars: usize,
    /// The agent failed and the field holds the sentinel.
    pub fallback: bool,
}

impl FieldMerge {
    pub fn is_lossless(&self) -> bool {
        self.raw_chars == self.final_chars
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub fields: Vec<FieldMerge>,
}

impl MergeReport {
    /// True when every field that had agent output kept all its characters.
    pub fn is_lossless(&self) -> bool {
        self.fields
            .iter()
            .filter(|f| !f.fallback)
            .all(FieldMerge::is_lossless)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DerivedInsights {
    strategic_summary: String,
    preparation_focus: String,
}

/// Inputs shared by every agent prompt.
#[derive(Debug, Clone, Copy)]
pub struct AgentContext<'a> {
    pub company: &'a str,
    pub topic: &'a str,
    pub sources: &'a str,
}

#[derive(Debug, Clone)]
pub struct MicroAgentOutput {
    pub swot: SwotSection,
    pub interview_prep: InterviewPrepSection,
    /// Raw response per category; `None` when the gate gave up.
    pub raw_outputs: BTreeMap<AgentCategory, Option<String>>,
    pub merge_report: MergeReport,
}

pub struct MicroAgentOrchestrator<'g, S> {
    gate: &'g ResilientCallGate<S>,
}

impl<'g, S: MessageSender> MicroAgentOrchestrator<'g, S> {
    pub fn new(gate: &'g ResilientCallGate<S>) -> Self {
        Self { gate }
    }

    pub async fn run(&self, state: &ResilienceState, ctx: AgentContext<'_>) -> MicroAgentOutput {
        let requests: Vec<(AgentCategory, CallRequest)> = AgentCategory::ALL
            .iter()
            .map(|&category| (category, agent_request(category, ctx)))
            .collect();

        // Join barrier: every agent resolves before the synthesis call.
        let responses = futures::future::join_all(
            requests
                .iter()
                .map(|(_, request)| self.gate.submit(state, request)),
        )
        .await;

        let mut raw_outputs = BTreeMap::new();
        let mut merged = BTreeMap::new();
        let mut merge_report = MergeReport::default();

        for ((category, _), raw) in requests.iter().zip(responses) {
            let category = *category;
            let parsed = match raw.as_deref() {
                Some(text) => parse_agent_items(category, text)
                    .map_err(|e| warn!(agent = category.key(), error = %e, "unparseable agent output"))
                    .ok(),
                None => {
                    warn!(agent = category.key(), "agent call returned nothing");
                    None
                }
            };

            let field = match parsed {
                Some(items) => {
                    let final_items = merge_items(&items);
                    let fallback = final_items.is_empty();
                    let entry = FieldMerge {
                        field: category,
                        raw_chars: char_total(&items),
                        final_chars: if fallback { 0 } else { char_total(&final_items) },
                        fallback,
                    };
                    log_merge(&entry);
                    merge_report.fields.push(entry);
                    if fallback { vec![SENTINEL.to_string()] } else { final_items }
                }
                None => {
                    merge_report.fields.push(FieldMerge {
                        field: category,
                        raw_chars: 0,
                        final_chars: 0,
                        fallback: true,
                    });
                    vec![SENTINEL.to_string()]
                }
            };

            merged.insert(category, field);
            raw_outputs.insert(category, raw);
        }

        let mut take = |category| {
            merged
                .remove(&category)
                .unwrap_or_else(|| vec![SENTINEL.to_string()])
        };
        let mut swot = SwotSection {
            strengths: take(AgentCategory::Strengths),
            weaknesses: take(AgentCategory::Weaknesses),
            opportunities: take(AgentCategory::Opportunities),
            threats: take(AgentCategory::Threats),
            ..SwotSection::default()
        };
        let mut interview_prep = InterviewPrepSection {
            likely_questions: take(AgentCategory::LikelyQuestions),
            ..InterviewPrepSection::default()
        };

        let synthesis = synthesis_request(ctx, &swot);
        match self.gate.submit(state, &synthesis).await {
            Some(text) => match DraftParser::parse::<DerivedInsights>(&text) {
                Ok(derived) => {
                    swot.strategic_summary = non_blank_or_sentinel(derived.strategic_summary);
                    interview_prep.preparation_focus = non_blank_or_sentinel(derived.preparation_focus);
                }
                Err(e) => warn!(error = %e, "unparseable synthesis output"),
            },
            None => warn!("synthesis call returned nothing"),
        }

        info!(
            lossless = merge_report.is_lossless(),
            fallbacks = merge_report.fields.iter().filter(|f| f.fallback).count(),
            "micro-agents finished"
        );

        MicroAgentOutput {
            swot,
            interview_prep,
            raw_outputs,
            merge_report,
        }
    }
}

fn log_merge(entry: &FieldMerge) {
    if entry.is_lossless() {
        info!(
            field = entry.field.key(),
            chars = entry.final_chars,
            "lossless merge"
        );
    } else {
        warn!(
            field = entry.field.key(),
            raw_chars = entry.raw_chars,
            final_chars = entry.final_chars,
            "merge changed content length"
        );
    }
}

fn non_blank_or_sentinel(text: String) -> String {
    if text.trim().is_empty() {
        SENTINEL.to_string()
    } else {
        text
    }
}

fn agent_request(category: AgentCategory, ctx: AgentContext<'_>) -> CallRequest {
    let system = format!(
        "You are a {AGENT_ROLE} (category: {key}). List {brief} for {company}. \
         Use only facts stated in the sources. Respond with JSON only: \
         {{\"items\": [\"...\", \"...\"]}}. Return an empty list if the sources say nothing relevant.",
        key = category.key(),
        brief = category.brief(),
        company = ctx.company,
    );
    let user = format!(
        "Company: {}\nFocus: {}\n\nSources:\n{}",
        ctx.company, ctx.topic, ctx.sources
    );
    CallRequest::new(format!("agent:{}", category.key()), system, user)
}

fn synthesis_request(ctx: AgentContext<'_>, swot: &SwotSection) -> CallRequest {
    let system = format!(
        "You are a {SYNTHESIS_ROLE}. From the four lists below write two short strings: \
         `strategic_summary` (what the lists mean together, at most three sentences) and \
         `preparation_focus` (what an interview candidate should prepare, at most two sentences). \
         Respond with JSON only: {{\"strategic_summary\": \"...\", \"preparation_focus\": \"...\"}}."
    );
    let list = |items: &[String]| {
        items
            .iter()
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let user = format!(
        "Company: {}\nFocus: {}\n\nStrengths:\n{}\n\nWeaknesses:\n{}\n\nOpportunities:\n{}\n\nThreats:\n{}",
        ctx.company,
        ctx.topic,
        list(&swot.strengths),
        list(&swot.weaknesses),
        list(&swot.opportunities),
        list(&swot.threats),
    );
    CallRequest::new("synthesis", system, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::testing::{Reply, ScriptedSender};
    use std::time::Duration;

    fn gate(sender: ScriptedSender) -> ResilientCallGate<ScriptedSender> {
        let config = GateConfig {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..GateConfig::default()
        };
        ResilientCallGate::new(sender, config, "test-model", 512)
    }

    fn ctx() -> AgentContext<'static> {
        AgentContext {
            company: "Acme",
            topic: "software engineer",
            sources: "Acme builds anvils.",
        }
    }

    fn marker(category: AgentCategory) -> String {
        format!("category: {})", category.key())
    }

    fn full_script() -> ScriptedSender {
        ScriptedSender::new()
            .route(&marker(AgentCategory::Strengths), [Reply::text(r#"{"items": ["Strong brand", "Loyal customers"]}"#)])
            .route(&marker(AgentCategory::Weaknesses), [Reply::text(r#"```json
{"weaknesses": ["Single factory"]}
```"#)])
            .route(&marker(AgentCategory::Opportunities), [Reply::text(r#"["Export markets"]"#)])
            .route(&marker(AgentCategory::Threats), [Reply::text(r#"{"items": ["Cheaper rivals"]}"#)])
            .route(&marker(AgentCategory::LikelyQuestions), [Reply::text(r#"{"items": ["Why anvils?"]}"#)])
            .route(SYNTHESIS_ROLE, [Reply::text(
                r#"{"strategic_summary": "Brand-led growth.", "preparation_focus": "Know the product line."}"#,
            )])
    }

    #[test]
    fn payload_shapes_are_enumerated() {
        assert_eq!(
            parse_agent_items(AgentCategory::Threats, r#"{"items": ["a"]}"#).unwrap(),
            vec!["a"]
        );
        assert_eq!(
            parse_agent_items(AgentCategory::Threats, r#"{"threats": ["b"]}"#).unwrap(),
            vec!["b"]
        );
        assert_eq!(
            parse_agent_items(AgentCategory::Threats, "```\n[\"c\"]\n```").unwrap(),
            vec!["c"]
        );
        assert_eq!(
            parse_agent_items(AgentCategory::Threats, r#"Here you go: ["d", "e"] Hope it helps."#)
                .unwrap(),
            vec!["d", "e"]
        );
        assert_eq!(
            parse_agent_items(AgentCategory::Threats, r#"Result: {"items": ["f [draft]"]}"#)
                .unwrap(),
            vec!["f [draft]"]
        );
    }

    #[test]
    fn other_shapes_are_parse_failures() {
        for raw in [
            r#"{"strengths": ["wrong key"]}"#,
            r#"{"items": ["a"], "extra": ["b"]}"#,
            r#"{"items": "not a list"}"#,
            r#"{"items": [1, 2]}"#,
            "no json here",
        ] {
            assert!(
                parse_agent_items(AgentCategory::Threats, raw).is_err(),
                "accepted {raw}"
            );
        }
    }

    #[test]
    fn merge_drops_blanks_and_duplicates() {
        let raw = vec!["a".to_string(), "".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(merge_items(&raw), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn all_agents_succeed_and_merge_losslessly() {
        let gate = gate(full_script());
        let state = ResilienceState::new(&GateConfig::default());

        let out = MicroAgentOrchestrator::new(&gate).run(&state, ctx()).await;

        assert_eq!(out.swot.strengths, vec!["Strong brand", "Loyal customers"]);
        assert_eq!(out.swot.weaknesses, vec!["Single factory"]);
        assert_eq!(out.swot.opportunities, vec!["Export markets"]);
        assert_eq!(out.interview_prep.likely_questions, vec!["Why anvils?"]);
        assert_eq!(out.swot.strategic_summary, "Brand-led growth.");
        assert_eq!(out.interview_prep.preparation_focus, "Know the product line.");
        assert!(out.merge_report.is_lossless());
        assert_eq!(out.raw_outputs.len(), 5);
        assert_eq!(gate.sender().requests().len(), 6);
    }

    #[tokio::test]
    async fn failed_agent_only_costs_its_own_field() {
        // Routes match in insertion order, so the specific ones come first.
        let sender = ScriptedSender::new()
            .route(&marker(AgentCategory::Opportunities), [Reply::Status(400, "bad request".into())])
            .route(&marker(AgentCategory::Strengths), [Reply::text(r#"{"items": ["Strong brand"]}"#)])
            .route("category: ", [Reply::text(r#"{"items": ["Something grounded"]}"#)])
            .route(SYNTHESIS_ROLE, [Reply::text(r#"{"strategic_summary": "S", "preparation_focus": "P"}"#)])
            .with_delay(Duration::from_millis(5));
        let gate = gate(sender);
        let state = ResilienceState::new(&GateConfig::default());

        let out = MicroAgentOrchestrator::new(&gate).run(&state, ctx()).await;

        assert_eq!(out.swot.opportunities, vec![SENTINEL]);
        assert_eq!(out.swot.strengths, vec!["Strong brand"]);
        assert_eq!(out.swot.threats, vec!["Something grounded"]);
        assert_eq!(out.raw_outputs[&AgentCategory::Opportunities], None);
        let opp = out
            .merge_report
            .fields
            .iter()
            .find(|f| f.field == AgentCategory::Opportunities)
            .unwrap();
        assert!(opp.fallback);
        assert!(out.merge_report.is_lossless());
    }
}
