//! Typed company-analysis report.
//!
//! A [`DraftReport`] has four sections of scalar and list fields. Every field
//! starts out as [`SENTINEL`] and is only replaced by grounded content.
//! Fields are addressed by dot paths such as `swot.strengths`.

use anyhow::{Context, Result, bail};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema;

/// Placeholder for fields nothing could be extracted for.
pub const SENTINEL: &str = "insufficient information";

fn sentinel() -> String {
    SENTINEL.to_string()
}

fn sentinel_list() -> Vec<String> {
    vec![sentinel()]
}

/// Company overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OverviewSection {
    /// Two or three sentence description of the company.
    pub summary: String,
    /// How the company makes money.
    pub business_model: String,
    /// Main products or services.
    pub products: Vec<String>,
    /// Competitive position in its market.
    pub market_position: String,
}

impl Default for OverviewSection {
    fn default() -> Self {
        Self {
            summary: sentinel(),
            business_model: sentinel(),
            products: sentinel_list(),
            market_position: sentinel(),
        }
    }
}

/// Working culture as described by the sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CultureSection {
    /// Stated or observed company values.
    pub values: Vec<String>,
    /// Day-to-day working style.
    pub work_style: String,
    /// What employees say about working there.
    pub employee_sentiment: String,
}

impl Default for CultureSection {
    fn default() -> Self {
        Self {
            values: sentinel_list(),
            work_style: sentinel(),
            employee_sentiment: sentinel(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SwotSection {
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub opportunities: Vec<String>,
    pub threats: Vec<String>,
    /// One-paragraph synthesis of the four lists.
    pub strategic_summary: String,
}

impl Default for SwotSection {
    fn default() -> Self {
        Self {
            strengths: sentinel_list(),
            weaknesses: sentinel_list(),
            opportunities: sentinel_list(),
            threats: sentinel_list(),
            strategic_summary: sentinel(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct InterviewPrepSection {
    pub likely_questions: Vec<String>,
    /// What a candidate should prepare to talk about.
    pub preparation_focus: String,
}

impl Default for InterviewPrepSection {
    fn default() -> Self {
        Self {
            likely_questions: sentinel_list(),
            preparation_focus: sentinel(),
        }
    }
}

/// The part of the report produced by the single structured generation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompanyProfile {
    pub overview: OverviewSection,
    pub culture: CultureSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DraftReport {
    pub overview: OverviewSection,
    pub culture: CultureSection,
    pub swot: SwotSection,
    pub interview_prep: InterviewPrepSection,
}

/// Value of one report field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Scalar(String),
    List(Vec<String>),
}

impl Field {
    fn into_value(self) -> Value {
        match self {
            Field::Scalar(s) => Value::String(s),
            Field::List(items) => Value::Array(items.into_iter().map(Value::String).collect()),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Field::Scalar(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(Field::List),
            _ => None,
        }
    }
}

/// True for values that carry no claim worth checking.
pub fn is_placeholder(value: &str, min_chars: usize) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case(SENTINEL)
        || trimmed.chars().count() < min_chars
}

fn pointer(path: &str) -> String {
    format!("/{}", path.replace('.', "/"))
}

impl DraftReport {
    pub fn assemble(
        profile: CompanyProfile,
        swot: SwotSection,
        interview_prep: InterviewPrepSection,
    ) -> Self {
        Self {
            overview: profile.overview,
            culture: profile.culture,
            swot,
            interview_prep,
        }
    }

    /// Every addressable field path, taken from the generated schema.
    pub fn field_paths() -> Vec<String> {
        schema::leaf_paths::<DraftReport>()
    }

    pub fn field(&self, path: &str) -> Option<Field> {
        let value = serde_json::to_value(self).ok()?;
        value.pointer(&pointer(path)).and_then(Field::from_value)
    }

    /// Replaces one field, keeping its kind. An emptied list becomes `[SENTINEL]`.
    pub fn set_field(&mut self, path: &str, field: Field) -> Result<()> {
        let mut value = serde_json::to_value(&*self).context("failed to serialize draft")?;
        let slot = value
            .pointer_mut(&pointer(path))
            .with_context(|| format!("unknown section path `{path}`"))?;

        let field = match field {
            Field::List(items) if items.is_empty() => Field::List(sentinel_list()),
            other => other,
        };
        match (&*slot, &field) {
            (Value::String(_), Field::Scalar(_)) | (Value::Array(_), Field::List(_)) => {}
            _ => bail!("field kind mismatch at `{path}`"),
        }
        *slot = field.into_value();

        *self = serde_json::from_value(value).context("failed to rebuild draft")?;
        Ok(())
    }

    /// Resets a field to its sentinel default.
    pub fn clear_field(&mut self, path: &str) -> Result<()> {
        match self.field(path) {
            Some(Field::Scalar(_)) => self.set_field(path, Field::Scalar(sentinel())),
            Some(Field::List(_)) => self.set_field(path, Field::List(sentinel_list())),
            None => bail!("unknown section path `{path}`"),
        }
    }

    /// Fields holding real content, as `(path, field)` pairs.
    ///
    /// List placeholders are filtered item by item; a field left with nothing
    /// is omitted.
    pub fn substantive_fields(&self, min_chars: usize) -> Vec<(String, Field)> {
        Self::field_paths()
            .into_iter()
            .filter_map(|path| {
                let field = match self.field(&path)? {
                    Field::Scalar(s) if is_placeholder(&s, min_chars) => return None,
                    Field::List(items) => {
                        let kept: Vec<String> = items
                            .into_iter()
                            .filter(|i| !is_placeholder(i, min_chars))
                            .collect();
                        if kept.is_empty() {
                            return None;
                        }
                        Field::List(kept)
                    }
                    scalar => scalar,
                };
                Some((path, field))
            })
            .collect()
    }
}
