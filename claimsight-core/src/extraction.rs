//! Structured policy extraction: field model and model-output decoding.
//!
//! A language model is asked to return a JSON object describing a policy.
//! The reply is decoded strictly: surrounding code fences are removed and
//! the remainder must be a single JSON object, otherwise the caller gets
//! `RagError::Parse`. Extraction flows turn that error into
//! [`ExtractionResult::degraded`] so they still return a usable record.

use crate::error::{RagError, Result};
use chrono::NaiveDate;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coarse trust label for an extracted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::Low => write!(f, "low"),
        }
    }
}

/// Derive an overall label: `low` if any field is low or nothing was
/// assessed, `high` if every field is high, `medium` otherwise.
pub fn overall_confidence<'a>(levels: impl IntoIterator<Item = &'a Confidence>) -> Confidence {
    let mut assessed = false;
    let mut all_high = true;
    for level in levels {
        assessed = true;
        match level {
            Confidence::Low => return Confidence::Low,
            Confidence::Medium => all_high = false,
            Confidence::High => {}
        }
    }
    match (assessed, all_high) {
        (false, _) => Confidence::Low,
        (true, true) => Confidence::High,
        (true, false) => Confidence::Medium,
    }
}

/// Fields the extractor knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtractionField {
    PlanName,
    Deductible,
    ReimbursementRate,
    AnnualLimit,
    PerIncidentLimit,
    MonthlyPremium,
    WaitingPeriods,
    CoveredServices,
    Exclusions,
    EffectiveDate,
    ExpirationDate,
}

impl ExtractionField {
    pub const ALL: [ExtractionField; 11] = [
        ExtractionField::PlanName,
        ExtractionField::Deductible,
        ExtractionField::ReimbursementRate,
        ExtractionField::AnnualLimit,
        ExtractionField::PerIncidentLimit,
        ExtractionField::MonthlyPremium,
        ExtractionField::WaitingPeriods,
        ExtractionField::CoveredServices,
        ExtractionField::Exclusions,
        ExtractionField::EffectiveDate,
        ExtractionField::ExpirationDate,
    ];

    /// JSON key of the field.
    pub fn key(self) -> &'static str {
        match self {
            ExtractionField::PlanName => "planName",
            ExtractionField::Deductible => "deductible",
            ExtractionField::ReimbursementRate => "reimbursementRate",
            ExtractionField::AnnualLimit => "annualLimit",
            ExtractionField::PerIncidentLimit => "perIncidentLimit",
            ExtractionField::MonthlyPremium => "monthlyPremium",
            ExtractionField::WaitingPeriods => "waitingPeriods",
            ExtractionField::CoveredServices => "coveredServices",
            ExtractionField::Exclusions => "exclusions",
            ExtractionField::EffectiveDate => "effectiveDate",
            ExtractionField::ExpirationDate => "expirationDate",
        }
    }

    /// Fixed search phrase used to find evidence for this field.
    pub fn topic_phrase(self) -> &'static str {
        match self {
            ExtractionField::PlanName => "plan name policy type coverage level",
            ExtractionField::Deductible => "deductible amount annual per incident",
            ExtractionField::ReimbursementRate => "reimbursement rate percentage coinsurance",
            ExtractionField::AnnualLimit => "annual maximum benefit limit coverage cap unlimited",
            ExtractionField::PerIncidentLimit => "per incident per condition maximum payout limit",
            ExtractionField::MonthlyPremium => "monthly premium cost price payment",
            ExtractionField::WaitingPeriods => "waiting period days accident illness orthopedic",
            ExtractionField::CoveredServices => "covered services treatments benefits included",
            ExtractionField::Exclusions => "exclusions not covered pre-existing conditions limitations",
            ExtractionField::EffectiveDate => "policy effective date start of coverage",
            ExtractionField::ExpirationDate => "policy expiration date renewal term end",
        }
    }
}

/// A monetary cap that may be unlimited.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitValue {
    Amount(f64),
    Unlimited,
}

impl Serialize for LimitValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            LimitValue::Amount(amount) => serializer.serialize_f64(*amount),
            LimitValue::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for LimitValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(LimitValue::Amount(n)),
            Raw::Text(s) if s.trim().eq_ignore_ascii_case("unlimited") => Ok(LimitValue::Unlimited),
            Raw::Text(s) => Err(de::Error::custom(format!(
                "expected a number or \"unlimited\", found \"{s}\""
            ))),
        }
    }
}

/// Waiting periods in days. Invalid entries are dropped rather than nulled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingPeriods {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accident: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub illness: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orthopedic: Option<u32>,
}

impl WaitingPeriods {
    pub fn is_empty(&self) -> bool {
        self.accident.is_none() && self.illness.is_none() && self.orthopedic.is_none()
    }
}

/// Validated policy values. `None` means absent or rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyFields {
    pub plan_name: Option<String>,
    pub deductible: Option<f64>,
    pub reimbursement_rate: Option<f64>,
    pub annual_limit: Option<LimitValue>,
    pub per_incident_limit: Option<LimitValue>,
    pub monthly_premium: Option<f64>,
    pub waiting_periods: Option<WaitingPeriods>,
    pub covered_services: Option<Vec<String>>,
    pub exclusions: Option<Vec<String>>,
    pub effective_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
}

impl PolicyFields {
    /// Whether `field` holds a value worth citing.
    pub fn is_present(&self, field: ExtractionField) -> bool {
        match field {
            ExtractionField::PlanName => self.plan_name.is_some(),
            ExtractionField::Deductible => self.deductible.is_some(),
            ExtractionField::ReimbursementRate => self.reimbursement_rate.is_some(),
            ExtractionField::AnnualLimit => self.annual_limit.is_some(),
            ExtractionField::PerIncidentLimit => self.per_incident_limit.is_some(),
            ExtractionField::MonthlyPremium => self.monthly_premium.is_some(),
            ExtractionField::WaitingPeriods => {
                self.waiting_periods.as_ref().is_some_and(|w| !w.is_empty())
            }
            ExtractionField::CoveredServices => {
                self.covered_services.as_ref().is_some_and(|v| !v.is_empty())
            }
            ExtractionField::Exclusions => self.exclusions.as_ref().is_some_and(|v| !v.is_empty()),
            ExtractionField::EffectiveDate => self.effective_date.is_some(),
            ExtractionField::ExpirationDate => self.expiration_date.is_some(),
        }
    }

    pub fn present_fields(&self) -> Vec<ExtractionField> {
        ExtractionField::ALL
            .into_iter()
            .filter(|f| self.is_present(*f))
            .collect()
    }
}

/// Page/reference pointer supporting a field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub page_number: Option<u32>,
    pub chunk_id: Option<String>,
}

/// A validated extraction with per-field confidence and citations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    #[serde(flatten)]
    pub fields: PolicyFields,
    #[serde(default)]
    pub field_confidence: BTreeMap<ExtractionField, Confidence>,
    #[serde(default)]
    pub citations: BTreeMap<ExtractionField, Vec<Citation>>,
    /// Set when the model output could not be decoded and this record is a
    /// placeholder.
    #[serde(default)]
    pub degraded: bool,
}

impl ExtractionResult {
    /// Placeholder returned when model output is unusable: every field
    /// empty, overall confidence `low`.
    pub fn degraded() -> Self {
        Self {
            degraded: true,
            ..Default::default()
        }
    }

    pub fn overall_confidence(&self) -> Confidence {
        overall_confidence(self.field_confidence.values())
    }

    pub fn confidence_of(&self, field: ExtractionField) -> Option<Confidence> {
        self.field_confidence.get(&field).copied()
    }
}

/// Strip a surrounding Markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json) along with the opening fence.
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest.strip_prefix("json").unwrap_or(rest),
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Decode model output that must be a single JSON object.
pub fn parse_json_object(text: &str) -> Result<serde_json::Value> {
    let body = strip_code_fences(text);
    if body.is_empty() {
        return Err(RagError::parse("model returned an empty response"));
    }
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| RagError::parse(format!("response is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(RagError::parse(format!(
            "expected a JSON object, found {}",
            json_kind(&value)
        )));
    }
    Ok(value)
}

/// Decode model output into a typed response.
pub fn decode_response<T: DeserializeOwned>(text: &str) -> Result<T> {
    let value = parse_json_object(text)?;
    serde_json::from_value(value)
        .map_err(|e| RagError::parse(format!("response does not match the expected schema: {e}")))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
