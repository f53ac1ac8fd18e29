//! Confidence validation of raw model extractions.
//!
//! Each known field is checked against its domain rule. A passing field is
//! kept and marked `high`; a failing one is reset to `None` and marked
//! `low`. Missing and `null` fields are skipped entirely, so they neither
//! raise nor lower the overall confidence.

use crate::extraction::{
    Confidence, ExtractionField, ExtractionResult, LimitValue, PolicyFields, WaitingPeriods,
};
use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Validate a raw extraction object.
///
/// Non-object input yields an empty result with overall confidence `low`.
pub fn validate(raw: &Value) -> ExtractionResult {
    let empty = Map::new();
    let object = raw.as_object().unwrap_or(&empty);
    let mut report = Report::default();

    let mut fields = PolicyFields {
        plan_name: report.assess(object, ExtractionField::PlanName, |v| {
            pass_fail(non_empty_string(v))
        }),
        deductible: report.assess(object, ExtractionField::Deductible, |v| {
            pass_fail(non_negative(v))
        }),
        reimbursement_rate: report.assess(object, ExtractionField::ReimbursementRate, |v| {
            pass_fail(percentage(v))
        }),
        annual_limit: report.assess(object, ExtractionField::AnnualLimit, |v| pass_fail(limit(v))),
        per_incident_limit: report.assess(object, ExtractionField::PerIncidentLimit, |v| {
            pass_fail(limit(v))
        }),
        monthly_premium: report.assess(object, ExtractionField::MonthlyPremium, |v| {
            pass_fail(non_negative(v))
        }),
        waiting_periods: report.assess(object, ExtractionField::WaitingPeriods, waiting_periods),
        covered_services: report.assess(object, ExtractionField::CoveredServices, string_list),
        exclusions: report.assess(object, ExtractionField::Exclusions, string_list),
        effective_date: report.assess(object, ExtractionField::EffectiveDate, |v| {
            pass_fail(date(v))
        }),
        expiration_date: report.assess(object, ExtractionField::ExpirationDate, |v| {
            pass_fail(date(v))
        }),
    };

    if let (Some(effective), Some(expiration)) = (fields.effective_date, fields.expiration_date)
        && expiration < effective
    {
        debug!(%effective, %expiration, "Expiration precedes effective date");
        fields.expiration_date = None;
        report.mark(ExtractionField::EffectiveDate, Confidence::Low);
        report.mark(ExtractionField::ExpirationDate, Confidence::Low);
    }

    ExtractionResult {
        fields,
        field_confidence: report.confidence,
        citations: BTreeMap::new(),
        degraded: false,
    }
}

#[derive(Default)]
struct Report {
    confidence: BTreeMap<ExtractionField, Confidence>,
}

impl Report {
    fn assess<T>(
        &mut self,
        object: &Map<String, Value>,
        field: ExtractionField,
        check: impl FnOnce(&Value) -> (Option<T>, Option<Confidence>),
    ) -> Option<T> {
        let value = object.get(field.key()).filter(|v| !v.is_null())?;
        let (kept, confidence) = check(value);
        if let Some(confidence) = confidence {
            if confidence == Confidence::Low {
                debug!(field = field.key(), "Field failed validation");
            }
            self.mark(field, confidence);
        }
        kept
    }

    fn mark(&mut self, field: ExtractionField, confidence: Confidence) {
        self.confidence.insert(field, confidence);
    }
}

fn pass_fail<T>(value: Option<T>) -> (Option<T>, Option<Confidence>) {
    match value {
        Some(v) => (Some(v), Some(Confidence::High)),
        None => (None, Some(Confidence::Low)),
    }
}

fn non_empty_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn non_negative(value: &Value) -> Option<f64> {
    value.as_f64().filter(|n| n.is_finite() && *n >= 0.0)
}

fn percentage(value: &Value) -> Option<f64> {
    value.as_f64().filter(|n| (0.0..=100.0).contains(n))
}

fn limit(value: &Value) -> Option<LimitValue> {
    match value.as_str() {
        Some(text) => text
            .trim()
            .eq_ignore_ascii_case("unlimited")
            .then_some(LimitValue::Unlimited),
        None => non_negative(value).map(LimitValue::Amount),
    }
}

fn date(value: &Value) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.as_str()?.trim(), DATE_FORMAT).ok()
}

fn day_count(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

/// Sub-fields are checked individually; any invalid one is dropped and the
/// whole object is marked `low`. An object with nothing set is not assessed.
fn waiting_periods(value: &Value) -> (Option<WaitingPeriods>, Option<Confidence>) {
    let Some(object) = value.as_object() else {
        return (None, Some(Confidence::Low));
    };

    let mut any_invalid = false;
    let mut sub_field = |key: &str| -> Option<u32> {
        let raw = object.get(key).filter(|v| !v.is_null())?;
        let parsed = day_count(raw);
        if parsed.is_none() {
            debug!(sub_field = key, "Dropping invalid waiting period");
            any_invalid = true;
        }
        parsed
    };

    let periods = WaitingPeriods {
        accident: sub_field("accident"),
        illness: sub_field("illness"),
        orthopedic: sub_field("orthopedic"),
    };

    match (periods.is_empty(), any_invalid) {
        (true, false) => (None, None),
        (true, true) => (None, Some(Confidence::Low)),
        (false, true) => (Some(periods), Some(Confidence::Low)),
        (false, false) => (Some(periods), Some(Confidence::High)),
    }
}

fn string_list(value: &Value) -> (Option<Vec<String>>, Option<Confidence>) {
    let Some(items) = value.as_array() else {
        return (None, Some(Confidence::Low));
    };
    let kept: Vec<String> = items.iter().filter_map(non_empty_string).collect();
    if kept.len() == items.len() {
        (Some(kept), Some(Confidence::High))
    } else if kept.is_empty() {
        (None, Some(Confidence::Low))
    } else {
        (Some(kept), Some(Confidence::Medium))
    }
}
