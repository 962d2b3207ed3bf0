//! Analytics reducer
//!
//! Pure reduction of a [`ProcessedData`] into the statistics the dashboard
//! and the narrative summary consume. No I/O; the reference instant is passed
//! in so results are deterministic.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;

use crate::aggregate::ProcessedData;
use crate::fhir::{Condition, Encounter, Observation, Patient, Reference};

/// Milliseconds in a 365.25-day year
pub const MS_PER_YEAR: f64 = 3.15576e10;

/// How many conditions the ranking keeps
pub const TOP_CONDITIONS: usize = 5;

/// Age buckets by inclusive upper bound; the last one is open-ended
pub const AGE_GROUPS: [(&str, Option<i64>); 4] = [
    ("0-18", Some(18)),
    ("19-40", Some(40)),
    ("41-60", Some(60)),
    ("60+", None),
];

const RECENT_VITALS_WINDOW: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedCount {
    pub name: String,
    pub value: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgeGroupCount {
    pub name: String,
    pub patients: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConditionCount {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub date: String,
    pub count: usize,
}

/// Statistical summary of one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total_patients: usize,
    pub total_encounters: usize,
    pub total_observations: usize,
    pub total_conditions: usize,
    pub active_cases: usize,
    pub resolved_cases: usize,
    pub gender_data: Vec<NamedCount>,
    pub age_group_data: Vec<AgeGroupCount>,
    pub top_conditions: Vec<ConditionCount>,
    pub encounter_trend: Vec<TrendPoint>,
}

/// Whole years between `birth_date` and `as_of` on a 365.25-day year.
///
/// `None` when the birth date is missing or not an ISO date.
pub fn age_in_years(birth_date: Option<&str>, as_of: DateTime<Utc>) -> Option<i64> {
    let birth = parse_birth_date(birth_date?)?;
    let elapsed_ms = (as_of - birth.and_utc()).num_milliseconds() as f64;
    Some((elapsed_ms / MS_PER_YEAR).floor() as i64)
}

fn parse_birth_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    // FHIR allows partial dates; fill missing parts with January / the 1st
    let date = match raw.len() {
        4 => NaiveDate::parse_from_str(&format!("{raw}-01-01"), "%Y-%m-%d").ok(),
        7 => NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d").ok(),
        _ => NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok(),
    }?;
    date.and_hms_opt(0, 0, 0)
}

fn age_group(age: i64) -> &'static str {
    AGE_GROUPS
        .iter()
        .find(|(_, upper)| upper.map_or(true, |upper| age <= upper))
        .map(|(name, _)| *name)
        .unwrap_or("60+")
}

/// Count occurrences of each key, keeping first-seen order.
fn count_in_order<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<(&'a str, usize)> {
    let mut order: Vec<(&str, usize)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for key in keys {
        let i = *index.entry(key).or_insert_with(|| {
            order.push((key, 0));
            order.len() - 1
        });
        order[i].1 += 1;
    }
    order
}

fn gender_distribution(patients: &[Patient]) -> Vec<NamedCount> {
    count_in_order(
        patients
            .iter()
            .map(|p| p.gender.as_ref().map_or("unknown", |g| g.as_str())),
    )
    .into_iter()
    .map(|(name, value)| NamedCount {
        name: name.to_string(),
        value,
    })
    .collect()
}

fn age_distribution(patients: &[Patient], as_of: DateTime<Utc>) -> Vec<AgeGroupCount> {
    let mut buckets: Vec<AgeGroupCount> = AGE_GROUPS
        .iter()
        .map(|(name, _)| AgeGroupCount {
            name: name.to_string(),
            patients: 0,
        })
        .collect();

    for age in patients
        .iter()
        .filter_map(|p| age_in_years(p.birth_date.as_deref(), as_of))
    {
        let group = age_group(age);
        if let Some(bucket) = buckets.iter_mut().find(|b| b.name == group) {
            bucket.patients += 1;
        }
    }
    buckets
}

/// Top conditions by count; ties keep first-encountered order.
fn top_conditions(conditions: &[Condition]) -> Vec<ConditionCount> {
    let mut counts = count_in_order(conditions.iter().filter_map(Condition::display_name));
    // sort_by is stable, so equal counts stay in encounter order
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
        .into_iter()
        .take(TOP_CONDITIONS)
        .map(|(name, count)| ConditionCount {
            name: name.to_string(),
            count,
        })
        .collect()
}

fn encounter_trend(encounters: &[Encounter]) -> Vec<TrendPoint> {
    let mut by_date: BTreeMap<&str, usize> = BTreeMap::new();
    for start in encounters.iter().filter_map(Encounter::period_start) {
        let date = start.split('T').next().unwrap_or(start);
        *by_date.entry(date).or_insert(0) += 1;
    }

    by_date
        .into_iter()
        .map(|(date, count)| TrendPoint {
            date: date.to_string(),
            count,
        })
        .collect()
}

fn count_status(conditions: &[Condition], status: &str) -> usize {
    conditions
        .iter()
        .filter(|c| c.clinical_status_code() == Some(status))
        .count()
}

/// Reduce a dataset to its statistics as of `as_of`.
pub fn reduce(data: &ProcessedData, as_of: DateTime<Utc>) -> Statistics {
    Statistics {
        total_patients: data.patients.len(),
        total_encounters: data.encounters.len(),
        total_observations: data.observations.len(),
        total_conditions: data.conditions.len(),
        active_cases: count_status(&data.conditions, "active"),
        resolved_cases: count_status(&data.conditions, "resolved"),
        gender_data: gender_distribution(&data.patients),
        age_group_data: age_distribution(&data.patients, as_of),
        top_conditions: top_conditions(&data.conditions),
        encounter_trend: encounter_trend(&data.encounters),
    }
}

/// One vital sign line for the patient summary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalReading {
    pub name: String,
    /// e.g. `72.00 beats/minute` or `Systolic: 120.00 mmHg, Diastolic: 80.00 mmHg`
    pub value: String,
    pub effective_date: Option<String>,
}

/// Up to five distinct named vitals drawn from the first five observations.
///
/// Single-valued observations use their quantity; panel observations (blood
/// pressure) join their component quantities. Observations without a usable
/// name or value are skipped.
pub fn recent_vitals(observations: &[Observation]) -> Vec<VitalReading> {
    let mut vitals: Vec<VitalReading> = Vec::new();

    for obs in observations.iter().take(RECENT_VITALS_WINDOW) {
        let Some(name) = obs.code.display_name() else {
            continue;
        };
        if vitals.iter().any(|v| v.name == name) {
            continue;
        }

        let value = if let Some(quantity) = &obs.value_quantity {
            Some(format_quantity(quantity.value, quantity.unit.as_deref()))
        } else {
            let parts: Vec<String> = obs
                .component
                .iter()
                .filter_map(|c| {
                    let quantity = c.value_quantity.as_ref()?;
                    let label = c.code.display_name().unwrap_or("Component");
                    Some(format!(
                        "{}: {}",
                        label,
                        format_quantity(quantity.value, quantity.unit.as_deref())
                    ))
                })
                .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        };

        if let Some(value) = value {
            vitals.push(VitalReading {
                name: name.to_string(),
                value,
                effective_date: obs
                    .effective_date_time
                    .as_deref()
                    .map(|d| d.split('T').next().unwrap_or(d).to_string()),
            });
        }
    }

    vitals
}

fn format_quantity(value: f64, unit: Option<&str>) -> String {
    match unit {
        Some(unit) if !unit.is_empty() => format!("{:.2} {}", value, unit),
        _ => format!("{:.2}", value),
    }
}

/// Drill-down view of one patient
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientDetail {
    pub id: String,
    pub name: String,
    pub gender: String,
    pub age: Option<i64>,
    pub birth_date: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub active_conditions: Vec<String>,
    pub recent_vitals: Vec<VitalReading>,
    pub observations: Vec<Observation>,
    pub conditions: Vec<Condition>,
    pub encounters: Vec<Encounter>,
}

/// Row of the patient list
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientSummaryRow {
    pub id: String,
    pub name: String,
    pub gender: String,
    pub age: Option<i64>,
}

pub fn patient_rows(data: &ProcessedData, as_of: DateTime<Utc>) -> Vec<PatientSummaryRow> {
    data.patients
        .iter()
        .map(|p| PatientSummaryRow {
            id: p.id.clone(),
            name: data.patient_display_name(&Reference::patient(p.id.clone())),
            gender: p
                .gender
                .as_ref()
                .map_or("unknown", |g| g.as_str())
                .to_string(),
            age: age_in_years(p.birth_date.as_deref(), as_of),
        })
        .collect()
}

/// Gather everything known about one patient. `None` when the patient is not
/// part of the dataset.
pub fn patient_detail(
    data: &ProcessedData,
    patient_id: &str,
    as_of: DateTime<Utc>,
) -> Option<PatientDetail> {
    let reference = Reference::patient(patient_id);
    let patient = data.patient(&reference)?;
    let conditions = data.conditions_for(&reference);
    let observations = data.observations_for(&reference);
    let address = patient.address.first();

    Some(PatientDetail {
        id: patient.id.clone(),
        name: data.patient_display_name(&reference),
        gender: patient
            .gender
            .as_ref()
            .map_or("unknown", |g| g.as_str())
            .to_string(),
        age: age_in_years(patient.birth_date.as_deref(), as_of),
        birth_date: patient.birth_date.clone(),
        city: address.and_then(|a| a.city.clone()),
        country: address.and_then(|a| a.country.clone()),
        active_conditions: conditions
            .iter()
            .filter_map(Condition::display_name)
            .map(str::to_string)
            .collect(),
        recent_vitals: recent_vitals(observations),
        observations: observations.to_vec(),
        conditions: conditions.to_vec(),
        encounters: data.encounters_for(&reference).to_vec(),
    })
}
