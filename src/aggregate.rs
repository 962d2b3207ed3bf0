//! Cross-reference aggregation
//!
//! Collects the patient ids referenced by clinical resources and builds the
//! immutable, patient-indexed [`ProcessedData`] for one fetch cycle.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::debug;

use crate::fhir::{Condition, Encounter, HasSubject, Observation, Patient, Reference};

/// Label for a reference with no matching patient
pub const UNKNOWN_PATIENT: &str = "Unknown Patient";

/// Bare ids of every patient referenced as a subject, deduplicated and sorted.
///
/// Resources without a subject, or whose subject is not a Patient, contribute
/// nothing.
pub fn referenced_patient_ids(
    observations: &[Observation],
    conditions: &[Condition],
    encounters: &[Encounter],
) -> BTreeSet<String> {
    let subjects = observations
        .iter()
        .map(HasSubject::subject_reference)
        .chain(conditions.iter().map(HasSubject::subject_reference))
        .chain(encounters.iter().map(HasSubject::subject_reference));

    subjects
        .flatten()
        .filter(|reference| reference.is_patient())
        .map(|reference| reference.id().to_string())
        .collect()
}

fn group_by_subject<R: HasSubject + Clone>(resources: &[R]) -> HashMap<Reference, Vec<R>> {
    let mut groups: HashMap<Reference, Vec<R>> = HashMap::new();
    for resource in resources {
        if let Some(reference) = resource.subject_reference() {
            groups
                .entry(reference.clone())
                .or_default()
                .push(resource.clone());
        }
    }
    groups
}

/// One fully cross-indexed dataset. Never mutated after [`ProcessedData::build`].
#[derive(Debug, Clone, Default)]
pub struct ProcessedData {
    pub patients: Vec<Patient>,
    pub observations: Vec<Observation>,
    pub conditions: Vec<Condition>,
    pub encounters: Vec<Encounter>,
    patient_map: HashMap<Reference, Patient>,
    observation_map: HashMap<Reference, Vec<Observation>>,
    condition_map: HashMap<Reference, Vec<Condition>>,
    encounter_map: HashMap<Reference, Vec<Encounter>>,
}

impl ProcessedData {
    pub fn build(
        patients: Vec<Patient>,
        observations: Vec<Observation>,
        conditions: Vec<Condition>,
        encounters: Vec<Encounter>,
    ) -> Self {
        let patient_map = patients
            .iter()
            .map(|p| (Reference::patient(p.id.clone()), p.clone()))
            .collect();
        let observation_map = group_by_subject(&observations);
        let condition_map = group_by_subject(&conditions);
        let encounter_map = group_by_subject(&encounters);

        debug!(
            patients = patients.len(),
            observations = observations.len(),
            conditions = conditions.len(),
            encounters = encounters.len(),
            "Built processed dataset"
        );

        Self {
            patients,
            observations,
            conditions,
            encounters,
            patient_map,
            observation_map,
            condition_map,
            encounter_map,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
            && self.observations.is_empty()
            && self.conditions.is_empty()
            && self.encounters.is_empty()
    }

    pub fn patient(&self, reference: &Reference) -> Option<&Patient> {
        self.patient_map.get(reference)
    }

    pub fn observations_for(&self, reference: &Reference) -> &[Observation] {
        self.observation_map
            .get(reference)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn conditions_for(&self, reference: &Reference) -> &[Condition] {
        self.condition_map
            .get(reference)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn encounters_for(&self, reference: &Reference) -> &[Encounter] {
        self.encounter_map
            .get(reference)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Name for a subject reference; dangling references render as unknown.
    pub fn patient_display_name(&self, reference: &Reference) -> String {
        self.patient(reference)
            .and_then(Patient::display_name)
            .unwrap_or_else(|| UNKNOWN_PATIENT.to_string())
    }

    /// Encounters with a subject, newest period start first. Starts are
    /// compared as instants, so differing UTC offsets order correctly;
    /// encounters without a parseable start sort last.
    pub fn timeline(&self) -> Vec<&Encounter> {
        let mut timeline: Vec<(Option<DateTime<Utc>>, &Encounter)> = self
            .encounters
            .iter()
            .filter(|e| e.subject_reference().is_some())
            .map(|e| (e.period_start().and_then(start_instant), e))
            .collect();

        timeline.sort_by(|(a, _), (b, _)| match (a, b) {
            (Some(a), Some(b)) => b.cmp(a),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        timeline.into_iter().map(|(_, e)| e).collect()
    }
}

/// FHIR `dateTime` to an instant. Values without an offset are read as UTC
/// and date-only values as midnight UTC.
fn start_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(instant.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
