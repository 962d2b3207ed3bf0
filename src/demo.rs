//! Demo FHIR data source
//!
//! Synthesizes a small, realistic population and answers FHIR search requests
//! against it in memory, so the service can run without an upstream server.
//!
//! The generated data follows simple but plausible patterns:
//! - Normally distributed ages centred on middle age
//! - Weighted gender split with a few unknown/other values
//! - Chronic conditions weighted by prevalence, some resolved
//! - Encounters spread over the preceding 18 months, each with vitals

use std::collections::HashSet;

use chrono::{Duration, NaiveDate};
use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::fhir::ResourceType;
use crate::transport::{Transport, TransportError, TransportResponse};

/// (display, weight)
const CONDITIONS: [(&str, u32); 8] = [
    ("Hypertension", 30),
    ("Type 2 diabetes mellitus", 20),
    ("Asthma", 14),
    ("Hyperlipidemia", 12),
    ("Chronic obstructive pulmonary disease", 8),
    ("Major depressive disorder", 7),
    ("Osteoarthritis", 6),
    ("Migraine", 3),
];

const GENDERS: [(&str, u32); 4] = [("female", 48), ("male", 47), ("other", 2), ("unknown", 3)];

const GIVEN_NAMES: [&str; 10] = [
    "Amara", "Jonas", "Leila", "Mateo", "Priya", "Samuel", "Yuki", "Noah", "Elena", "Kofi",
];

const FAMILY_NAMES: [&str; 10] = [
    "Okafor", "Lindqvist", "Haddad", "Silva", "Raman", "Brooks", "Tanaka", "Meyer", "Popescu", "Mensah",
];

const ENCOUNTER_CLASSES: [(&str, &str); 3] = [
    ("AMB", "ambulatory"),
    ("EMER", "emergency"),
    ("IMP", "inpatient encounter"),
];

/// Months of history generated before the anchor date
const HISTORY_DAYS: i64 = 548;

#[derive(Debug, Clone)]
struct DemoRecord {
    resource_type: ResourceType,
    id: String,
    subject: Option<String>,
    date: Option<NaiveDate>,
    body: Value,
}

/// In-memory FHIR server over a synthetic population
#[derive(Debug, Clone)]
pub struct DemoTransport {
    records: Vec<DemoRecord>,
}

impl DemoTransport {
    /// Generate `patients` synthetic patients with history ending at `anchor`.
    /// The same seed always yields the same population.
    pub fn generate(patients: usize, anchor: NaiveDate, seed: u64) -> Self {
        info!(patients, %anchor, seed, "Generating demo FHIR population");

        let mut rng = StdRng::seed_from_u64(seed);
        let age_distribution = Normal::new(45.0_f64, 20.0).expect("valid normal parameters");
        let heart_rate_noise = Normal::new(74.0_f64, 9.0).expect("valid normal parameters");
        let condition_index =
            WeightedIndex::new(CONDITIONS.iter().map(|(_, w)| *w)).expect("non-empty weights");
        let gender_index =
            WeightedIndex::new(GENDERS.iter().map(|(_, w)| *w)).expect("non-empty weights");

        let mut records = Vec::new();

        for n in 0..patients {
            let patient_id = format!("demo-{}", n + 1);
            let reference = format!("Patient/{}", patient_id);

            let age_years = age_distribution.sample(&mut rng).clamp(0.0, 95.0);
            let birth_date = anchor - Duration::days((age_years * 365.25) as i64);
            let gender = GENDERS[gender_index.sample(&mut rng)].0;
            // Roughly one in twenty records lacks a birth date
            let birth_date_value = (rng.gen::<f64>() >= 0.05)
                .then(|| birth_date.format("%Y-%m-%d").to_string());

            records.push(DemoRecord {
                resource_type: ResourceType::Patient,
                id: patient_id.clone(),
                subject: None,
                date: None,
                body: json!({
                    "resourceType": "Patient",
                    "id": patient_id,
                    "name": [{
                        "given": [GIVEN_NAMES[rng.gen_range(0..GIVEN_NAMES.len())]],
                        "family": FAMILY_NAMES[rng.gen_range(0..FAMILY_NAMES.len())],
                    }],
                    "gender": gender,
                    "birthDate": birth_date_value,
                }),
            });

            for c in 0..rng.gen_range(0..3) {
                let (name, _) = CONDITIONS[condition_index.sample(&mut rng)];
                let recorded = anchor - Duration::days(rng.gen_range(0..HISTORY_DAYS));
                let status = if rng.gen::<f64>() < 0.7 { "active" } else { "resolved" };
                let id = format!("{}-cond-{}", patient_id, c + 1);

                records.push(DemoRecord {
                    resource_type: ResourceType::Condition,
                    id: id.clone(),
                    subject: Some(reference.clone()),
                    date: Some(recorded),
                    body: json!({
                        "resourceType": "Condition",
                        "id": id,
                        "clinicalStatus": { "coding": [{
                            "system": "http://terminology.hl7.org/CodeSystem/condition-clinical",
                            "code": status,
                            "display": status,
                        }]},
                        "code": { "coding": [{ "display": name }], "text": name },
                        "subject": { "reference": reference },
                        "recordedDate": recorded.format("%Y-%m-%d").to_string(),
                    }),
                });
            }

            for e in 0..rng.gen_range(1..5) {
                let day = anchor - Duration::days(rng.gen_range(0..HISTORY_DAYS));
                let start = format!("{}T{:02}:00:00Z", day.format("%Y-%m-%d"), rng.gen_range(8..18));
                let (class_code, class_display) =
                    ENCOUNTER_CLASSES[rng.gen_range(0..ENCOUNTER_CLASSES.len())];
                let id = format!("{}-enc-{}", patient_id, e + 1);

                records.push(DemoRecord {
                    resource_type: ResourceType::Encounter,
                    id: id.clone(),
                    subject: Some(reference.clone()),
                    date: Some(day),
                    body: json!({
                        "resourceType": "Encounter",
                        "id": id,
                        "status": "finished",
                        "class": {
                            "system": "http://terminology.hl7.org/CodeSystem/v3-ActCode",
                            "code": class_code,
                            "display": class_display,
                        },
                        "subject": { "reference": reference },
                        "period": { "start": start, "end": start },
                    }),
                });

                let heart_rate = heart_rate_noise.sample(&mut rng).clamp(45.0, 140.0).round();
                let systolic = rng.gen_range(105.0..165.0_f64).round();
                let diastolic = (systolic * rng.gen_range(0.58..0.7)).round();

                records.push(DemoRecord {
                    resource_type: ResourceType::Observation,
                    id: format!("{}-hr", id),
                    subject: Some(reference.clone()),
                    date: Some(day),
                    body: json!({
                        "resourceType": "Observation",
                        "id": format!("{}-hr", id),
                        "status": "final",
                        "code": { "coding": [{ "system": "http://loinc.org", "code": "8867-4", "display": "Heart rate" }], "text": "Heart rate" },
                        "subject": { "reference": reference },
                        "effectiveDateTime": start,
                        "valueQuantity": { "value": heart_rate, "unit": "beats/minute" },
                    }),
                });

                records.push(DemoRecord {
                    resource_type: ResourceType::Observation,
                    id: format!("{}-bp", id),
                    subject: Some(reference.clone()),
                    date: Some(day),
                    body: json!({
                        "resourceType": "Observation",
                        "id": format!("{}-bp", id),
                        "status": "final",
                        "code": { "coding": [{ "system": "http://loinc.org", "code": "85354-9", "display": "Blood pressure panel" }], "text": "Blood pressure" },
                        "subject": { "reference": reference },
                        "effectiveDateTime": start,
                        "component": [
                            { "code": { "text": "Systolic" }, "valueQuantity": { "value": systolic, "unit": "mmHg" } },
                            { "code": { "text": "Diastolic" }, "valueQuantity": { "value": diastolic, "unit": "mmHg" } }
                        ],
                    }),
                });
            }
        }

        info!(records = records.len(), "Demo FHIR population ready");
        Self { records }
    }

    fn search_records(&self, resource_type: ResourceType, params: &[(String, String)]) -> Vec<&DemoRecord> {
        let mut ids: Option<HashSet<&str>> = None;
        let mut subjects: Option<HashSet<&str>> = None;
        let mut lower: Option<NaiveDate> = None;
        let mut upper: Option<NaiveDate> = None;
        let mut count: Option<usize> = None;
        let mut sort_desc = false;

        for (key, value) in params {
            match key.as_str() {
                "_id" => ids = Some(value.split(',').collect()),
                "subject" => subjects = Some(value.split(',').collect()),
                "_count" => count = value.parse().ok(),
                "_sort" => sort_desc = value == "-date",
                "date" | "recorded-date" => {
                    let parsed = |raw: &str| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok();
                    if let Some(raw) = value.strip_prefix("ge") {
                        lower = parsed(raw);
                    } else if let Some(raw) = value.strip_prefix("le") {
                        upper = parsed(raw);
                    }
                }
                _ => {}
            }
        }

        let mut matches: Vec<&DemoRecord> = self
            .records
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .filter(|r| ids.as_ref().map_or(true, |ids| ids.contains(r.id.as_str())))
            .filter(|r| {
                subjects.as_ref().map_or(true, |subjects| {
                    r.subject.as_deref().is_some_and(|s| subjects.contains(s))
                })
            })
            .filter(|r| match (lower, r.date) {
                (Some(lower), Some(date)) => date >= lower,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .filter(|r| match (upper, r.date) {
                (Some(upper), Some(date)) => date <= upper,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();

        if sort_desc {
            matches.sort_by(|a, b| b.date.cmp(&a.date));
        } else if resource_type == ResourceType::Patient {
            // Newest patients first stands in for `-_lastUpdated`
            matches.reverse();
        }

        if let Some(count) = count {
            matches.truncate(count);
        }
        matches
    }
}

impl Transport for DemoTransport {
    async fn search(
        &self,
        resource_type: ResourceType,
        params: &[(String, String)],
    ) -> Result<TransportResponse, TransportError> {
        let matches = self.search_records(resource_type, params);
        debug!(resource_type = %resource_type, matches = matches.len(), "Serving demo bundle");

        let bundle = json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "total": matches.len(),
            "entry": matches
                .iter()
                .map(|r| json!({
                    "fullUrl": format!("urn:demo:{}/{}", resource_type, r.id),
                    "resource": r.body,
                }))
                .collect::<Vec<_>>(),
        });

        Ok(TransportResponse::ok(bundle.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo() -> DemoTransport {
        DemoTransport::generate(40, NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(), 7)
    }

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = demo();
        let b = demo();
        assert_eq!(a.records.len(), b.records.len());
        assert_eq!(a.records[0].body, b.records[0].body);
    }

    #[test]
    fn test_patient_count_and_id_filter() {
        let demo = demo();
        assert_eq!(demo.search_records(ResourceType::Patient, &[]).len(), 40);

        let found = demo.search_records(
            ResourceType::Patient,
            &params(&[("_id", "demo-1,demo-3,missing")]),
        );
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_date_bounds_and_count() {
        let demo = demo();
        let lower = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let upper = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();

        let encounters = demo.search_records(
            ResourceType::Encounter,
            &params(&[("_count", "100"), ("_sort", "-date"), ("date", "ge2024-01-01"), ("date", "le2024-03-31")]),
        );

        assert!(encounters.len() <= 100);
        assert!(encounters
            .iter()
            .all(|e| e.date.is_some_and(|d| d >= lower && d <= upper)));
        assert!(encounters.windows(2).all(|w| w[0].date >= w[1].date));
    }

    #[test]
    fn test_subject_filter() {
        let demo = demo();
        let observations = demo.search_records(
            ResourceType::Observation,
            &params(&[("subject", "Patient/demo-2")]),
        );

        assert!(!observations.is_empty());
        assert!(observations
            .iter()
            .all(|o| o.subject.as_deref() == Some("Patient/demo-2")));
    }
}
