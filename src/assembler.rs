//! Period data assembly
//!
//! Orchestrates the fetcher, the period resolver and the aggregator to produce
//! one complete [`ProcessedData`] per period. Any fetch failure aborts the
//! whole assembly; no partial dataset leaves this module.

use futures::try_join;
use tracing::{info, instrument};

use crate::aggregate::{referenced_patient_ids, ProcessedData};
use crate::error::{AppError, AppResult, FetchError};
use crate::fetcher::{FhirClient, FhirQuery};
use crate::fhir::{Condition, Encounter, Observation, Patient, Reference};
use crate::period::DateRange;
use crate::transport::Transport;

/// Count ceilings per query
pub mod limits {
    pub const PERIOD_OBSERVATIONS: usize = 200;
    pub const PERIOD_CONDITIONS: usize = 200;
    pub const PERIOD_ENCOUNTERS: usize = 100;
    pub const OVERALL_PATIENTS: usize = 200;
    pub const OVERALL_RESOURCES: usize = 500;
}

pub const RANGE_FAILURE_MESSAGE: &str =
    "Failed to fetch FHIR data for the selected range. Please try again later.";
pub const OVERALL_FAILURE_MESSAGE: &str =
    "Failed to fetch overall FHIR data. Please try again later.";

/// Current period and its comparison period
#[derive(Debug, Clone)]
pub struct PeriodPair {
    pub current: ProcessedData,
    pub previous: ProcessedData,
}

pub struct PeriodAssembler<T> {
    client: FhirClient<T>,
}

impl<T> Clone for PeriodAssembler<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<T: Transport> PeriodAssembler<T> {
    pub fn new(client: FhirClient<T>) -> Self {
        Self { client }
    }

    #[cfg(test)]
    pub fn client(&self) -> &FhirClient<T> {
        &self.client
    }

    /// Fetch the three clinical resource types for `range` concurrently, then
    /// the patients they reference.
    ///
    /// Conditions are only bounded below (`recorded-date`); the upper bound is
    /// not sent for them.
    #[instrument(skip(self, range), fields(range = %range))]
    pub async fn fetch_period(&self, range: DateRange) -> Result<ProcessedData, FetchError> {
        let (start, end) = range.interval();

        let observation_query = FhirQuery::new()
            .count(limits::PERIOD_OBSERVATIONS)
            .sort("-date")
            .date_between(start, end);
        let condition_query = FhirQuery::new()
            .count(limits::PERIOD_CONDITIONS)
            .recorded_on_or_after(start);
        let encounter_query = FhirQuery::new()
            .count(limits::PERIOD_ENCOUNTERS)
            .sort("-date")
            .date_between(start, end);

        let (observations, conditions, encounters) = try_join!(
            self.client.fetch::<Observation>(&observation_query),
            self.client.fetch::<Condition>(&condition_query),
            self.client.fetch::<Encounter>(&encounter_query),
        )?;

        let patient_ids = referenced_patient_ids(&observations, &conditions, &encounters);
        let patients = self.fetch_patients_by_id(&patient_ids).await?;

        info!(
            patients = patients.len(),
            observations = observations.len(),
            conditions = conditions.len(),
            encounters = encounters.len(),
            "Assembled period dataset"
        );

        Ok(ProcessedData::build(
            patients,
            observations,
            conditions,
            encounters,
        ))
    }

    /// Patients for exactly `ids`. No request is made for an empty set.
    pub async fn fetch_patients_by_id<'a, I>(&self, ids: I) -> Result<Vec<Patient>, FetchError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let ids: Vec<&str> = ids.into_iter().map(String::as_str).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = FhirQuery::new().ids(ids.iter().copied()).count(ids.len());
        self.client.fetch::<Patient>(&query).await
    }

    /// Cross-sectional snapshot of the most recently updated patients.
    #[instrument(skip(self))]
    pub async fn fetch_overall(&self) -> Result<ProcessedData, FetchError> {
        let patient_query = FhirQuery::new()
            .count(limits::OVERALL_PATIENTS)
            .sort("-_lastUpdated");
        let patients = self.client.fetch::<Patient>(&patient_query).await?;

        if patients.is_empty() {
            info!("No patients returned; overall dataset is empty");
            return Ok(ProcessedData::empty());
        }

        let subjects: Vec<Reference> = patients
            .iter()
            .map(|p| Reference::patient(p.id.clone()))
            .collect();

        let observation_query = FhirQuery::new()
            .count(limits::OVERALL_RESOURCES)
            .subjects(&subjects)
            .sort("-date");
        let condition_query = FhirQuery::new()
            .count(limits::OVERALL_RESOURCES)
            .subjects(&subjects);
        let encounter_query = FhirQuery::new()
            .count(limits::OVERALL_RESOURCES)
            .subjects(&subjects)
            .sort("-date");

        let (observations, conditions, encounters) = try_join!(
            self.client.fetch::<Observation>(&observation_query),
            self.client.fetch::<Condition>(&condition_query),
            self.client.fetch::<Encounter>(&encounter_query),
        )?;

        info!(
            patients = patients.len(),
            observations = observations.len(),
            conditions = conditions.len(),
            encounters = encounters.len(),
            "Assembled overall dataset"
        );

        Ok(ProcessedData::build(
            patients,
            observations,
            conditions,
            encounters,
        ))
    }

    /// Assemble `range` and its previous period concurrently. Either failing
    /// fails the pair.
    pub async fn fetch_comparison(&self, range: DateRange) -> AppResult<PeriodPair> {
        let previous_range = range.previous();
        let (current, previous) = try_join!(
            self.fetch_period(range),
            self.fetch_period(previous_range)
        )
        .map_err(|source| AppError::Aggregation {
            message: RANGE_FAILURE_MESSAGE.to_string(),
            source,
        })?;

        Ok(PeriodPair { current, previous })
    }

    pub async fn fetch_overall_snapshot(&self) -> AppResult<ProcessedData> {
        self.fetch_overall()
            .await
            .map_err(|source| AppError::Aggregation {
                message: OVERALL_FAILURE_MESSAGE.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::tests::{status, ScriptedTransport};
    use crate::fhir::ResourceType;
    use crate::period::YearMonth;
    use crate::retry::RetryPolicy;
    use crate::transport::{TransportError, TransportResponse};
    use serde_json::{json, Value};

    fn bundle(resources: Vec<Value>) -> Result<TransportResponse, TransportError> {
        let entry: Vec<Value> = resources.into_iter().map(|r| json!({ "resource": r })).collect();
        Ok(TransportResponse::ok(
            json!({ "resourceType": "Bundle", "entry": entry }).to_string(),
        ))
    }

    fn assembler(
        replies: Vec<Result<TransportResponse, TransportError>>,
    ) -> PeriodAssembler<ScriptedTransport> {
        PeriodAssembler::new(FhirClient::new(
            ScriptedTransport::new(replies),
            RetryPolicy::default(),
        ))
    }

    fn requests(assembler: &PeriodAssembler<ScriptedTransport>) -> Vec<(ResourceType, Vec<(String, String)>)> {
        assembler.client().transport().requests.lock().unwrap().clone()
    }

    fn q1_2024() -> DateRange {
        DateRange::new(
            YearMonth::new(2024, 1).unwrap(),
            YearMonth::new(2024, 3).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_with_zero_patients_short_circuits() {
        let assembler = assembler(vec![bundle(vec![])]);

        let data = assembler.fetch_overall().await.unwrap();

        assert!(data.is_empty());
        assert_eq!(assembler.client().transport().request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_restricts_by_subject() {
        let assembler = assembler(vec![bundle(vec![
            json!({ "resourceType": "Patient", "id": "1" }),
            json!({ "resourceType": "Patient", "id": "2" }),
        ])]);

        let data = assembler.fetch_overall().await.unwrap();
        assert_eq!(data.patients.len(), 2);

        let requests = requests(&assembler);
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0].0, ResourceType::Patient);
        for (_, params) in &requests[1..] {
            assert!(params.contains(&("subject".to_string(), "Patient/1,Patient/2".to_string())));
            assert!(params.contains(&("_count".to_string(), "500".to_string())));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_without_references_skips_patient_fetch() {
        let assembler = assembler(vec![]);

        let data = assembler.fetch_period(q1_2024()).await.unwrap();

        assert!(data.is_empty());
        let requests = requests(&assembler);
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|(t, _)| *t != ResourceType::Patient));
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_fetches_referenced_patients() {
        // try_join! polls in declaration order, so replies map to
        // Observation, Condition, Encounter, then Patient.
        let assembler = assembler(vec![
            bundle(vec![json!({
                "resourceType": "Observation", "id": "o1",
                "subject": { "reference": "Patient/2" }
            })]),
            bundle(vec![json!({
                "resourceType": "Condition", "id": "c1",
                "subject": { "reference": "Patient/1" }
            })]),
            bundle(vec![json!({ "resourceType": "Encounter", "id": "e1" })]),
            bundle(vec![json!({ "resourceType": "Patient", "id": "1" })]),
        ]);

        let data = assembler.fetch_period(q1_2024()).await.unwrap();

        assert_eq!(data.patients.len(), 1);
        assert_eq!(data.encounters.len(), 1);
        assert_eq!(
            data.patient_display_name(&Reference::patient("2")),
            crate::aggregate::UNKNOWN_PATIENT
        );

        let requests = requests(&assembler);
        let condition_params = &requests[1].1;
        assert!(condition_params.contains(&("recorded-date".to_string(), "ge2024-01-01".to_string())));
        assert!(!condition_params.iter().any(|(k, _)| k == "date"));

        let encounter_params = &requests[2].1;
        assert!(encounter_params.contains(&("date".to_string(), "le2024-03-31".to_string())));

        let (patient_type, patient_params) = &requests[3];
        assert_eq!(*patient_type, ResourceType::Patient);
        assert!(patient_params.contains(&("_id".to_string(), "1,2".to_string())));
        assert!(patient_params.contains(&("_count".to_string(), "2".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_aborts_assembly() {
        let assembler = assembler(vec![
            bundle(vec![]),
            status(403, "Forbidden"),
            bundle(vec![]),
        ]);

        let err = assembler.fetch_comparison(q1_2024()).await.unwrap_err();

        match err {
            AppError::Aggregation { message, source } => {
                assert_eq!(message, RANGE_FAILURE_MESSAGE);
                assert_eq!(source.resource_type(), ResourceType::Condition);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_previous_period_failure_aborts_comparison() {
        // The current period consumes the first three replies, so the 400
        // lands on the previous period's observation search.
        let assembler = assembler(vec![
            bundle(vec![]),
            bundle(vec![]),
            bundle(vec![]),
            status(400, "Bad Request"),
        ]);

        let err = assembler.fetch_comparison(q1_2024()).await.unwrap_err();

        match err {
            AppError::Aggregation { message, source } => {
                assert_eq!(message, RANGE_FAILURE_MESSAGE);
                assert_eq!(source.resource_type(), ResourceType::Observation);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let requests = requests(&assembler);
        assert_eq!(requests[3].0, ResourceType::Observation);
        assert!(requests[3]
            .1
            .contains(&("date".to_string(), "ge2023-10-01".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_comparison_returns_both_periods() {
        let assembler = assembler(vec![]);

        let pair = assembler.fetch_comparison(q1_2024()).await.unwrap();

        assert!(pair.current.is_empty());
        assert!(pair.previous.is_empty());
        let requests = requests(&assembler);
        assert_eq!(requests.len(), 6);
        assert!(requests
            .iter()
            .any(|(_, params)| params.contains(&("date".to_string(), "ge2023-10-01".to_string()))));
    }
}
