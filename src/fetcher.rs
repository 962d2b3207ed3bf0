//! Resilient FHIR resource fetcher
//!
//! Fetches one resource type per call with count limits, retry with
//! exponential backoff and error classification, and decodes the Bundle
//! envelope into typed resources.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, error, warn};

use crate::error::FetchError;
use crate::fhir::{FhirBundle, FhirResource, Reference};
use crate::retry::RetryPolicy;
use crate::transport::{Transport, TransportResponse};

/// Typed search parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FhirQuery {
    params: Vec<(String, String)>,
}

impl FhirQuery {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    pub fn count(self, count: usize) -> Self {
        self.push("_count", count.to_string())
    }

    /// Sort key, `-` prefix for descending (e.g. `-date`)
    pub fn sort(self, key: &str) -> Self {
        self.push("_sort", key)
    }

    /// Inclusive `date` bounds
    pub fn date_between(self, start: NaiveDate, end: NaiveDate) -> Self {
        self.push("date", format!("ge{}", start.format("%Y-%m-%d")))
            .push("date", format!("le{}", end.format("%Y-%m-%d")))
    }

    pub fn recorded_on_or_after(self, start: NaiveDate) -> Self {
        self.push("recorded-date", format!("ge{}", start.format("%Y-%m-%d")))
    }

    pub fn ids<'a>(self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        let joined = ids.into_iter().collect::<Vec<_>>().join(",");
        self.push("_id", joined)
    }

    pub fn subjects<'a>(self, subjects: impl IntoIterator<Item = &'a Reference>) -> Self {
        let joined = subjects
            .into_iter()
            .map(Reference::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.push("subject", joined)
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

/// Client for one upstream FHIR server
#[derive(Debug)]
pub struct FhirClient<T> {
    transport: Arc<T>,
    policy: RetryPolicy,
}

impl<T> Clone for FhirClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            policy: self.policy,
        }
    }
}

impl<T: Transport> FhirClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport: Arc::new(transport),
            policy,
        }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Fetch all resources of type `R` matching `query`.
    ///
    /// Client errors (4xx) fail immediately. Anything else is retried per the
    /// retry policy before surfacing as [`FetchError::Exhausted`].
    pub async fn fetch<R: FhirResource>(&self, query: &FhirQuery) -> Result<Vec<R>, FetchError> {
        let resource_type = R::RESOURCE_TYPE;
        let max_attempts = self.policy.max_attempts;

        let outcome = self
            .policy
            .run(
                |attempt| async move {
                    debug!(resource_type = %resource_type, attempt, "Fetching FHIR resources");
                    let response = self
                        .transport
                        .search(resource_type, query.params())
                        .await
                        .map_err(|e| FetchError::Transient {
                            resource_type,
                            cause: e.to_string(),
                        })?;
                    decode_bundle::<R>(response)
                },
                |attempt, err, next_delay| {
                    warn!(
                        resource_type = %resource_type,
                        attempt,
                        max_attempts,
                        retry_in_ms = next_delay.map(|d| d.as_millis() as u64),
                        error = %err,
                        "FHIR fetch attempt failed"
                    );
                },
            )
            .await;

        match outcome {
            Ok(resources) => {
                debug!(
                    resource_type = %resource_type,
                    count = resources.len(),
                    "FHIR fetch succeeded"
                );
                Ok(resources)
            }
            Err(failure) => {
                error!(
                    resource_type = %resource_type,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "FHIR fetch failed permanently"
                );
                Err(match failure.error {
                    FetchError::Transient { cause, .. } => FetchError::Exhausted {
                        resource_type,
                        attempts: failure.attempts,
                        cause,
                    },
                    other => other,
                })
            }
        }
    }
}

/// Classify the response and decode its Bundle entries in server order.
fn decode_bundle<R: FhirResource>(response: TransportResponse) -> Result<Vec<R>, FetchError> {
    let resource_type = R::RESOURCE_TYPE;

    if response.is_client_error() {
        return Err(FetchError::Client {
            resource_type,
            status: response.status,
            message: response.reason,
        });
    }

    if !response.is_success() {
        return Err(FetchError::Transient {
            resource_type,
            cause: format!("Server error: {} {}", response.status, response.reason),
        });
    }

    let bundle: FhirBundle =
        serde_json::from_str(&response.body).map_err(|e| FetchError::Transient {
            resource_type,
            cause: format!("Invalid Bundle JSON: {}", e),
        })?;

    let resources = bundle
        .entry
        .into_iter()
        .filter_map(|entry| entry.resource)
        .filter_map(|value| match serde_json::from_value::<R>(value) {
            Ok(resource) => Some(resource),
            Err(e) => {
                warn!(
                    resource_type = %resource_type,
                    error = %e,
                    "Skipping undecodable bundle entry"
                );
                None
            }
        })
        .collect();

    Ok(resources)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fhir::{Observation, Patient, ResourceType};
    use crate::transport::TransportError;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Scripted transport: pops one canned reply per call and records requests.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        pub(crate) requests: Mutex<Vec<(ResourceType, Vec<(String, String)>)>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(
            replies: impl IntoIterator<Item = Result<TransportResponse, TransportError>>,
        ) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl Transport for ScriptedTransport {
        async fn search(
            &self,
            resource_type: ResourceType,
            params: &[(String, String)],
        ) -> Result<TransportResponse, TransportError> {
            self.requests
                .lock()
                .unwrap()
                .push((resource_type, params.to_vec()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::ok(r#"{"resourceType":"Bundle"}"#)))
        }
    }

    pub(crate) fn status(code: u16, reason: &str) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: code,
            reason: reason.to_string(),
            body: String::new(),
        })
    }

    fn patient_bundle() -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::ok(
            json!({
                "resourceType": "Bundle",
                "entry": [
                    { "resource": { "resourceType": "Patient", "id": "b" } },
                    { "fullUrl": "urn:empty" },
                    { "resource": { "resourceType": "Patient", "id": "a" } }
                ]
            })
            .to_string(),
        ))
    }

    #[test]
    fn test_query_params() {
        let query = FhirQuery::new()
            .count(200)
            .sort("-date")
            .date_between(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            );

        assert_eq!(
            query.params(),
            &[
                ("_count".to_string(), "200".to_string()),
                ("_sort".to_string(), "-date".to_string()),
                ("date".to_string(), "ge2024-01-01".to_string()),
                ("date".to_string(), "le2024-03-31".to_string()),
            ]
        );
    }

    #[test]
    fn test_subject_and_id_params() {
        let refs = [Reference::patient("1"), Reference::patient("2")];
        let query = FhirQuery::new().subjects(&refs).ids(["1", "2"]);
        assert_eq!(query.params()[0].1, "Patient/1,Patient/2");
        assert_eq!(query.params()[1].1, "1,2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bundle_decoding_keeps_order_and_drops_empty_entries() {
        let client = FhirClient::new(
            ScriptedTransport::new([patient_bundle()]),
            RetryPolicy::default(),
        );

        let patients: Vec<Patient> = client.fetch(&FhirQuery::new()).await.unwrap();
        let ids: Vec<&str> = patients.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_transient_failures_then_success() {
        let client = FhirClient::new(
            ScriptedTransport::new([
                status(503, "Service Unavailable"),
                Err(TransportError("connection reset".to_string())),
                patient_bundle(),
            ]),
            RetryPolicy::default(),
        );

        let patients: Vec<Patient> = client.fetch(&FhirQuery::new()).await.unwrap();
        assert_eq!(patients.len(), 2);
        assert_eq!(client.transport().request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_transient_failures_exhaust() {
        let client = FhirClient::new(
            ScriptedTransport::new([
                status(500, "Internal Server Error"),
                status(502, "Bad Gateway"),
                status(503, "Service Unavailable"),
            ]),
            RetryPolicy::default(),
        );
        let start = Instant::now();

        let err = client
            .fetch::<Observation>(&FhirQuery::new())
            .await
            .unwrap_err();

        match err {
            FetchError::Exhausted {
                resource_type,
                attempts,
                cause,
            } => {
                assert_eq!(resource_type, ResourceType::Observation);
                assert_eq!(attempts, 3);
                assert!(cause.contains("503"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(client.transport().request_count(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let client = FhirClient::new(
            ScriptedTransport::new([status(400, "Bad Request"), patient_bundle()]),
            RetryPolicy::default(),
        );
        let start = Instant::now();

        let err = client.fetch::<Patient>(&FhirQuery::new()).await.unwrap_err();

        assert!(matches!(err, FetchError::Client { status: 400, .. }));
        assert_eq!(client.transport().request_count(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_body_is_transient() {
        let client = FhirClient::new(
            ScriptedTransport::new([Ok(TransportResponse::ok("<html>")), patient_bundle()]),
            RetryPolicy::default(),
        );

        let patients: Vec<Patient> = client.fetch(&FhirQuery::new()).await.unwrap();
        assert_eq!(patients.len(), 2);
        assert_eq!(client.transport().request_count(), 2);
    }
}
