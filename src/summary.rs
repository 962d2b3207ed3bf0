//! Narrative summary boundary
//!
//! Packages statistics into plain serializable snapshots for an external
//! language-model summarizer and applies the minimum-data policy. The returned
//! narrative is passed through untouched; only its presence is checked.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::analytics::{ConditionCount, PatientDetail, Statistics, VitalReading};

pub const NOT_ENOUGH_DATA: &str =
    "Not enough data for the selected period to generate meaningful insights.";
pub const REGIONAL_FAILURE: &str = "Could not generate AI regional insights at this time.";
pub const PATIENT_FAILURE: &str = "Could not generate AI summary at this time.";
pub const NOT_CONFIGURED: &str = "Narrative summaries are not configured.";

/// Default minimum patient count before insights are requested
pub const DEFAULT_MIN_PATIENTS: usize = 5;

/// Description used for the comparison period
pub const PREVIOUS_PERIOD: &str = "previous period";

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("Summarizer request failed: {0}")]
    Request(String),

    #[error("Summarizer returned status {0}")]
    Status(u16),

    #[error("Summarizer response was empty")]
    Empty,
}

/// Aggregates handed to the summarizer for one period
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSnapshot {
    pub time_period_description: String,
    pub total_patients: usize,
    pub total_encounters: usize,
    pub active_cases: usize,
    pub gender_distribution: BTreeMap<String, usize>,
    pub age_distribution: BTreeMap<String, usize>,
    pub top_conditions: Vec<ConditionCount>,
}

impl PeriodSnapshot {
    pub fn from_statistics(stats: &Statistics, description: impl Into<String>) -> Self {
        Self {
            time_period_description: description.into(),
            total_patients: stats.total_patients,
            total_encounters: stats.total_encounters,
            active_cases: stats.active_cases,
            gender_distribution: stats
                .gender_data
                .iter()
                .map(|g| (g.name.clone(), g.value))
                .collect(),
            age_distribution: stats
                .age_group_data
                .iter()
                .map(|g| (g.name.clone(), g.patients))
                .collect(),
            top_conditions: stats.top_conditions.clone(),
        }
    }
}

/// Request for population-level insights
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionalSummaryRequest {
    pub current: PeriodSnapshot,
    pub previous: Option<PeriodSnapshot>,
}

/// Request for a single patient's narrative
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientSummaryRequest {
    pub name: String,
    pub age: Option<i64>,
    pub gender: String,
    pub conditions: Vec<String>,
    pub vitals: Vec<VitalReading>,
}

impl From<&PatientDetail> for PatientSummaryRequest {
    fn from(detail: &PatientDetail) -> Self {
        Self {
            name: detail.name.clone(),
            age: detail.age,
            gender: detail.gender.clone(),
            conditions: detail.active_conditions.clone(),
            vitals: detail.recent_vitals.clone(),
        }
    }
}

/// Result handed back across the boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SummaryOutcome {
    /// Structured insights exactly as the summarizer produced them
    Insights(Value),
    Unavailable { error: String },
}

impl SummaryOutcome {
    pub fn unavailable(message: &str) -> Self {
        SummaryOutcome::Unavailable {
            error: message.to_string(),
        }
    }
}

/// External narrative generator
pub trait Summarizer: Send + Sync {
    fn regional_insights(
        &self,
        request: &RegionalSummaryRequest,
    ) -> impl Future<Output = Result<Value, SummaryError>> + Send;

    fn patient_summary(
        &self,
        request: &PatientSummaryRequest,
    ) -> impl Future<Output = Result<String, SummaryError>> + Send;
}

/// Ask for population insights unless the period is too thin to be
/// meaningful. The previous period is only included when it has patients.
pub async fn regional_insights<S: Summarizer>(
    summarizer: Option<&S>,
    current: &Statistics,
    current_description: &str,
    previous: Option<&Statistics>,
    min_patients: usize,
) -> SummaryOutcome {
    if current.total_patients < min_patients {
        info!(
            total_patients = current.total_patients,
            min_patients, "Skipping insights: not enough data"
        );
        return SummaryOutcome::unavailable(NOT_ENOUGH_DATA);
    }

    let Some(summarizer) = summarizer else {
        return SummaryOutcome::unavailable(NOT_CONFIGURED);
    };

    let request = RegionalSummaryRequest {
        current: PeriodSnapshot::from_statistics(current, current_description),
        previous: previous
            .filter(|p| p.total_patients > 0)
            .map(|p| PeriodSnapshot::from_statistics(p, PREVIOUS_PERIOD)),
    };

    match summarizer.regional_insights(&request).await {
        Ok(Value::Null) => {
            warn!("Summarizer returned no insights");
            SummaryOutcome::unavailable(REGIONAL_FAILURE)
        }
        Ok(insights) => SummaryOutcome::Insights(insights),
        Err(e) => {
            error!(error = %e, "Error generating regional summary");
            SummaryOutcome::unavailable(REGIONAL_FAILURE)
        }
    }
}

/// Narrative for one patient; any failure yields the fixed fallback text.
pub async fn patient_narrative<S: Summarizer>(summarizer: Option<&S>, detail: &PatientDetail) -> String {
    let Some(summarizer) = summarizer else {
        return PATIENT_FAILURE.to_string();
    };

    match summarizer.patient_summary(&detail.into()).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            warn!(patient_id = %detail.id, "Summarizer returned empty text");
            PATIENT_FAILURE.to_string()
        }
        Err(e) => {
            error!(patient_id = %detail.id, error = %e, "Error generating health summary");
            PATIENT_FAILURE.to_string()
        }
    }
}

fn describe_period(snapshot: &PeriodSnapshot) -> String {
    let conditions = snapshot
        .top_conditions
        .iter()
        .map(|c| format!("{} ({} cases)", c.name, c.count))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "- Time Period: {}\n- Total Patients: {}\n- Gender Distribution: {}\n- Age Distribution: {}\n- Top 5 Conditions: {}\n- Key Metrics: Total Encounters: {}, Active Cases: {}",
        snapshot.time_period_description,
        snapshot.total_patients,
        json!(snapshot.gender_distribution),
        json!(snapshot.age_distribution),
        conditions,
        snapshot.total_encounters,
        snapshot.active_cases,
    )
}

/// Prompt for population-level insights
pub fn regional_prompt(request: &RegionalSummaryRequest) -> String {
    let previous = request
        .previous
        .as_ref()
        .map(describe_period)
        .unwrap_or_else(|| "No previous period data available for comparison.".to_string());

    format!(
        "You are a public health analyst. Analyze the aggregated health data below and return a JSON \
         object with a headline, key insights, a demographic breakdown, a condition analysis with a \
         High/Medium/Low risk level per condition, a public health focus and, when previous period data \
         exists, a comparative analysis with percentage changes computed as ((current - previous) / previous) * 100. \
         Bold key numbers with markdown double asterisks.\n\n\
         --- CURRENT PERIOD DATA ---\n{}\n\n--- PREVIOUS PERIOD DATA ---\n{}\n",
        describe_period(&request.current),
        previous
    )
}

/// Prompt for one patient's narrative
pub fn patient_prompt(request: &PatientSummaryRequest) -> String {
    let age = request
        .age
        .map(|a| a.to_string())
        .unwrap_or_else(|| "N/A".to_string());

    let conditions = if request.conditions.is_empty() {
        "No active conditions listed.".to_string()
    } else {
        request
            .conditions
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let vitals = if request.vitals.is_empty() {
        "No recent vitals available.".to_string()
    } else {
        request
            .vitals
            .iter()
            .map(|v| match &v.effective_date {
                Some(date) => format!("- {}: {} (on {})", v.name, v.value, date),
                None => format!("- {}: {}", v.name, v.value),
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You are a medical assistant. Based on the following FHIR data, write a concise single-paragraph \
         health summary highlighting key conditions, recent abnormal vital signs and potential risks. \
         Do not provide medical advice.\n\n\
         - Patient Demographics: {}, {} years old, {}.\n- Active Conditions:\n{}\n- Recent Vitals:\n{}\n\nHealth Summary:",
        request.name, age, request.gender, conditions, vitals
    )
}

/// Summarizer reached over HTTP.
///
/// Posts `{task, prompt, data}` to the configured endpoint. Regional insights
/// expect a JSON object back; patient summaries expect `{"text": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpSummarizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct TextResponse {
    #[serde(default)]
    text: Option<String>,
}

impl HttpSummarizer {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SummaryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SummaryError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }

    async fn post(&self, body: Value) -> Result<reqwest::Response, SummaryError> {
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SummaryError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SummaryError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

impl Summarizer for HttpSummarizer {
    async fn regional_insights(&self, request: &RegionalSummaryRequest) -> Result<Value, SummaryError> {
        let response = self
            .post(json!({
                "task": "regional-insights",
                "prompt": regional_prompt(request),
                "data": request,
            }))
            .await?;

        response
            .json::<Value>()
            .await
            .map_err(|e| SummaryError::Request(e.to_string()))
    }

    async fn patient_summary(&self, request: &PatientSummaryRequest) -> Result<String, SummaryError> {
        let response = self
            .post(json!({
                "task": "patient-summary",
                "prompt": patient_prompt(request),
                "data": request,
            }))
            .await?;

        response
            .json::<TextResponse>()
            .await
            .map_err(|e| SummaryError::Request(e.to_string()))?
            .text
            .ok_or(SummaryError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::{condition, patient};
    use crate::aggregate::ProcessedData;
    use crate::analytics::{patient_detail, reduce};
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    /// Records requests and replies with a canned result.
    struct FakeSummarizer {
        reply: Result<Value, ()>,
        seen: Mutex<Vec<RegionalSummaryRequest>>,
    }

    impl FakeSummarizer {
        fn replying(reply: Result<Value, ()>) -> Self {
            Self {
                reply,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Summarizer for FakeSummarizer {
        async fn regional_insights(
            &self,
            request: &RegionalSummaryRequest,
        ) -> Result<Value, SummaryError> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply
                .clone()
                .map_err(|_| SummaryError::Request("boom".to_string()))
        }

        async fn patient_summary(
            &self,
            request: &PatientSummaryRequest,
        ) -> Result<String, SummaryError> {
            match &self.reply {
                Ok(_) => Ok(format!("{} is doing fine.", request.name)),
                Err(_) => Err(SummaryError::Status(500)),
            }
        }
    }

    fn stats_with_patients(count: usize) -> Statistics {
        let patients = (0..count)
            .map(|i| patient(&i.to_string(), Some("female"), Some("1980-01-01")))
            .collect();
        let data = ProcessedData::build(
            patients,
            vec![],
            vec![condition("c1", Some("Patient/0"), "Asthma", "active")],
            vec![],
        );
        reduce(&data, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_not_enough_data_skips_summarizer() {
        let summarizer = FakeSummarizer::replying(Ok(json!({ "headline": "x" })));

        let outcome = regional_insights(
            Some(&summarizer),
            &stats_with_patients(4),
            "overall",
            None,
            DEFAULT_MIN_PATIENTS,
        )
        .await;

        assert_eq!(outcome, SummaryOutcome::unavailable(NOT_ENOUGH_DATA));
        assert!(summarizer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insights_pass_through() {
        let summarizer = FakeSummarizer::replying(Ok(json!({ "headline": "Asthma on the rise" })));
        let empty_previous = stats_with_patients(0);

        let outcome = regional_insights(
            Some(&summarizer),
            &stats_with_patients(5),
            "Jan 2024 to Mar 2024",
            Some(&empty_previous),
            DEFAULT_MIN_PATIENTS,
        )
        .await;

        assert_eq!(
            outcome,
            SummaryOutcome::Insights(json!({ "headline": "Asthma on the rise" }))
        );
        let seen = summarizer.seen.lock().unwrap();
        assert_eq!(seen[0].current.total_patients, 5);
        assert_eq!(seen[0].current.gender_distribution["female"], 5);
        assert!(seen[0].previous.is_none());
    }

    #[tokio::test]
    async fn test_summarizer_failure_becomes_marker() {
        let summarizer = FakeSummarizer::replying(Err(()));

        let outcome = regional_insights(
            Some(&summarizer),
            &stats_with_patients(6),
            "overall",
            Some(&stats_with_patients(2)),
            DEFAULT_MIN_PATIENTS,
        )
        .await;

        assert_eq!(outcome, SummaryOutcome::unavailable(REGIONAL_FAILURE));
        let seen = summarizer.seen.lock().unwrap();
        assert_eq!(
            seen[0].previous.as_ref().unwrap().time_period_description,
            PREVIOUS_PERIOD
        );
    }

    #[tokio::test]
    async fn test_unconfigured_summarizer() {
        let outcome = regional_insights::<FakeSummarizer>(
            None,
            &stats_with_patients(10),
            "overall",
            None,
            DEFAULT_MIN_PATIENTS,
        )
        .await;

        assert_eq!(outcome, SummaryOutcome::unavailable(NOT_CONFIGURED));
    }

    #[test]
    fn test_outcome_serialization() {
        let marker = serde_json::to_value(SummaryOutcome::unavailable(NOT_ENOUGH_DATA)).unwrap();
        assert_eq!(marker, json!({ "error": NOT_ENOUGH_DATA }));
    }

    #[tokio::test]
    async fn test_patient_narrative_fallback() {
        let data = ProcessedData::build(
            vec![patient("1", Some("male"), None)],
            vec![],
            vec![],
            vec![],
        );
        let detail = patient_detail(&data, "1", Utc::now()).unwrap();

        let ok = FakeSummarizer::replying(Ok(Value::Null));
        assert_eq!(
            patient_narrative(Some(&ok), &detail).await,
            "Unknown Patient is doing fine."
        );

        let failing = FakeSummarizer::replying(Err(()));
        assert_eq!(patient_narrative(Some(&failing), &detail).await, PATIENT_FAILURE);
    }

    #[test]
    fn test_prompts_mention_data() {
        let request = RegionalSummaryRequest {
            current: PeriodSnapshot::from_statistics(&stats_with_patients(5), "overall"),
            previous: None,
        };
        let prompt = regional_prompt(&request);
        assert!(prompt.contains("Total Patients: 5"));
        assert!(prompt.contains("Asthma (1 cases)"));
        assert!(prompt.contains("No previous period data available"));

        let patient_request = PatientSummaryRequest {
            name: "Jane Doe".to_string(),
            age: None,
            gender: "female".to_string(),
            conditions: vec![],
            vitals: vec![],
        };
        let prompt = patient_prompt(&patient_request);
        assert!(prompt.contains("Jane Doe, N/A years old, female"));
        assert!(prompt.contains("No active conditions listed."));
    }
}
