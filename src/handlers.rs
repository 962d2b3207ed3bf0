//! HTTP request handlers
//!
//! Implements REST API endpoints for loading and reading analytics snapshots.

use actix_web::{web, HttpRequest, HttpResponse, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::analytics::{patient_detail, patient_rows, PatientSummaryRow, Statistics};
use crate::error::{AppError, AppResult};
use crate::fhir::HasSubject;
use crate::period::DateRange;
use crate::state::{AppState, Services, Snapshot, SnapshotMode};
use crate::summary::{patient_narrative, regional_insights};
use crate::validation::{validate_range_request, RangeRequest};

type SharedState = web::Data<Arc<RwLock<AppState>>>;

/// Months covered by the range offered before the user picks one
const DEFAULT_RANGE_MONTHS: u32 = 3;

/// Configure all application routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            // Health check
            .route("/health", web::get().to(health_check))
            // Snapshot loading
            .route("/snapshot", web::get().to(get_snapshot))
            .route("/snapshot/overall", web::post().to(load_overall))
            .route("/snapshot/range", web::post().to(load_range))
            .route("/range/default", web::get().to(default_range))
            // Patient drill-down
            .route("/patients", web::get().to(list_patients))
            .route("/patients/{id}", web::get().to(get_patient))
            .route("/patients/{id}/summary", web::post().to(summarize_patient))
            // Encounters
            .route("/encounters/timeline", web::get().to(encounter_timeline))
            // Narrative insights
            .route("/insights", web::post().to(generate_insights)),
    );
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub last_snapshot: Option<DateTime<Utc>>,
}

/// Health check endpoint
///
/// GET /api/health
///
/// Returns system health status including uptime and last snapshot time.
pub async fn health_check(state: SharedState) -> Result<HttpResponse, AppError> {
    let state = state.read().await;

    let health = HealthCheck {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        uptime_seconds: state.uptime_seconds(),
        last_snapshot: state.last_snapshot_time(),
    };

    Ok(HttpResponse::Ok().json(health))
}

/// Snapshot metadata plus both reductions
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotView<'a> {
    id: Uuid,
    #[serde(flatten)]
    mode: SnapshotMode,
    description: String,
    generated_at: DateTime<Utc>,
    current: &'a Statistics,
    previous: Option<&'a Statistics>,
}

impl<'a> From<&'a Snapshot> for SnapshotView<'a> {
    fn from(snapshot: &'a Snapshot) -> Self {
        Self {
            id: snapshot.id,
            mode: snapshot.mode,
            description: snapshot.description(),
            generated_at: snapshot.generated_at,
            current: &snapshot.current_stats,
            previous: snapshot.previous_stats.as_ref(),
        }
    }
}

async fn current_snapshot(state: &SharedState) -> AppResult<Arc<Snapshot>> {
    state
        .read()
        .await
        .snapshot()
        .ok_or_else(|| AppError::NotFound("No analytics snapshot loaded".to_string()))
}

/// Get the current snapshot
///
/// GET /api/snapshot
pub async fn get_snapshot(state: SharedState) -> Result<HttpResponse, AppError> {
    let snapshot = current_snapshot(&state).await?;
    Ok(HttpResponse::Ok().json(SnapshotView::from(snapshot.as_ref())))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DefaultRangeResponse {
    range: DateRange,
    previous_range: DateRange,
    description: String,
}

/// Range to prefill the period pickers with
///
/// GET /api/range/default
pub async fn default_range() -> Result<HttpResponse, AppError> {
    let range = DateRange::ending_at(Utc::now().date_naive(), DEFAULT_RANGE_MONTHS);

    Ok(HttpResponse::Ok().json(DefaultRangeResponse {
        range,
        previous_range: range.previous(),
        description: range.describe(),
    }))
}

/// Assemble the overall view and replace the snapshot
///
/// POST /api/snapshot/overall
pub async fn load_overall(
    state: SharedState,
    services: web::Data<Services>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let correlation_id = extract_correlation_id(&req);
    info!(correlation_id = %correlation_id, "Loading overall snapshot");

    // The lock is only taken once assembly has finished
    let data = services.assembler.fetch_overall_snapshot().await?;
    let snapshot = state
        .write()
        .await
        .replace_snapshot(Snapshot::overall(data, Utc::now()));

    info!(
        correlation_id = %correlation_id,
        snapshot_id = %snapshot.id,
        "Overall snapshot loaded"
    );

    Ok(HttpResponse::Ok().json(SnapshotView::from(snapshot.as_ref())))
}

/// Assemble a month range and its previous period, then replace the snapshot
///
/// POST /api/snapshot/range
pub async fn load_range(
    state: SharedState,
    services: web::Data<Services>,
    body: web::Json<RangeRequest>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let correlation_id = extract_correlation_id(&req);
    let range = validate_range_request(&body)?;

    info!(correlation_id = %correlation_id, range = %range, "Loading range snapshot");

    let pair = services.assembler.fetch_comparison(range).await?;
    let snapshot = state
        .write()
        .await
        .replace_snapshot(Snapshot::range(range, pair, Utc::now()));

    info!(
        correlation_id = %correlation_id,
        snapshot_id = %snapshot.id,
        "Range snapshot loaded"
    );

    Ok(HttpResponse::Ok().json(SnapshotView::from(snapshot.as_ref())))
}

#[derive(Serialize)]
struct PatientListResponse {
    total: usize,
    data: Vec<PatientSummaryRow>,
}

/// List the patients of the current period
///
/// GET /api/patients
pub async fn list_patients(state: SharedState) -> Result<HttpResponse, AppError> {
    let snapshot = current_snapshot(&state).await?;
    let data = patient_rows(&snapshot.current, Utc::now());

    Ok(HttpResponse::Ok().json(PatientListResponse {
        total: data.len(),
        data,
    }))
}

/// Everything known about one patient
///
/// GET /api/patients/{id}
pub async fn get_patient(
    state: SharedState,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let snapshot = current_snapshot(&state).await?;
    let patient_id = path.into_inner();

    let detail = patient_detail(&snapshot.current, &patient_id, Utc::now())
        .ok_or_else(|| AppError::NotFound(format!("Patient {} not found", patient_id)))?;

    Ok(HttpResponse::Ok().json(detail))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PatientSummaryResponse {
    patient_id: String,
    summary: String,
}

/// Narrative summary for one patient
///
/// POST /api/patients/{id}/summary
pub async fn summarize_patient(
    state: SharedState,
    services: web::Data<Services>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let snapshot = current_snapshot(&state).await?;
    let patient_id = path.into_inner();

    let detail = patient_detail(&snapshot.current, &patient_id, Utc::now())
        .ok_or_else(|| AppError::NotFound(format!("Patient {} not found", patient_id)))?;
    let summary = patient_narrative(services.summarizer.as_ref(), &detail).await;

    Ok(HttpResponse::Ok().json(PatientSummaryResponse {
        patient_id,
        summary,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TimelineEntry {
    id: String,
    patient_id: String,
    patient_name: String,
    label: String,
    status: Option<String>,
    start: Option<String>,
}

/// Encounters of the current period, newest first
///
/// GET /api/encounters/timeline
pub async fn encounter_timeline(state: SharedState) -> Result<HttpResponse, AppError> {
    let snapshot = current_snapshot(&state).await?;
    let data = &snapshot.current;

    let entries: Vec<TimelineEntry> = data
        .timeline()
        .into_iter()
        .filter_map(|encounter| {
            let subject = encounter.subject_reference()?;
            Some(TimelineEntry {
                id: encounter.id.clone(),
                patient_id: subject.id().to_string(),
                patient_name: data.patient_display_name(subject),
                label: encounter.label(),
                status: encounter.status.clone(),
                start: encounter.period_start().map(str::to_string),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(entries))
}

/// Narrative regional insights for the current snapshot
///
/// POST /api/insights
pub async fn generate_insights(
    state: SharedState,
    services: web::Data<Services>,
) -> Result<HttpResponse, AppError> {
    let snapshot = current_snapshot(&state).await?;

    let outcome = regional_insights(
        services.summarizer.as_ref(),
        &snapshot.current_stats,
        &snapshot.description(),
        snapshot.previous_stats.as_ref(),
        services.min_patients_for_insights,
    )
    .await;

    Ok(HttpResponse::Ok().json(outcome))
}

/// Extract or generate correlation ID from request headers
fn extract_correlation_id(req: &HttpRequest) -> String {
    req.headers()
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
