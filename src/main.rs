//! FHIR Pulse
//!
//! Population health analytics backend over a FHIR R4 server. Fetches
//! patients, observations, conditions and encounters for a selected period
//! (or an overall cross-section), cross-indexes them and serves the reduced
//! statistics over HTTP.
//!
//! ⚠️ DISCLAIMER:
//! This system is NOT a medical diagnostic tool.

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod aggregate;
mod analytics;
mod assembler;
mod config;
mod demo;
mod error;
mod fetcher;
mod fhir;
mod handlers;
mod period;
mod retry;
mod state;
mod summary;
mod transport;
mod validation;

use crate::assembler::PeriodAssembler;
use crate::config::Settings;
use crate::demo::DemoTransport;
use crate::fetcher::FhirClient;
use crate::state::{AppState, Services, Snapshot};
use crate::summary::HttpSummarizer;
use crate::transport::{HttpTransport, Upstream};

/// Size and seed of the synthetic population served in demo mode
const DEMO_PATIENTS: usize = 120;
const DEMO_SEED: u64 = 2024;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenv::dotenv().ok();

    // Logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fhir_pulse=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();

    // Load configuration
    let settings = Settings::from_env().context("Failed to load configuration")?;
    let bind_address = format!("{}:{}", settings.server.host, settings.server.port);

    info!("Starting FHIR Pulse backend");
    info!("Binding server to {}", bind_address);

    // ---------------------------------------------------------------------
    // Upstream FHIR source and narrative summary collaborator
    // ---------------------------------------------------------------------
    let upstream = if settings.fhir.demo_mode {
        Upstream::Demo(DemoTransport::generate(
            DEMO_PATIENTS,
            Utc::now().date_naive(),
            DEMO_SEED,
        ))
    } else {
        Upstream::Http(
            HttpTransport::new(&settings.fhir.base_url, settings.fhir.timeout())
                .context("Failed to create FHIR transport")?,
        )
    };
    info!(upstream = %upstream.describe(), "FHIR upstream configured");

    let summarizer = settings
        .summary
        .endpoint
        .as_deref()
        .map(|endpoint| {
            HttpSummarizer::new(
                endpoint,
                settings.summary.api_key.clone(),
                settings.fhir.timeout(),
            )
        })
        .transpose()
        .context("Failed to create summary client")?;
    if summarizer.is_none() {
        warn!("SUMMARY_ENDPOINT not set; narrative summaries are disabled");
    }

    let services = web::Data::new(Services {
        assembler: PeriodAssembler::new(FhirClient::new(
            upstream,
            settings.fhir.retry_policy(),
        )),
        summarizer,
        min_patients_for_insights: settings.summary.min_patients,
    });

    // Shared application state
    let app_state = Arc::new(RwLock::new(AppState::new()));

    // ---------------------------------------------------------------------
    // Initial overall snapshot
    // IMPORTANT: use actix_rt::spawn (NOT tokio::spawn)
    // ---------------------------------------------------------------------
    let loader_state = app_state.clone();
    let loader_services = services.clone();

    actix_rt::spawn(async move {
        match loader_services.assembler.fetch_overall_snapshot().await {
            Ok(data) => {
                loader_state
                    .write()
                    .await
                    .replace_snapshot(Snapshot::overall(data, Utc::now()));
            }
            Err(e) => warn!(error = %e, "Initial overall snapshot failed"),
        }
    });

    // ---------------------------------------------------------------------
    // HTTP server
    // ---------------------------------------------------------------------
    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(services.clone())
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .configure(handlers::configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
