//! Configuration management module
//!
//! Loads environment-based configuration for the HTTP server, the upstream
//! FHIR connection and the narrative summary collaborator.

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::summary::DEFAULT_MIN_PATIENTS;

/// Configuration errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value for environment variable {0}")]
    ParseError(&'static str),
}

/// Server configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Upstream FHIR configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct FhirSettings {
    /// Base URL of the FHIR R4 server
    pub base_url: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Attempts per fetch, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    pub backoff_base_ms: u64,
    /// Serve a synthetic population instead of calling `base_url`
    pub demo_mode: bool,
}

impl FhirSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_base_ms))
    }
}

/// Narrative summary configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct SummarySettings {
    /// Summary service endpoint; narratives are disabled when unset
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Minimum patients in the current period before insights are requested
    pub min_patients: usize,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub fhir: FhirSettings,
    pub summary: SummarySettings,
}

fn parse_var<T: FromStr>(name: &'static str, default: &str) -> Result<T, SettingsError> {
    env::var(name)
        .unwrap_or_else(|_| default.into())
        .parse()
        .map_err(|_| SettingsError::ParseError(name))
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Settings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self, SettingsError> {
        Ok(Self {
            server: ServerSettings {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
                port: parse_var("SERVER_PORT", "8080")?,
            },
            fhir: FhirSettings {
                base_url: env::var("FHIR_BASE_URL")
                    .unwrap_or_else(|_| "https://server.fire.ly/r4".into()),
                timeout_secs: parse_var("FHIR_TIMEOUT_SECS", "30")?,
                max_attempts: parse_var("FHIR_MAX_ATTEMPTS", "3")?,
                backoff_base_ms: parse_var("FHIR_BACKOFF_BASE_MS", "500")?,
                demo_mode: parse_var("FHIR_DEMO_MODE", "false")?,
            },
            summary: SummarySettings {
                endpoint: optional_var("SUMMARY_ENDPOINT"),
                api_key: optional_var("SUMMARY_API_KEY"),
                min_patients: parse_var(
                    "SUMMARY_MIN_PATIENTS",
                    &DEFAULT_MIN_PATIENTS.to_string(),
                )?,
            },
        })
    }
}
