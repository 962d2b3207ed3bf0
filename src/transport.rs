//! Wire access to the upstream FHIR server
//!
//! The fetcher talks to a [`Transport`] so retry and bundle handling can be
//! exercised without a network. [`HttpTransport`] is the production
//! implementation backed by `reqwest`.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::demo::DemoTransport;
#[cfg(test)]
use crate::fetcher::tests::ScriptedTransport;
use crate::fhir::ResourceType;

/// Raw upstream response: status code and body text
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub reason: String,
    pub body: String,
}

impl TransportResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            reason: "OK".to_string(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }
}

/// Failure below HTTP (connect, timeout, body read)
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Issues a search request for one resource type
pub trait Transport: Send + Sync {
    fn search(
        &self,
        resource_type: ResourceType,
        params: &[(String, String)],
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}

/// HTTP transport for a FHIR R4 base URL
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Transport for HttpTransport {
    async fn search(
        &self,
        resource_type: ResourceType,
        params: &[(String, String)],
    ) -> Result<TransportResponse, TransportError> {
        let url = format!("{}/{}", self.base_url, resource_type);
        debug!(url = %url, params = ?params, "Issuing FHIR search");

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/fhir+json")
            .query(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError(format!("Request to {} timed out", url))
                } else {
                    TransportError(format!("Request to {} failed: {}", url, e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError(format!("Failed to read response body: {}", e)))?;

        Ok(TransportResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        })
    }
}

/// Transport selected at startup
#[derive(Debug, Clone)]
pub enum Upstream {
    Http(HttpTransport),
    Demo(DemoTransport),
    #[cfg(test)]
    Scripted(std::sync::Arc<ScriptedTransport>),
}

impl Upstream {
    pub fn describe(&self) -> String {
        match self {
            Upstream::Http(http) => http.base_url().to_string(),
            Upstream::Demo(_) => "demo".to_string(),
            #[cfg(test)]
            Upstream::Scripted(_) => "scripted".to_string(),
        }
    }
}

impl Transport for Upstream {
    async fn search(
        &self,
        resource_type: ResourceType,
        params: &[(String, String)],
    ) -> Result<TransportResponse, TransportError> {
        match self {
            Upstream::Http(http) => http.search(resource_type, params).await,
            Upstream::Demo(demo) => demo.search(resource_type, params).await,
            #[cfg(test)]
            Upstream::Scripted(scripted) => scripted.search(resource_type, params).await,
        }
    }
}
