//! Telemetry delivery to the remote collector.
//!
//! Delivery is best-effort. A missing API key skips the send and a failed
//! request is logged; neither is surfaced to the caller as an error.

use crate::config::{CiContext, ReporterConfig};
use crate::core::{
    ApiKeyProvider, JobInfo, RunMetadata, TelemetryData, TelemetryEnvelope, TelemetrySink,
};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

/// Identifies the CI system in run metadata.
pub const CI_PROVIDER: &str = "GITHUB";
/// Path of the on-demand API key endpoint, relative to its base URL.
pub const ON_DEMAND_KEY_PATH: &str = "api/v1/apikey/ondemand";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("telemetry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("collector rejected telemetry with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Builds the metadata attached to every envelope of this run.
pub fn build_metadata(ctx: &CiContext, job: &JobInfo, created_at: i64) -> RunMetadata {
    RunMetadata {
        ci_provider: CI_PROVIDER.to_string(),
        run_id: ctx.run_id,
        repo_name: ctx.repo_name.clone(),
        repo_owner: ctx.repo_owner.clone(),
        run_attempt: ctx.run_attempt.clone(),
        runner_name: ctx.runner_name.clone(),
        job_id: job.id,
        job_name: job.name.clone(),
        created_at,
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, ReportError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OnDemandKeyRequest<'a> {
    repo_full_name: &'a str,
    workflow_run_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnDemandKeyResponse {
    api_key: Option<String>,
}

/// Uses the configured key, or asks the collector to issue one for this run.
pub struct StaticOrOnDemandKey {
    configured: Option<String>,
    client: reqwest::Client,
    on_demand_url: String,
    repo_full_name: String,
    run_id: u64,
}

impl StaticOrOnDemandKey {
    pub fn new(config: &ReporterConfig, ctx: &CiContext) -> Result<Self, ReportError> {
        Ok(Self {
            configured: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            client: http_client(Duration::from_secs(config.timeout_secs))?,
            on_demand_url: format!(
                "{}/{}",
                config.on_demand_base_url.trim_end_matches('/'),
                ON_DEMAND_KEY_PATH
            ),
            repo_full_name: ctx.repo_full_name(),
            run_id: ctx.run_id,
        })
    }

    async fn request_on_demand(&self) -> Result<Option<String>, ReportError> {
        let response = self
            .client
            .post(&self.on_demand_url)
            .json(&OnDemandKeyRequest {
                repo_full_name: &self.repo_full_name,
                workflow_run_id: self.run_id,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: OnDemandKeyResponse = response.json().await?;
        Ok(body.api_key.filter(|k| !k.is_empty()))
    }
}

#[async_trait]
impl ApiKeyProvider for StaticOrOnDemandKey {
    async fn api_key(&self) -> Option<String> {
        if let Some(key) = &self.configured {
            return Some(key.clone());
        }

        debug!(repo = %self.repo_full_name, "Requesting on-demand API key");
        match self.request_on_demand().await {
            Ok(Some(key)) => Some(key),
            Ok(None) => {
                info!("Collector did not issue an on-demand API key");
                None
            }
            Err(e) => {
                warn!(error = %e, "Unable to obtain on-demand API key");
                None
            }
        }
    }
}

/// POSTs envelopes to the collector's versioned telemetry endpoints.
pub struct HttpTelemetrySink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTelemetrySink {
    pub fn new(config: &ReporterConfig) -> Result<Self, ReportError> {
        Ok(Self {
            client: http_client(Duration::from_secs(config.timeout_secs))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    async fn send(&self, envelope: &TelemetryEnvelope, api_key: &str) -> Result<(), ReportError> {
        let url = format!(
            "{}/{}",
            self.base_url,
            envelope.telemetry_data.endpoint().path()
        );
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("ApiKey {}", api_key))
            .json(envelope)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ReportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// What happened to one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// No API key was available.
    Skipped,
    Failed,
}

/// Sends envelopes, resolving the API key at most once.
pub struct Reporter {
    keys: Arc<dyn ApiKeyProvider>,
    sink: Arc<dyn TelemetrySink>,
    api_key: OnceCell<Option<String>>,
}

impl Reporter {
    pub fn new(keys: Arc<dyn ApiKeyProvider>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            keys,
            sink,
            api_key: OnceCell::new(),
        }
    }

    async fn api_key(&self) -> Option<&str> {
        self.api_key
            .get_or_init(|| self.keys.api_key())
            .await
            .as_deref()
    }

    #[instrument(skip_all, fields(kind = kind(&envelope.telemetry_data), count = envelope.telemetry_data.len()))]
    pub async fn send(&self, envelope: &TelemetryEnvelope) -> SendOutcome {
        let Some(api_key) = self.api_key().await else {
            info!("Skipped sending telemetry since API key is not available");
            return SendOutcome::Skipped;
        };

        match self.sink.send(envelope, api_key).await {
            Ok(()) => {
                info!("Sent telemetry");
                SendOutcome::Sent
            }
            Err(e) => {
                error!(error = %e, "Unable to send telemetry");
                SendOutcome::Failed
            }
        }
    }
}

fn kind(data: &TelemetryData) -> &'static str {
    match data {
        TelemetryData::Metric { .. } => "metric",
        TelemetryData::Process { .. } => "process",
    }
}
