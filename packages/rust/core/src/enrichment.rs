//! Enrichment service client.
//!
//! Sends a normalized record to the remote analysis endpoint and reads back
//! an [`AiInsight`], or an explicit "no insight". Every insight is validated
//! before it reaches storage.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use regwatch_shared::{
    AiInsight, EnrichmentConfig, NormalizedRecord, RegwatchError, Result, TransientKind,
};

/// Analyses one record.
///
/// `Ok(None)` means the service looked at the record and had nothing to say.
/// Transient and [`RegwatchError::Enrichment`] failures are retried by the
/// coordinator; validation failures are not.
#[async_trait]
pub trait EnrichmentService: Send + Sync {
    async fn analyze(&self, record: &NormalizedRecord) -> Result<Option<AiInsight>>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    model: &'a str,
    record: &'a NormalizedRecord,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    insight: Option<AiInsight>,
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// JSON-over-HTTP analysis endpoint.
#[derive(Debug, Clone)]
pub struct HttpEnrichmentService {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl HttpEnrichmentService {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().build().map_err(|e| {
            RegwatchError::transient(
                TransientKind::Network,
                format!("failed to build enrichment client: {e}"),
            )
        })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
            model: model.into(),
            timeout,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Build from config. `None` when no endpoint is configured.
    pub fn from_config(config: &EnrichmentConfig) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.trim().is_empty()) else {
            return Ok(None);
        };
        let mut service = Self::new(
            endpoint,
            config.model.clone(),
            Duration::from_secs(config.timeout_secs),
        )?;
        if let Some(key) = config.api_key() {
            service = service.with_api_key(key);
        }
        Ok(Some(service))
    }
}

#[async_trait]
impl EnrichmentService for HttpEnrichmentService {
    #[instrument(skip_all, fields(identity = %record.identity))]
    async fn analyze(&self, record: &NormalizedRecord) -> Result<Option<AiInsight>> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&AnalyzeRequest {
                model: &self.model,
                record,
            });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RegwatchError::timeout(format!("enrichment timed out after {:?}", self.timeout))
            } else if e.is_connect() {
                RegwatchError::transient(TransientKind::Network, format!("enrichment unreachable: {e}"))
            } else {
                RegwatchError::Enrichment(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            debug!("no insight");
            return Ok(None);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RegwatchError::transient(
                TransientKind::RateLimited,
                "enrichment service rate limited",
            ));
        }
        if status.is_server_error() {
            return Err(RegwatchError::Enrichment(format!("service returned HTTP {status}")));
        }
        if !status.is_success() {
            return Err(RegwatchError::validation(format!(
                "enrichment service rejected record: HTTP {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RegwatchError::Enrichment(format!("failed to read response: {e}")))?;
        let parsed: AnalyzeResponse = serde_json::from_str(&body)
            .map_err(|e| RegwatchError::validation(format!("malformed insight: {e}")))?;

        parsed.insight.map(AiInsight::validate).transpose()
    }

    fn name(&self) -> &str {
        "http"
    }
}
