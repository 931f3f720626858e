//! Generic HTTP provider adapter
//!
//! Speaks a small JSON contract that a CI/CD backend (or a shim in front of
//! one) exposes:
//! - `POST /executions` submits a job and answers `{"reference": "..."}`
//! - `GET /executions/{ref}` answers a `ProviderStatus`
//! - `POST /executions/{ref}/cancel` answers `{"ack": "cancelled" | "not_running"}`
//! - `GET /health` answers a `HealthReport`

use async_trait::async_trait;
use conduit_core::domain::provider::PipelineType;
use conduit_core::dto::provider::{CancelAck, HealthReport, ProviderStatus};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::provider::{ProviderAdapter, ProviderRef, SubmitRequest};

/// HTTP implementation of `ProviderAdapter`
pub struct HttpProvider {
    client: Client,
    name: String,
    kind: String,
    capabilities: Vec<PipelineType>,
    endpoint: String,
    token: Option<String>,
}

impl HttpProvider {
    /// Creates an adapter from a provider configuration entry
    ///
    /// # Arguments
    /// * `config` - provider entry; `endpoint` is the base URL (e.g., "http://jenkins-shim:8080")
    /// * `timeout` - request timeout applied to every call
    pub fn from_config(config: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Unreachable(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            client,
            name: config.name.clone(),
            kind: config.kind.clone(),
            capabilities: config.capabilities.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ProviderError> {
        self.authorize(request).send().await.map_err(transport_error)
    }
}

#[async_trait]
impl ProviderAdapter for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn capabilities(&self) -> Vec<PipelineType> {
        self.capabilities.clone()
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<ProviderRef, ProviderError> {
        let response = self
            .send(self.client.post(self.url("/executions")).json(request))
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(format!("{} - {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Unreachable(format!("{} - {}", status, body)));
        }

        let accepted = response
            .json::<SubmitResponse>()
            .await
            .map_err(|e| ProviderError::Rejected(format!("Invalid submit response: {}", e)))?;

        Ok(accepted.reference)
    }

    async fn fetch_status(&self, reference: &str) -> Result<ProviderStatus, ProviderError> {
        let response = self
            .send(self.client.get(self.url(&format!("/executions/{}", reference))))
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::UnknownExecution(reference.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Unreachable(format!("{} - {}", status, body)));
        }

        response
            .json::<ProviderStatus>()
            .await
            .map_err(|e| ProviderError::Unreachable(format!("Invalid status response: {}", e)))
    }

    async fn cancel(&self, reference: &str) -> Result<CancelAck, ProviderError> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("/executions/{}/cancel", reference))),
            )
            .await?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => Err(ProviderError::UnknownExecution(reference.to_string())),
            StatusCode::NOT_IMPLEMENTED | StatusCode::METHOD_NOT_ALLOWED => {
                Err(ProviderError::CancelUnsupported(self.name.clone()))
            }
            status if status.is_success() => response
                .json::<CancelResponse>()
                .await
                .map(|body| body.ack)
                .map_err(|e| ProviderError::Unreachable(format!("Invalid cancel response: {}", e))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Unreachable(format!("{} - {}", status, body)))
            }
        }
    }

    async fn health_check(&self) -> Result<HealthReport, ProviderError> {
        let response = self.send(self.client.get(self.url("/health"))).await?;

        let status = response.status();
        if !status.is_success() {
            // The provider answered, it just is not fit for work
            return Ok(HealthReport::unhealthy(format!("health endpoint returned {}", status)));
        }

        response
            .json::<HealthReport>()
            .await
            .map_err(|e| ProviderError::Unreachable(format!("Invalid health response: {}", e)))
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Unreachable(format!("request timed out: {}", e))
    } else {
        ProviderError::Unreachable(e.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SubmitResponse {
    reference: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CancelResponse {
    ack: CancelAck,
}
