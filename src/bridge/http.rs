//! HTTP delegate executor
//!
//! Talks to the delegate service with reqwest:
//! - `POST /execute` submits a plan and returns `{run_id}`
//! - `GET /status/{run_id}` returns the current [`RemoteStatus`]
//! - `DELETE /executions/{run_id}` requests cancellation
//! - `GET /health` checks the service is up

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::push::PushListener;
use super::{AutomationRequest, DelegateError, DelegateExecutor, RemoteStatus};
use crate::task::DelegateConfig;

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    run_id: String,
}

#[derive(Debug)]
pub struct HttpDelegate {
    config: DelegateConfig,
    client: reqwest::Client,
    push: Option<PushListener>,
}

impl HttpDelegate {
    pub fn new(config: DelegateConfig) -> Result<Self, DelegateError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| DelegateError::Connection(e.to_string()))?;

        Ok(Self {
            config,
            client,
            push: None,
        })
    }

    /// Create the client and, if configured, start the push listener.
    /// Must be called inside a tokio runtime when `push_events` is set.
    pub fn from_config(config: &DelegateConfig) -> Result<Self, DelegateError> {
        let mut delegate = Self::new(config.clone())?;
        if config.push_events {
            delegate.push = Some(PushListener::start(&config.base_url));
        }
        Ok(delegate)
    }

    pub fn config(&self) -> &DelegateConfig {
        &self.config
    }

    fn build_url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!("{}{}", base, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, DelegateError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("").to_string());
        Err(DelegateError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

fn connection_error(e: reqwest::Error) -> DelegateError {
    DelegateError::Connection(e.to_string())
}

#[async_trait]
impl DelegateExecutor for HttpDelegate {
    async fn submit(&self, request: &AutomationRequest) -> Result<String, DelegateError> {
        let url = self.build_url("/execute");
        debug!("POST {} ({} steps)", url, request.workflow_steps.len());

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(connection_error)?;
        let body: SubmitResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| DelegateError::Rejected(format!("Unexpected submit response: {}", e)))?;

        info!("Delegate accepted run {}", body.run_id);
        Ok(body.run_id)
    }

    async fn poll(&self, remote_run_id: &str) -> Result<RemoteStatus, DelegateError> {
        let url = self.build_url(&format!("/status/{}", remote_run_id));
        let response = self.client.get(&url).send().await.map_err(connection_error)?;
        let text = Self::check(response)
            .await?
            .text()
            .await
            .map_err(connection_error)?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn cancel(&self, remote_run_id: &str) -> Result<(), DelegateError> {
        let url = self.build_url(&format!("/executions/{}", remote_run_id));
        info!("Requesting cancellation of {}", remote_run_id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(connection_error)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn health(&self) -> Result<(), DelegateError> {
        let response = self
            .client
            .get(self.build_url("/health"))
            .send()
            .await
            .map_err(connection_error)?;
        Self::check(response).await?;
        Ok(())
    }

    fn push_updates(&self) -> Option<broadcast::Receiver<RemoteStatus>> {
        self.push.as_ref().map(PushListener::subscribe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url() {
        let delegate = HttpDelegate::new(DelegateConfig::new("http://localhost:8000/")).unwrap();
        assert_eq!(delegate.build_url("/execute"), "http://localhost:8000/execute");
        assert_eq!(
            delegate.build_url("status/r1"),
            "http://localhost:8000/status/r1"
        );
    }

    #[test]
    fn test_no_push_without_listener() {
        let delegate = HttpDelegate::new(DelegateConfig::new("http://localhost:8000")).unwrap();
        assert!(delegate.push_updates().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_delegate_is_connection_error() {
        let mut config = DelegateConfig::new("http://127.0.0.1:9");
        config.timeout_ms = 500;
        let delegate = HttpDelegate::new(config).unwrap();
        let request = AutomationRequest {
            workflow_steps: vec![],
            template_inputs: Default::default(),
            target_url: None,
        };
        assert!(matches!(
            delegate.submit(&request).await,
            Err(DelegateError::Connection(_))
        ));
    }
}
