use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{ConnectorError, SyncController, SyncState};

/// Sync controller client for an ArgoCD-style application API. The
/// controller itself lives outside this system; we only trigger it and read
/// its status.
pub struct ArgoSync {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ArgoSync {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.map(std::borrow::ToOwned::to_owned),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn classify_request(err: reqwest::Error) -> ConnectorError {
    if err.is_timeout() || err.is_connect() {
        ConnectorError::Transient(format!("sync controller: {err}"))
    } else {
        ConnectorError::Permanent(format!("sync controller: {err}"))
    }
}

fn classify_status(status: reqwest::StatusCode, operation: &str) -> ConnectorError {
    match status.as_u16() {
        401 | 403 => ConnectorError::Fatal(format!("sync controller {operation}: {status}")),
        500..=599 => ConnectorError::Transient(format!("sync controller {operation}: {status}")),
        _ => ConnectorError::Permanent(format!("sync controller {operation}: {status}")),
    }
}

#[async_trait]
impl SyncController for ArgoSync {
    #[tracing::instrument(skip(self), fields(%project), err)]
    async fn trigger_sync(&self, project: &str) -> Result<(), ConnectorError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/applications/{project}/sync"),
            )
            .json(&json!({ "prune": true }))
            .send()
            .await
            .map_err(classify_request)?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(%project, "sync triggered");
            return Ok(());
        }
        // The application manifest may not have been picked up yet right
        // after a commit; let the engine's backoff absorb that window.
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ConnectorError::Transient(format!(
                "application '{project}' not yet registered"
            )));
        }
        Err(classify_status(status, "trigger"))
    }

    async fn sync_status(&self, project: &str) -> Result<SyncState, ConnectorError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/applications/{project}"),
            )
            .send()
            .await
            .map_err(classify_request)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(SyncState::Absent);
        }
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "status"));
        }

        let body: serde_json::Value = response.json().await.map_err(classify_request)?;
        let sync = body
            .pointer("/status/sync/status")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown");
        let health = body
            .pointer("/status/health/status")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown");

        Ok(match (sync, health) {
            ("Synced", "Healthy") => SyncState::Synced,
            (_, "Degraded") => SyncState::Degraded,
            _ => SyncState::Progressing,
        })
    }

    #[tracing::instrument(skip(self), fields(%project), err)]
    async fn delete_application(&self, project: &str) -> Result<(), ConnectorError> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/api/v1/applications/{project}?cascade=true"),
            )
            .send()
            .await
            .map_err(classify_request)?;

        let status = response.status();
        // Absence is success.
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(classify_status(status, "delete"))
    }
}
