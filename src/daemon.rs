use std::time::Duration;

use async_trait::async_trait;

use crate::config::DaemonConfig;
use crate::error::AppError;
use crate::events::DaemonEvent;

/// Slack added to the HTTP client deadline on top of the server-side
/// long-poll hold time, so the server answers before the client gives up.
const LONG_POLL_SLACK_SECS: u64 = 5;

/// Deadline for the lightweight liveness probe.
const PROBE_TIMEOUT_SECS: u64 = 5;

/// Everything the resilience core needs from the daemon. The core does not
/// know what a folder or device is; it only probes, polls, and restarts.
#[async_trait]
pub trait DaemonAdapter: Send + Sync {
    /// Lightweight liveness call. `Ok(())` means the daemon answered.
    async fn probe(&self) -> Result<(), AppError>;

    /// Long-poll the ordered event stream. The server holds the request open
    /// for up to `timeout_secs` and may return an empty batch.
    async fn poll_events(
        &self,
        since: u64,
        limit: u32,
        timeout_secs: u32,
    ) -> Result<Vec<DaemonEvent>, AppError>;

    /// Ask a running daemon to restart itself.
    async fn restart_process(&self) -> Result<(), AppError>;

    /// Launch the daemon process from scratch. Only adapters owned by the
    /// shell (which manages the sidecar binary) can do this; the plain HTTP
    /// adapter cannot start a process it can no longer reach.
    async fn start_process(&self) -> Result<(), AppError> {
        Err(AppError::Process(
            "this adapter cannot launch the daemon process".into(),
        ))
    }
}

/// `DaemonAdapter` over the daemon's local REST API.
pub struct HttpDaemonClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpDaemonClient {
    pub fn new(config: &DaemonConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::Config(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            api_key: config.api_key.clone(),
        })
    }

    async fn get_json(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, AppError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("X-API-Key", &self.api_key)
            .timeout(timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(AppError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }
}

/// Build the events query path. Parameters are only included when the caller
/// wants a non-default, matching what the daemon expects.
fn events_path(since: u64, limit: u32, timeout_secs: u32) -> String {
    format!("/rest/events?since={since}&limit={limit}&timeout={timeout_secs}")
}

#[async_trait]
impl DaemonAdapter for HttpDaemonClient {
    async fn probe(&self) -> Result<(), AppError> {
        self.get_json(
            "/rest/system/ping",
            Duration::from_secs(PROBE_TIMEOUT_SECS),
        )
        .await
        .map(|_| ())
    }

    async fn poll_events(
        &self,
        since: u64,
        limit: u32,
        timeout_secs: u32,
    ) -> Result<Vec<DaemonEvent>, AppError> {
        let path = events_path(since, limit, timeout_secs);
        let deadline = Duration::from_secs(u64::from(timeout_secs) + LONG_POLL_SLACK_SECS);
        let value = self.get_json(&path, deadline).await?;
        let events: Vec<DaemonEvent> =
            serde_json::from_value(value).map_err(|e| AppError::Parse(e.to_string()))?;
        Ok(events)
    }

    async fn restart_process(&self) -> Result<(), AppError> {
        let resp = self
            .client
            .post(format!("{}/rest/system/restart", self.base_url))
            .header("X-API-Key", &self.api_key)
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(AppError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}
