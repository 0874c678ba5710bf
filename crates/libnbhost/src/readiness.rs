use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ReadinessSection;
use crate::error::{HostError, HostResult};

/// Probes the engine's base URL until it answers.
///
/// Any HTTP response counts, error statuses included: the engine serves
/// error pages while it is still initialising, and transport reachability is
/// all this layer needs.
#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    client: reqwest::Client,
    max_attempts: u32,
    interval: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::new(60, Duration::from_secs(1), Duration::from_secs(2))
            .expect("default readiness HTTP client")
    }
}

impl ReadinessPoller {
    pub fn new(max_attempts: u32, interval: Duration, request_timeout: Duration) -> HostResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|err| HostError::HttpClient(err.to_string()))?;
        Ok(Self {
            client,
            max_attempts: max_attempts.max(1),
            interval,
        })
    }

    pub fn from_config(config: &ReadinessSection) -> HostResult<Self> {
        Self::new(
            config.max_attempts,
            config.interval(),
            config.request_timeout(),
        )
    }

    /// One reachability probe.
    pub async fn probe(&self, base_url: &str) -> bool {
        match self.client.get(base_url).send().await {
            Ok(response) => {
                debug!(status = %response.status(), "engine answered");
                true
            }
            Err(err) => {
                debug!("engine not reachable yet: {err}");
                false
            }
        }
    }

    /// Returns the number of attempts used. Stops early, with
    /// [`HostError::StartCancelled`], once `cancel` fires.
    pub async fn poll_until_ready(
        &self,
        base_url: &str,
        cancel: &CancellationToken,
    ) -> HostResult<u32> {
        for attempt in 1..=self.max_attempts {
            let answered = tokio::select! {
                answered = self.probe(base_url) => answered,
                _ = cancel.cancelled() => return Err(HostError::StartCancelled),
            };
            if answered {
                info!(attempt, url = base_url, "engine server is reachable");
                return Ok(attempt);
            }
            if attempt == self.max_attempts {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => return Err(HostError::StartCancelled),
            }
        }
        Err(HostError::ServerNotReady {
            attempts: self.max_attempts,
        })
    }
}
