//! Service health probes

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::deploy::launcher::inspect_container;
use crate::errors::DeployError;
use crate::models::health::{HealthEndpoint, HealthSignal};
use crate::remote::exec::RemoteExec;

/// Body `status` values that mean the service can take requests
const READY_STATUSES: &[&str] = &["ok", "ready", "healthy", "up"];

/// Body `status` values that mean the process is alive but still loading
const LOADING_STATUSES: &[&str] = &["loading", "starting", "warming", "warming_up", "initializing"];

/// Takes one health sample of a service
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn sample(&self, endpoint: &HealthEndpoint) -> HealthSignal;
}

/// Probes the service over HTTP
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: Client,
}

impl HttpHealthProbe {
    pub fn new(request_timeout: Duration) -> Result<Self, DeployError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }

    /// 2xx from the readiness endpoint
    async fn ready_endpoint_ok(&self, url: Url) -> bool {
        match self.client.get(url.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Readiness probe {} failed: {}", url, e);
                false
            }
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn sample(&self, endpoint: &HealthEndpoint) -> HealthSignal {
        let url = match endpoint.health_url() {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot probe {}: {}", endpoint.host(), e);
                return HealthSignal::unreachable();
            }
        };

        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Health probe {} failed: {}", url, e);
                return HealthSignal::unreachable();
            }
        };

        if !response.status().is_success() {
            debug!("Health probe {} returned {}", url, response.status());
            return HealthSignal::not_responding();
        }

        let ready = match endpoint.ready_url() {
            Ok(Some(ready_url)) => self.ready_endpoint_ok(ready_url).await,
            Ok(None) => match response.text().await {
                Ok(body) => body_reports_ready(&body),
                Err(_) => false,
            },
            Err(e) => {
                warn!("Invalid readiness path: {}", e);
                false
            }
        };

        HealthSignal::new(true, true, ready)
    }
}

/// Readiness as reported in a 2xx health body
pub fn body_reports_ready(body: &str) -> bool {
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(body) else {
        return true;
    };

    if let Some(ready) = fields.get("ready").and_then(Value::as_bool) {
        return ready;
    }

    match fields
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
    {
        Some(status) if READY_STATUSES.contains(&status.as_str()) => true,
        Some(status) if LOADING_STATUSES.contains(&status.as_str()) => false,
        _ => true,
    }
}

/// HTTP probe that consults the container runtime when HTTP is silent, so
/// a dead or crash-looping container is reported as crashed instead of
/// still booting
pub struct ContainerAwareProbe {
    http: Arc<dyn HealthProbe>,
    remote: Arc<dyn RemoteExec>,
    container_name: String,
}

impl ContainerAwareProbe {
    pub fn new(
        http: Arc<dyn HealthProbe>,
        remote: Arc<dyn RemoteExec>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            http,
            remote,
            container_name: container_name.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for ContainerAwareProbe {
    async fn sample(&self, endpoint: &HealthEndpoint) -> HealthSignal {
        let signal = self.http.sample(endpoint).await;
        if signal.reachable {
            return signal;
        }

        match inspect_container(self.remote.as_ref(), endpoint.host(), &self.container_name).await {
            Ok(Some(state)) if state.is_dead() => {
                warn!(
                    "Container {} is {} (restarts: {})",
                    self.container_name, state.status, state.restart_count
                );
                HealthSignal::not_responding()
            }
            Ok(None) => {
                warn!("Container {} no longer exists", self.container_name);
                HealthSignal::not_responding()
            }
            Ok(Some(_)) => signal,
            Err(e) => {
                debug!("Container inspection failed: {}", e);
                signal
            }
        }
    }
}
