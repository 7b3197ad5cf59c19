//! Health signal models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::DeployError;

/// Where the service answers health and readiness probes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEndpoint {
    base: Url,
    health_path: String,
    ready_path: Option<String>,
}

impl HealthEndpoint {
    /// Build an endpoint for `http://<address>:<port>`
    pub fn new(
        address: &str,
        port: u16,
        health_path: &str,
        ready_path: Option<&str>,
    ) -> Result<Self, DeployError> {
        let base = Url::parse(&format!("http://{}:{}/", address, port))
            .map_err(|e| DeployError::ValidationError(format!("Invalid address {}: {}", address, e)))?;
        Ok(Self {
            base,
            health_path: health_path.to_string(),
            ready_path: ready_path.map(str::to_string),
        })
    }

    pub fn health_url(&self) -> Result<Url, DeployError> {
        self.join(&self.health_path)
    }

    pub fn ready_url(&self) -> Result<Option<Url>, DeployError> {
        self.ready_path.as_deref().map(|p| self.join(p)).transpose()
    }

    /// Host the service runs on
    pub fn host(&self) -> &str {
        self.base.host_str().unwrap_or_default()
    }

    fn join(&self, path: &str) -> Result<Url, DeployError> {
        self.base
            .join(path)
            .map_err(|e| DeployError::ValidationError(format!("Invalid path {}: {}", path, e)))
    }
}

/// One observed health sample
///
/// `ready` implies `responding` implies `reachable`; the constructors keep it
/// that way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSignal {
    pub reachable: bool,
    pub responding: bool,
    pub ready: bool,
    pub timestamp: DateTime<Utc>,
}

impl HealthSignal {
    pub fn new(reachable: bool, responding: bool, ready: bool) -> Self {
        let responding = responding || ready;
        let reachable = reachable || responding;
        Self {
            reachable,
            responding,
            ready,
            timestamp: Utc::now(),
        }
    }

    /// Nothing answers at the transport layer
    pub fn unreachable() -> Self {
        Self::new(false, false, false)
    }

    /// Host answers but the service process does not
    pub fn not_responding() -> Self {
        Self::new(true, false, false)
    }

    /// Service answers but is still loading
    pub fn warming() -> Self {
        Self::new(true, true, false)
    }

    pub fn ready() -> Self {
        Self::new(true, true, true)
    }

    pub fn phase(&self) -> ReadinessPhase {
        if self.ready {
            ReadinessPhase::Ready
        } else if self.responding {
            ReadinessPhase::Warming
        } else if self.reachable {
            ReadinessPhase::Crashed
        } else {
            ReadinessPhase::Booting
        }
    }
}

/// Gate classification of a health signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessPhase {
    /// Not reachable yet, keep waiting
    Booting,

    /// Reachable but the process is gone, never becomes ready
    Crashed,

    /// Answering but still loading
    Warming,

    Ready,
}
