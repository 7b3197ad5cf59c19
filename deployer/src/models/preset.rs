//! Preset models
//!
//! A preset is the immutable deployment intent for one named deployment:
//! which instance to rent, which image to run on it, and how to reach the
//! service once it is up.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::models::health::HealthEndpoint;
use crate::utils::sha256_hash;

/// Instance request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Provider instance type (e.g. "gpu_1x_a10")
    pub instance_type: String,

    /// Provider region
    #[serde(default = "default_region")]
    pub region: String,

    /// Name of the SSH key registered with the provider
    #[serde(default)]
    pub ssh_key_name: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Private registry login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySpec {
    /// Registry host (e.g. "ghcr.io")
    pub server: String,

    pub username: String,

    /// Reference to the password, e.g. "${GHCR_TOKEN}"
    pub password: String,
}

/// Container restart policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    Always,
    #[default]
    UnlessStopped,
    OnFailure(Option<u32>),
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::No => f.write_str("no"),
            RestartPolicy::Always => f.write_str("always"),
            RestartPolicy::UnlessStopped => f.write_str("unless-stopped"),
            RestartPolicy::OnFailure(None) => f.write_str("on-failure"),
            RestartPolicy::OnFailure(Some(n)) => write!(f, "on-failure:{}", n),
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "no" | "never" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure(None)),
            other => match other.strip_prefix("on-failure:") {
                Some(n) => n
                    .parse()
                    .map(|n| RestartPolicy::OnFailure(Some(n)))
                    .map_err(|_| format!("Invalid restart retry count: {}", n)),
                None => Err(format!("Invalid restart policy: {}", s)),
            },
        }
    }
}

impl Serialize for RestartPolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RestartPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Deployment preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    /// Unique deployment name; defaults to the preset file stem
    #[serde(default)]
    pub name: String,

    pub instance: InstanceSpec,

    /// Image reference to pull, or the tag to build
    pub image: String,

    /// Directory on the remote host to build the image from
    #[serde(default)]
    pub build_context: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Separate readiness endpoint, when the service has one
    #[serde(default)]
    pub ready_path: Option<String>,

    /// Container environment; values may reference secrets as ${NAME}
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    #[serde(default)]
    pub registry: Option<RegistrySpec>,

    /// The image loads a gated model and needs an access token
    #[serde(default = "default_true")]
    pub requires_model_access: bool,

    /// Reference to the provider API key
    #[serde(default = "default_cloud_api_key")]
    pub cloud_api_key: String,
}

fn default_port() -> u16 {
    8080
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cloud_api_key() -> String {
    "${LAMBDA_API_KEY}".to_string()
}

/// Name rule shared by presets and record files
pub fn validate_name(name: &str) -> Result<(), DeployError> {
    if name.is_empty() {
        return Err(DeployError::ValidationError("Preset name is empty".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        || name.starts_with('.')
    {
        return Err(DeployError::ValidationError(format!(
            "Preset name '{}' may only contain letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

impl Preset {
    /// Check the preset before anything is created for it
    pub fn validate(&self) -> Result<(), DeployError> {
        validate_name(&self.name)?;

        if self.image.trim().is_empty() {
            return Err(DeployError::ValidationError(format!(
                "Preset '{}' has no image",
                self.name
            )));
        }
        if self.instance.instance_type.trim().is_empty() {
            return Err(DeployError::ValidationError(format!(
                "Preset '{}' has no instance type",
                self.name
            )));
        }
        if self.port == 0 {
            return Err(DeployError::ValidationError(format!(
                "Preset '{}' has port 0",
                self.name
            )));
        }
        let paths = std::iter::once(&self.health_path).chain(self.ready_path.iter());
        for path in paths {
            if !path.starts_with('/') {
                return Err(DeployError::ValidationError(format!(
                    "Preset '{}' path '{}' must start with '/'",
                    self.name, path
                )));
            }
        }
        Ok(())
    }

    /// Digest of the fields frozen once the deployment reaches launch
    pub fn frozen_digest(&self) -> String {
        let frozen = serde_json::json!({
            "instance": self.instance,
            "image": self.image,
            "build_context": self.build_context,
        });
        sha256_hash(frozen.to_string().as_bytes())
    }

    /// Name of the container on the remote host
    pub fn container_name(&self) -> &str {
        &self.name
    }

    /// Health endpoint for an instance address
    pub fn health_endpoint(&self, address: &str) -> Result<HealthEndpoint, DeployError> {
        HealthEndpoint::new(
            address,
            self.port,
            &self.health_path,
            self.ready_path.as_deref(),
        )
    }
}
