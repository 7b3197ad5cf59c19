//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::launcher::LaunchPolicy;
use crate::deploy::provisioner::ProvisionPolicy;
use crate::deploy::readiness::ReadinessPolicy;
use crate::logs::LogLevel;

/// Deployer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write logs to the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Cloud provider configuration
    #[serde(default)]
    pub provider: ProviderSettings,

    /// SSH configuration
    #[serde(default)]
    pub ssh: SshSettings,

    /// Instance reachability polling
    #[serde(default)]
    pub provision: ProvisionSettings,

    /// Container launch
    #[serde(default)]
    pub launch: LaunchSettings,

    /// Readiness gate
    #[serde(default)]
    pub readiness: ReadinessSettings,

    /// Destroy the instance when a stage fails instead of keeping it
    #[serde(default)]
    pub rollback_on_failure: bool,

    /// Dotenv file consulted before the process environment
    #[serde(default)]
    pub secrets_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            provider: ProviderSettings::default(),
            ssh: SshSettings::default(),
            provision: ProvisionSettings::default(),
            launch: LaunchSettings::default(),
            readiness: ReadinessSettings::default(),
            rollback_on_failure: false,
            secrets_file: None,
        }
    }
}

/// Cloud provider API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Base URL for the provider API
    #[serde(default = "default_provider_url")]
    pub base_url: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// SSH key name used when a preset does not name one
    #[serde(default)]
    pub default_ssh_key_name: Option<String>,
}

fn default_provider_url() -> String {
    "https://cloud.lambdalabs.com/api/v1".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_provider_url(),
            request_timeout_secs: default_request_timeout(),
            default_ssh_key_name: None,
        }
    }
}

/// SSH settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// Remote login user
    #[serde(default = "default_ssh_username")]
    pub username: String,

    /// Private key; the SSH_PRIVATE_KEY env var takes precedence
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound for a single remote command (image pulls can be large)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_ssh_username() -> String {
    "ubuntu".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    1800
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            username: default_ssh_username(),
            private_key_path: None,
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// Provisioning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    20
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl ProvisionSettings {
    pub fn policy(&self) -> ProvisionPolicy {
        ProvisionPolicy {
            max_attempts: self.max_attempts.max(1),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }
}

/// Launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSettings {
    /// Attempts per launch step on transient remote errors
    #[serde(default = "default_step_attempts")]
    pub step_attempts: u32,

    /// Run nvidia-smi inside the container after start
    #[serde(default = "default_true")]
    pub verify_gpu: bool,

    /// Install docker from the upstream apt repository when the host has none
    #[serde(default)]
    pub bootstrap_docker: bool,
}

fn default_step_attempts() -> u32 {
    3
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            step_attempts: default_step_attempts(),
            verify_gpu: true,
            bootstrap_docker: false,
        }
    }
}

impl LaunchSettings {
    pub fn policy(&self) -> LaunchPolicy {
        LaunchPolicy {
            step_attempts: self.step_attempts.max(1),
            verify_gpu: self.verify_gpu,
            bootstrap_docker: self.bootstrap_docker,
            ..Default::default()
        }
    }
}

/// Readiness gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Total warm-up budget; large models routinely need several minutes
    #[serde(default = "default_readiness_timeout")]
    pub timeout_secs: u64,

    /// Per-probe HTTP timeout
    #[serde(default = "default_probe_timeout")]
    pub request_timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_readiness_timeout() -> u64 {
    600
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            timeout_secs: default_readiness_timeout(),
            request_timeout_secs: default_probe_timeout(),
        }
    }
}

impl ReadinessSettings {
    pub fn policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}
