//! Error types for the deployer

use std::fmt;

use thiserror::Error;

use crate::authn::credentials::CredentialKind;
use crate::deploy::fsm::DeploymentStatus;

/// Main error type for the deployer
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Name conflict: {0}")]
    NameConflict(String),

    #[error("Poisoned identity '{0}': a previous attempt left external resources behind, choose a new name")]
    PoisonedIdentity(String),

    #[error("Deployment already in progress: {0}")]
    AlreadyInProgress(String),

    #[error("Preset '{0}' changed its instance or image after launch; deploy it under a new name")]
    PresetFrozen(String),

    #[error("Missing {kind} credential: {detail}")]
    MissingCredential { kind: CredentialKind, detail: String },

    #[error("Unresolved reference {reference} in env var {key}")]
    UnresolvedReference { key: String, reference: String },

    #[error("Instance not reachable after {attempts} attempts: {detail}")]
    ProvisionTimeout { attempts: u32, detail: String },

    #[error("Provisioning rejected: {0}")]
    ProvisionRejected(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Registry authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("Runtime capability unavailable: {0}")]
    RuntimeCapabilityUnavailable(String),

    #[error("Service crashed: {0}")]
    ServiceCrashed(String),

    #[error("Service not ready after {polls} polls ({elapsed_secs}s, {})", readiness_label(.warming))]
    ReadinessTimeout {
        polls: u32,
        elapsed_secs: u64,
        warming: bool,
    },

    #[error("Remote connectivity error: {0}")]
    RemoteConnectivity(String),

    #[error("Remote authentication error: {0}")]
    RemoteAuth(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn readiness_label(warming: &bool) -> &'static str {
    if *warming {
        "still warming up"
    } else {
        "never answered"
    }
}

impl DeployError {
    /// Stable name of the error kind, used in failure reports
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::IoError(_) => "Io",
            DeployError::JsonError(_) => "Json",
            DeployError::HttpError(_) => "Http",
            DeployError::NameConflict(_) => "NameConflict",
            DeployError::PoisonedIdentity(_) => "PoisonedIdentity",
            DeployError::AlreadyInProgress(_) => "AlreadyInProgress",
            DeployError::PresetFrozen(_) => "PresetFrozen",
            DeployError::MissingCredential { .. } => "MissingCredential",
            DeployError::UnresolvedReference { .. } => "UnresolvedReference",
            DeployError::ProvisionTimeout { .. } => "ProvisionTimeout",
            DeployError::ProvisionRejected(_) => "ProvisionRejected",
            DeployError::ProviderUnavailable(_) => "ProviderUnavailable",
            DeployError::AuthRejected(_) => "AuthRejected",
            DeployError::ImagePullFailed(_) => "ImagePullFailed",
            DeployError::RuntimeCapabilityUnavailable(_) => "RuntimeCapabilityUnavailable",
            DeployError::ServiceCrashed(_) => "ServiceCrashed",
            DeployError::ReadinessTimeout { .. } => "ReadinessTimeout",
            DeployError::RemoteConnectivity(_) => "RemoteConnectivity",
            DeployError::RemoteAuth(_) => "RemoteAuth",
            DeployError::Cancelled(_) => "Cancelled",
            DeployError::InvalidTransition(_) => "InvalidTransition",
            DeployError::ConfigError(_) => "Config",
            DeployError::StorageError(_) => "Storage",
            DeployError::ValidationError(_) => "Validation",
            DeployError::NotFound(_) => "NotFound",
            DeployError::Internal(_) => "Internal",
        }
    }

    /// Whether a polling loop may retry after this error
    pub fn is_transient(&self) -> bool {
        match self {
            DeployError::RemoteConnectivity(_) | DeployError::ProviderUnavailable(_) => true,
            DeployError::HttpError(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Terminal failure of one deployment attempt, as reported to the operator
#[derive(Debug)]
pub struct DeploymentFailure {
    /// Preset name
    pub name: String,

    /// Stage the deployment was in when it failed
    pub stage: DeploymentStatus,

    /// Distinguishing error
    pub error: DeployError,

    /// Whether the name must not be reused
    pub poisoned: bool,
}

impl DeploymentFailure {
    pub fn new(name: impl Into<String>, stage: DeploymentStatus, error: DeployError) -> Self {
        let poisoned = matches!(error, DeployError::PoisonedIdentity(_));
        Self {
            name: name.into(),
            stage,
            error,
            poisoned,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

impl fmt::Display for DeploymentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deployment '{}' failed in stage {} [{}]: {}",
            self.name,
            self.stage,
            self.kind(),
            self.error
        )?;
        if self.poisoned {
            write!(f, " (identity poisoned, retry under a new name)")?;
        }
        Ok(())
    }
}

impl std::error::Error for DeploymentFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
