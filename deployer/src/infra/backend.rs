//! Provisioning backend contract

use std::sync::Arc;

use async_trait::async_trait;

pub use cloud_api::InstanceStatus;

use crate::authn::credentials::CloudApiKey;
use crate::errors::DeployError;
use crate::models::preset::InstanceSpec;

/// Returned by `create`; the address may not be assigned yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    pub instance_id: String,
    pub address: Option<String>,
}

/// Provider view of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceObservation {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub address: Option<String>,
}

impl InstanceObservation {
    /// The instance is going away or gone and will never become usable
    pub fn is_gone(&self) -> bool {
        matches!(
            self.status,
            InstanceStatus::Terminating | InstanceStatus::Terminated
        )
    }

    /// Active with a public address
    pub fn is_network_ready(&self) -> bool {
        self.status == InstanceStatus::Active && self.address.is_some()
    }
}

/// Creates and destroys GPU instances.
///
/// Eventually consistent: an instance returned by `create` may take minutes
/// to get an address and accept connections.
#[async_trait]
pub trait InfraBackend: Send + Sync {
    /// Request one instance named `name`. Never retried by callers.
    async fn create(&self, name: &str, spec: &InstanceSpec) -> Result<CreatedInstance, DeployError>;

    async fn describe(&self, instance_id: &str) -> Result<InstanceObservation, DeployError>;

    /// Live (not terminating) instance carrying this name, if any
    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceObservation>, DeployError>;

    /// Terminate an instance; an unknown id is not an error
    async fn destroy(&self, instance_id: &str) -> Result<(), DeployError>;
}

/// Builds a backend from the locally bound provider key
pub trait BackendFactory: Send + Sync {
    fn connect(&self, api_key: &CloudApiKey) -> Result<Arc<dyn InfraBackend>, DeployError>;
}
