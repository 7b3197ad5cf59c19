//! Lambda Cloud backend

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use cloud_api::{
    DataEnvelope, Instance, LaunchInstanceData, LaunchInstanceRequest, TerminateInstancesData,
    TerminateInstancesRequest,
};

use crate::authn::credentials::CloudApiKey;
use crate::authn::secrets::clone_secret;
use crate::errors::DeployError;
use crate::http::client::HttpClient;
use crate::infra::backend::{BackendFactory, CreatedInstance, InfraBackend, InstanceObservation};
use crate::models::preset::InstanceSpec;
use crate::storage::settings::ProviderSettings;

/// Env var naming the provider SSH key when neither preset nor settings do
pub const SSH_KEY_NAME_ENV: &str = "LAMBDA_SSH_KEY_NAME";

/// `InfraBackend` over the Lambda Cloud REST API
pub struct LambdaBackend {
    http: HttpClient,
    api_key: SecretString,
    default_ssh_key_name: Option<String>,
}

impl LambdaBackend {
    /// Build a backend from the locally bound API key
    pub fn new(api_key: &CloudApiKey, settings: &ProviderSettings) -> Result<Self, DeployError> {
        let http = HttpClient::new(
            &settings.base_url,
            std::time::Duration::from_secs(settings.request_timeout_secs),
        )?;
        let default_ssh_key_name = settings
            .default_ssh_key_name
            .clone()
            .or_else(|| std::env::var(SSH_KEY_NAME_ENV).ok())
            .filter(|k| !k.is_empty());

        Ok(Self {
            http,
            api_key: clone_secret(api_key.key()),
            default_ssh_key_name,
        })
    }

    fn token(&self) -> &str {
        self.api_key.expose_secret()
    }

    fn ssh_key_name(&self, spec: &InstanceSpec) -> Result<String, DeployError> {
        spec.ssh_key_name
            .clone()
            .or_else(|| self.default_ssh_key_name.clone())
            .ok_or_else(|| {
                DeployError::ConfigError(format!(
                    "No SSH key name: set instance.ssh_key_name, provider.default_ssh_key_name or {}",
                    SSH_KEY_NAME_ENV
                ))
            })
    }
}

fn observe(instance: Instance) -> InstanceObservation {
    InstanceObservation {
        instance_id: instance.id,
        status: instance.status,
        address: instance.ip.filter(|ip| !ip.is_empty()),
    }
}

#[async_trait]
impl InfraBackend for LambdaBackend {
    async fn create(&self, name: &str, spec: &InstanceSpec) -> Result<CreatedInstance, DeployError> {
        let request = LaunchInstanceRequest {
            region_name: spec.region.clone(),
            instance_type_name: spec.instance_type.clone(),
            ssh_key_names: vec![self.ssh_key_name(spec)?],
            quantity: 1,
            name: Some(name.to_string()),
        };

        let response: DataEnvelope<LaunchInstanceData> = self
            .http
            .post("/instance-operations/launch", self.token(), &request)
            .await?;

        let instance_id = response.data.instance_ids.into_iter().next().ok_or_else(|| {
            DeployError::ProvisionRejected("Launch returned no instance id".to_string())
        })?;

        info!(
            "Requested {} in {} for '{}': {}",
            spec.instance_type, spec.region, name, instance_id
        );
        Ok(CreatedInstance {
            instance_id,
            address: None,
        })
    }

    async fn describe(&self, instance_id: &str) -> Result<InstanceObservation, DeployError> {
        let response: DataEnvelope<Instance> = self
            .http
            .get(&format!("/instances/{}", instance_id), self.token())
            .await?;
        Ok(observe(response.data))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceObservation>, DeployError> {
        let response: DataEnvelope<Vec<Instance>> = self.http.get("/instances", self.token()).await?;
        let found = response
            .data
            .into_iter()
            .filter(|i| i.name.as_deref() == Some(name))
            .map(observe)
            .find(|o| !o.is_gone());
        debug!("Instance lookup for '{}': {:?}", name, found);
        Ok(found)
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), DeployError> {
        let request = TerminateInstancesRequest {
            instance_ids: vec![instance_id.to_string()],
        };
        let result: Result<DataEnvelope<TerminateInstancesData>, DeployError> = self
            .http
            .post("/instance-operations/terminate", self.token(), &request)
            .await;

        match result {
            Ok(_) => {
                info!("Terminated instance {}", instance_id);
                Ok(())
            }
            Err(DeployError::NotFound(_)) => {
                debug!("Instance {} already gone", instance_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Connects `LambdaBackend`s with the provider settings
#[derive(Debug, Clone)]
pub struct LambdaConnector {
    settings: ProviderSettings,
}

impl LambdaConnector {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }
}

impl BackendFactory for LambdaConnector {
    fn connect(&self, api_key: &CloudApiKey) -> Result<Arc<dyn InfraBackend>, DeployError> {
        Ok(Arc::new(LambdaBackend::new(api_key, &self.settings)?))
    }
}
