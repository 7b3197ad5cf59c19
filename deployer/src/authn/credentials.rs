//! Credential types
//!
//! Each credential is bound to exactly one execution context. The operator's
//! machine (local) and root on the remote host are separate credential
//! stores: a registry login done locally is worthless to `sudo docker` on the
//! instance, so nothing here hands a credential to a context it was not
//! bound to.

use std::collections::BTreeMap;
use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Which credential is meant, named in `MissingCredential` errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// Image registry pull credential
    Registry,

    /// Token for gated model downloads (HF_TOKEN and friends)
    ModelAccess,

    /// Provider API key
    CloudApi,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Registry => f.write_str("registry"),
            CredentialKind::ModelAccess => f.write_str("model-access"),
            CredentialKind::CloudApi => f.write_str("cloud-API"),
        }
    }
}

/// Where a credential is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    /// The machine running the deployer
    Local,

    /// Root on the remote instance, where the container runtime runs
    RemoteRoot,
}

/// Registry login for the remote container runtime
#[derive(Debug)]
pub struct RegistryCredential {
    pub server: String,
    pub username: String,
    password: SecretString,
}

impl RegistryCredential {
    pub fn new(server: impl Into<String>, username: impl Into<String>, password: SecretString) -> Self {
        Self {
            server: server.into(),
            username: username.into(),
            password,
        }
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

/// Gated-model token, injected into the container environment
#[derive(Debug)]
pub struct ModelAccessToken {
    /// Env var the container reads it from
    pub env_var: String,
    token: SecretString,
}

impl ModelAccessToken {
    pub fn new(env_var: impl Into<String>, token: SecretString) -> Self {
        Self {
            env_var: env_var.into(),
            token,
        }
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }
}

/// Provider API key, used from the local machine only
#[derive(Debug)]
pub struct CloudApiKey {
    key: SecretString,
}

impl CloudApiKey {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &SecretString {
        &self.key
    }
}

/// A resolved credential
#[derive(Debug)]
pub enum Credential {
    Registry(RegistryCredential),
    ModelAccess(ModelAccessToken),
    CloudApi(CloudApiKey),
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::Registry(_) => CredentialKind::Registry,
            Credential::ModelAccess(_) => CredentialKind::ModelAccess,
            Credential::CloudApi(_) => CredentialKind::CloudApi,
        }
    }

    /// Binding policy: the container runtime runs as root on the remote
    /// host, so registry and model credentials live there; the provider API
    /// is called from here.
    pub fn context(&self) -> ExecutionContext {
        match self {
            Credential::Registry(_) | Credential::ModelAccess(_) => ExecutionContext::RemoteRoot,
            Credential::CloudApi(_) => ExecutionContext::Local,
        }
    }
}

/// Everything a deployment needs, bound to contexts
#[derive(Debug, Default)]
pub struct CredentialSet {
    credentials: Vec<Credential>,
    container_env: BTreeMap<String, SecretString>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, credential: Credential) {
        self.credentials.push(credential);
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: SecretString) {
        self.container_env.insert(key.into(), value);
    }

    /// Credentials bound to one context
    pub fn credentials_for(&self, context: ExecutionContext) -> impl Iterator<Item = &Credential> {
        self.credentials
            .iter()
            .filter(move |c| c.context() == context)
    }

    /// Registry login usable in `context`, if any
    pub fn registry_for(&self, context: ExecutionContext) -> Option<&RegistryCredential> {
        self.credentials_for(context).find_map(|c| match c {
            Credential::Registry(r) => Some(r),
            _ => None,
        })
    }

    /// Provider key usable in `context`, if any
    pub fn cloud_api_for(&self, context: ExecutionContext) -> Option<&CloudApiKey> {
        self.credentials_for(context).find_map(|c| match c {
            Credential::CloudApi(k) => Some(k),
            _ => None,
        })
    }

    pub fn model_access(&self) -> Option<&ModelAccessToken> {
        self.credentials_for(ExecutionContext::RemoteRoot)
            .find_map(|c| match c {
                Credential::ModelAccess(t) => Some(t),
                _ => None,
            })
    }

    /// Keys of the container environment, safe to log
    pub fn env_keys(&self) -> Vec<&str> {
        self.container_env.keys().map(String::as_str).collect()
    }

    /// Container environment rendered as a docker env-file
    pub fn env_file(&self) -> Result<SecretString, DeployError> {
        let mut rendered = String::new();
        for (key, value) in &self.container_env {
            let value = value.expose_secret();
            if value.contains('\n') || value.contains('\r') {
                return Err(DeployError::ValidationError(format!(
                    "Env var {} contains a newline",
                    key
                )));
            }
            rendered.push_str(key);
            rendered.push('=');
            rendered.push_str(value);
            rendered.push('\n');
        }
        Ok(SecretString::from(rendered))
    }
}
