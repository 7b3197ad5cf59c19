//! Credential resolution

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::authn::credentials::{
    CloudApiKey, Credential, CredentialKind, CredentialSet, ExecutionContext, ModelAccessToken,
    RegistryCredential,
};
use crate::authn::secrets::{clone_secret, SecretSource};
use crate::errors::DeployError;
use crate::models::preset::Preset;

/// Env keys that carry a gated-model access token
pub const MODEL_ACCESS_KEYS: &[&str] = &["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN", "HUGGINGFACE_TOKEN"];

pub fn is_model_access_key(key: &str) -> bool {
    MODEL_ACCESS_KEYS.contains(&key)
}

/// Expands preset references into bound credentials
#[derive(Clone)]
pub struct CredentialResolver {
    source: Arc<dyn SecretSource>,
}

impl CredentialResolver {
    pub fn new(source: Arc<dyn SecretSource>) -> Self {
        Self { source }
    }

    /// Resolve every credential and env entry of a preset
    pub fn resolve(&self, preset: &Preset) -> Result<CredentialSet, DeployError> {
        let mut set = CredentialSet::new();

        let api_key = self
            .expand_required("cloud_api_key", &preset.cloud_api_key)
            .map_err(|e| missing(CredentialKind::CloudApi, e))?;
        set.push(Credential::CloudApi(CloudApiKey::new(api_key)));

        if let Some(registry) = &preset.registry {
            let password = self
                .expand_required("registry.password", &registry.password)
                .map_err(|e| missing(CredentialKind::Registry, e))?;
            set.push(Credential::Registry(RegistryCredential::new(
                registry.server.clone(),
                registry.username.clone(),
                password,
            )));
        }

        let mut has_model_token = false;
        for (key, value) in &preset.env {
            let resolved = if is_model_access_key(key) {
                self.expand_required(key, value)
                    .map_err(|e| missing(CredentialKind::ModelAccess, e))?
            } else {
                self.expand(key, value)?
            };

            if is_model_access_key(key) {
                has_model_token = true;
                set.push(Credential::ModelAccess(ModelAccessToken::new(
                    key.clone(),
                    clone_secret(&resolved),
                )));
            }
            set.set_env(key.clone(), resolved);
        }

        if preset.requires_model_access && !has_model_token {
            return Err(DeployError::MissingCredential {
                kind: CredentialKind::ModelAccess,
                detail: format!(
                    "preset '{}' loads a gated model but sets none of {}",
                    preset.name,
                    MODEL_ACCESS_KEYS.join(", ")
                ),
            });
        }

        debug!(
            "Resolved credentials for '{}': remote root {:?}, container env: {:?}",
            preset.name,
            set.credentials_for(ExecutionContext::RemoteRoot)
                .map(Credential::kind)
                .collect::<Vec<_>>(),
            set.env_keys()
        );
        Ok(set)
    }

    /// Resolve only the provider key, for operations that touch no container
    pub fn resolve_cloud_key(&self, preset: &Preset) -> Result<CloudApiKey, DeployError> {
        self.expand_required("cloud_api_key", &preset.cloud_api_key)
            .map(CloudApiKey::new)
            .map_err(|e| missing(CredentialKind::CloudApi, e))
    }

    /// Expand `${NAME}` references anywhere in the value, or a whole-value
    /// `$NAME`. Literal values may be empty; referenced ones may not.
    fn expand(&self, key: &str, value: &str) -> Result<SecretString, DeployError> {
        if let Some(name) = value.strip_prefix('$').filter(|n| is_var_name(n)) {
            let secret = self.lookup(key, name, value)?;
            return non_empty(key, value, secret);
        }

        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        let mut referenced = false;
        while let Some(start) = rest.find("${") {
            referenced = true;
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                DeployError::ValidationError(format!("Unterminated reference in {}", key))
            })?;
            let name = &after[..end];
            let secret = self.lookup(key, name, &format!("${{{}}}", name))?;
            out.push_str(secret.expose_secret());
            rest = &after[end + 1..];
        }
        out.push_str(rest);

        let secret = SecretString::from(out);
        if referenced {
            non_empty(key, value, secret)
        } else {
            Ok(secret)
        }
    }

    /// Expand a credential, which is never empty
    fn expand_required(&self, key: &str, value: &str) -> Result<SecretString, DeployError> {
        let secret = self.expand(key, value)?;
        non_empty(key, value, secret)
    }

    fn lookup(&self, key: &str, name: &str, reference: &str) -> Result<SecretString, DeployError> {
        self.source
            .lookup(name)
            .ok_or_else(|| DeployError::UnresolvedReference {
                key: key.to_string(),
                reference: reference.to_string(),
            })
    }
}

fn is_var_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn non_empty(key: &str, reference: &str, secret: SecretString) -> Result<SecretString, DeployError> {
    if secret.expose_secret().is_empty() {
        return Err(DeployError::UnresolvedReference {
            key: key.to_string(),
            reference: if reference.is_empty() {
                "(empty)".to_string()
            } else {
                reference.to_string()
            },
        });
    }
    Ok(secret)
}

fn missing(kind: CredentialKind, err: DeployError) -> DeployError {
    match err {
        DeployError::UnresolvedReference { key, reference } => DeployError::MissingCredential {
            kind,
            detail: format!("{} is not set (referenced by {})", reference, key),
        },
        other => other,
    }
}
