//! Secret sources
//!
//! Presets never carry secret values, only references such as `${HF_TOKEN}`.
//! A [`SecretSource`] turns a reference name into the raw value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::errors::DeployError;

/// Source of raw secret values
pub trait SecretSource: Send + Sync {
    /// Look up a secret by name; empty values count as absent
    fn lookup(&self, key: &str) -> Option<SecretString>;
}

pub(crate) fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}

/// Process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn lookup(&self, key: &str) -> Option<SecretString> {
        std::env::var(key)
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecretString::from)
    }
}

/// In-memory secrets
#[derive(Debug, Default)]
pub struct MapSecretSource {
    values: HashMap<String, SecretString>,
}

impl MapSecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert(key.into(), SecretString::from(value.into()));
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SecretSource for MapSecretSource {
    fn lookup(&self, key: &str) -> Option<SecretString> {
        self.values
            .get(key)
            .filter(|v| !v.expose_secret().is_empty())
            .map(clone_secret)
    }
}

/// Secrets from a dotenv file such as `.env.local`
///
/// The file is read once; it does not modify the process environment.
#[derive(Debug)]
pub struct DotenvSecretSource {
    path: PathBuf,
    values: MapSecretSource,
}

impl DotenvSecretSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DeployError> {
        let path = path.as_ref().to_path_buf();
        let iter = dotenvy::from_path_iter(&path).map_err(|e| {
            DeployError::ConfigError(format!("Unable to read secrets file {:?}: {}", path, e))
        })?;

        let mut values = MapSecretSource::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                DeployError::ConfigError(format!("Invalid secrets file {:?}: {}", path, e))
            })?;
            values.insert(key, value);
        }

        debug!("Loaded {} secrets from {:?}", values.len(), path);
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretSource for DotenvSecretSource {
    fn lookup(&self, key: &str) -> Option<SecretString> {
        self.values.lookup(key)
    }
}

/// Several sources, first hit wins
#[derive(Default)]
pub struct LayeredSecretSource {
    layers: Vec<Box<dyn SecretSource>>,
}

impl LayeredSecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, source: impl SecretSource + 'static) -> Self {
        self.layers.push(Box::new(source));
        self
    }
}

impl SecretSource for LayeredSecretSource {
    fn lookup(&self, key: &str) -> Option<SecretString> {
        self.layers.iter().find_map(|layer| layer.lookup(key))
    }
}
