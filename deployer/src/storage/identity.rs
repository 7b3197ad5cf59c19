//! Preset identity store
//!
//! Maps a deployment name to its persisted record. Every mutation of a name
//! runs under that name's lock; different names never contend.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::preset::{validate_name, Preset};
use crate::models::record::DeploymentRecord;

const RECORD_EXTENSION: &str = "json";

type NameLock = Arc<tokio::sync::Mutex<()>>;

/// Marks a name as driven by a reconciler in this process; released on drop
#[derive(Debug)]
pub struct ActiveClaim {
    name: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl ActiveClaim {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.name);
    }
}

/// A record handed to a reconciler together with its claim
#[derive(Debug)]
pub struct Registration {
    pub record: DeploymentRecord,
    pub claim: ActiveClaim,
}

/// Name-keyed, persisted deployment records
#[derive(Debug)]
pub struct IdentityStore {
    records: Dir,
    locks: Mutex<HashMap<String, NameLock>>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl IdentityStore {
    pub fn new(records: Dir) -> Self {
        Self {
            records,
            locks: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register a preset for a fresh attempt
    pub async fn register(&self, preset: &Preset) -> Result<Registration, DeployError> {
        validate_name(&preset.name)?;
        let lock = self.lock_for(&preset.name);
        let _guard = lock.lock().await;

        self.ensure_inactive(&preset.name)?;
        let digest = preset.frozen_digest();

        let record = match self.read(&preset.name).await? {
            None => DeploymentRecord::new(&preset.name, digest),
            Some(existing) if existing.poisoned() => {
                return Err(poisoned_error(&existing));
            }
            Some(existing) if existing.status == DeploymentStatus::Terminated => {
                DeploymentRecord::new(&preset.name, digest)
            }
            Some(existing) if existing.status.is_in_progress() => {
                return Err(DeployError::AlreadyInProgress(format!(
                    "'{}' is {}; resume it or shut it down first",
                    existing.name, existing.status
                )));
            }
            Some(existing) if existing.status == DeploymentStatus::Ready => {
                return Err(DeployError::NameConflict(format!(
                    "'{}' is already deployed at {}",
                    existing.name,
                    existing.public_address.as_deref().unwrap_or("unknown address")
                )));
            }
            Some(existing) => {
                return Err(DeployError::NameConflict(format!(
                    "'{}' is {} from attempt {}; shut it down and release it, or reconcile it with --force",
                    existing.name, existing.status, existing.attempt_count
                )));
            }
        };

        self.write(&record).await?;
        let claim = self.claim(&record.name);
        info!(
            "Registered '{}' (attempt {}, {})",
            record.name, record.attempt_count, record.attempt_id
        );
        Ok(Registration { record, claim })
    }

    /// Claim a name for reconcile mode, keeping whatever record exists
    pub async fn adopt(&self, preset: &Preset) -> Result<Registration, DeployError> {
        validate_name(&preset.name)?;
        let lock = self.lock_for(&preset.name);
        let _guard = lock.lock().await;

        self.ensure_inactive(&preset.name)?;
        let digest = preset.frozen_digest();

        let record = match self.read(&preset.name).await? {
            None => DeploymentRecord::new(&preset.name, digest),
            Some(existing) if existing.poisoned() => {
                return Err(poisoned_error(&existing));
            }
            Some(existing) if existing.status == DeploymentStatus::Terminated => {
                DeploymentRecord::new(&preset.name, digest)
            }
            Some(mut existing) => {
                check_frozen(&existing, &digest)?;
                if existing.status == DeploymentStatus::Failed {
                    existing.apply(DeploymentEvent::Reset)?;
                }
                existing.preset_digest = digest;
                existing
            }
        };

        self.write(&record).await?;
        let claim = self.claim(&record.name);
        info!(
            "Adopted '{}' in {} for reconciliation",
            record.name, record.status
        );
        Ok(Registration { record, claim })
    }

    /// Claim an existing non-terminal record to continue it
    pub async fn claim_existing(&self, preset: &Preset) -> Result<Registration, DeployError> {
        validate_name(&preset.name)?;
        let lock = self.lock_for(&preset.name);
        let _guard = lock.lock().await;

        self.ensure_inactive(&preset.name)?;
        let record = self
            .read(&preset.name)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("No record for '{}'", preset.name)))?;

        if record.poisoned() {
            return Err(poisoned_error(&record));
        }
        if record.status.is_terminal() {
            return Err(DeployError::InvalidTransition(format!(
                "'{}' is {} and cannot be resumed; deploy it again",
                record.name, record.status
            )));
        }
        check_frozen(&record, &preset.frozen_digest())?;

        let claim = self.claim(&record.name);
        Ok(Registration { record, claim })
    }

    /// Claim a record in any status, poisoned included, to tear it down
    pub async fn claim_for_teardown(&self, name: &str) -> Result<Registration, DeployError> {
        validate_name(name)?;
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        self.ensure_inactive(name)?;
        let record = self
            .read(name)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("No record for '{}'", name)))?;

        let claim = self.claim(&record.name);
        Ok(Registration { record, claim })
    }

    /// Persist a record
    pub async fn save(&self, record: &DeploymentRecord) -> Result<(), DeployError> {
        let lock = self.lock_for(&record.name);
        let _guard = lock.lock().await;
        self.write(record).await
    }

    pub async fn load(&self, name: &str) -> Result<Option<DeploymentRecord>, DeployError> {
        validate_name(name)?;
        self.read(name).await
    }

    /// Scar a name after a partially applied attempt
    pub async fn mark_poisoned(
        &self,
        name: &str,
        reason: &str,
    ) -> Result<DeploymentRecord, DeployError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let mut record = self
            .read(name)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("No record for '{}'", name)))?;
        record.poison(reason);
        self.write(&record).await?;

        warn!("Identity '{}' is poisoned: {}", name, reason);
        Ok(record)
    }

    /// Delete a terminated record so the name can be registered again
    pub async fn release(&self, name: &str) -> Result<(), DeployError> {
        validate_name(name)?;
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        self.ensure_inactive(name)?;
        let record = self
            .read(name)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("No record for '{}'", name)))?;
        if record.status != DeploymentStatus::Terminated {
            return Err(DeployError::InvalidTransition(format!(
                "'{}' is {}; only TERMINATED records can be released",
                name, record.status
            )));
        }

        self.record_file(name).delete().await?;
        info!("Released '{}'", name);
        Ok(())
    }

    /// All stored records, by name
    pub async fn list(&self) -> Result<Vec<DeploymentRecord>, DeployError> {
        let mut records = Vec::new();
        for name in self.records.list_stems(RECORD_EXTENSION).await? {
            match self.read(&name).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable record '{}': {}", name, e),
            }
        }
        Ok(records)
    }

    pub fn is_active(&self, name: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains(name)
    }

    fn lock_for(&self, name: &str) -> NameLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    fn ensure_inactive(&self, name: &str) -> Result<(), DeployError> {
        if self.is_active(name) {
            return Err(DeployError::AlreadyInProgress(format!(
                "'{}' is being deployed by another task",
                name
            )));
        }
        Ok(())
    }

    fn claim(&self, name: &str) -> ActiveClaim {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.insert(name.to_string());
        ActiveClaim {
            name: name.to_string(),
            active: self.active.clone(),
        }
    }

    fn record_file(&self, name: &str) -> File {
        self.records
            .file(&format!("{}.{}", name, RECORD_EXTENSION))
    }

    async fn read(&self, name: &str) -> Result<Option<DeploymentRecord>, DeployError> {
        self.record_file(name).read_json_opt().await.map_err(|e| match e {
            DeployError::JsonError(e) => {
                DeployError::StorageError(format!("Corrupt record for '{}': {}", name, e))
            }
            other => other,
        })
    }

    async fn write(&self, record: &DeploymentRecord) -> Result<(), DeployError> {
        self.record_file(&record.name).write_json(record).await
    }
}

fn poisoned_error(record: &DeploymentRecord) -> DeployError {
    DeployError::PoisonedIdentity(format!(
        "'{}' was left partially applied ({}); choose a new name",
        record.name,
        record.poison_reason.as_deref().unwrap_or("unknown reason")
    ))
}

fn check_frozen(record: &DeploymentRecord, digest: &str) -> Result<(), DeployError> {
    if record.preset_digest != digest && (record.reached_launching() || record.has_side_effects()) {
        return Err(DeployError::PresetFrozen(format!(
            "'{}' already launched with a different instance or image; use a new name",
            record.name
        )));
    }
    Ok(())
}
