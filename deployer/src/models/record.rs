//! Deployment record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::{next_status, DeploymentEvent, DeploymentStatus};
use crate::errors::DeployError;
use crate::utils::generate_uuid;

/// A recorded status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub timestamp: DateTime<Utc>,
    pub from: DeploymentStatus,
    pub to: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Mutable state of one named deployment, persisted across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub name: String,

    pub status: DeploymentStatus,

    /// Digest of the preset's frozen fields
    pub preset_digest: String,

    /// Identifier of the current attempt, for log correlation
    pub attempt_id: String,

    pub attempt_count: u32,

    /// A create call went out and its outcome is not known to be a refusal
    #[serde(default)]
    pub create_requested: bool,

    #[serde(default)]
    pub instance_id: Option<String>,

    #[serde(default)]
    pub public_address: Option<String>,

    /// Container started for this record
    #[serde(default)]
    pub container_name: Option<String>,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    poisoned: bool,

    #[serde(default)]
    pub poison_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl DeploymentRecord {
    /// Fresh record in PENDING
    pub fn new(name: impl Into<String>, preset_digest: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            status: DeploymentStatus::Pending,
            preset_digest: preset_digest.into(),
            attempt_id: generate_uuid(),
            attempt_count: 1,
            create_requested: false,
            instance_id: None,
            public_address: None,
            container_name: None,
            last_error: None,
            poisoned: false,
            poison_reason: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn poisoned(&self) -> bool {
        self.poisoned
    }

    /// Mark the identity unusable; there is no way back
    pub fn poison(&mut self, reason: impl Into<String>) {
        self.poisoned = true;
        self.poison_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }

    /// An instance or container may exist for this record
    pub fn has_side_effects(&self) -> bool {
        self.create_requested || self.instance_id.is_some() || self.container_name.is_some()
    }

    /// The record has entered LAUNCHING at some point, which freezes the
    /// preset's instance and image under this name
    pub fn reached_launching(&self) -> bool {
        matches!(
            self.status,
            DeploymentStatus::Launching | DeploymentStatus::Warming | DeploymentStatus::Ready
        ) || self
            .history
            .iter()
            .any(|t| t.to == DeploymentStatus::Launching)
    }

    /// Forget external resources after they were cleaned up
    pub fn clear_side_effects(&mut self) {
        self.create_requested = false;
        self.instance_id = None;
        self.public_address = None;
        self.container_name = None;
        self.updated_at = Utc::now();
    }

    /// Apply an event through the FSM and record the transition
    pub fn apply(&mut self, event: DeploymentEvent) -> Result<DeploymentStatus, DeployError> {
        let next = next_status(self.status, &event)?;

        let context = match &event {
            DeploymentEvent::Fail(reason) => {
                self.last_error = Some(reason.clone());
                Some(reason.clone())
            }
            DeploymentEvent::Reset => {
                self.last_error = None;
                self.attempt_count += 1;
                self.attempt_id = generate_uuid();
                Some("reset".to_string())
            }
            DeploymentEvent::AdoptWarming | DeploymentEvent::AdoptReady => {
                Some("adopted existing container".to_string())
            }
            DeploymentEvent::Restart => Some("restarted from provisioning".to_string()),
            _ => None,
        };

        let now = Utc::now();
        self.history.push(TransitionRecord {
            timestamp: now,
            from: self.status,
            to: next,
            context,
        });
        self.status = next;
        self.updated_at = now;
        Ok(next)
    }
}
