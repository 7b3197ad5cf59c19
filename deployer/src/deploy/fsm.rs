//! Finite State Machine for a deployment record

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Registered, nothing external exists yet
    Pending,

    /// Instance requested, waiting for it to become reachable
    Provisioning,

    /// Logging the remote root context into the image registry
    Authenticating,

    /// Pulling or building the image and starting the container
    Launching,

    /// Container started, waiting for the service to finish loading
    Warming,

    /// Service answers and reports ready
    Ready,

    /// Attempt failed
    Failed,

    /// Torn down on request
    Terminated,
}

impl DeploymentStatus {
    /// Failed and Terminated admit no forward progress
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::Terminated)
    }

    /// A stage is running (or was running when the orchestrator stopped)
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Pending
                | DeploymentStatus::Provisioning
                | DeploymentStatus::Authenticating
                | DeploymentStatus::Launching
                | DeploymentStatus::Warming
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "PENDING",
            DeploymentStatus::Provisioning => "PROVISIONING",
            DeploymentStatus::Authenticating => "AUTHENTICATING",
            DeploymentStatus::Launching => "LAUNCHING",
            DeploymentStatus::Warming => "WARMING",
            DeploymentStatus::Ready => "READY",
            DeploymentStatus::Failed => "FAILED",
            DeploymentStatus::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    /// Credentials resolved, request the instance
    Provision,

    /// Instance is reachable
    Provisioned,

    /// Registry login done (or not needed)
    Authenticated,

    /// Container started
    Launched,

    /// Readiness gate passed
    BecameReady,

    /// Reconcile found a live container still loading
    AdoptWarming,

    /// Reconcile found a live, ready container
    AdoptReady,

    /// Reconcile tore down what existed, start over from provisioning
    Restart,

    /// Stage failed
    Fail(String),

    /// Explicit teardown
    Teardown,

    /// Reuse a failed, unpoisoned record
    Reset,
}

/// Compute the status an event leads to
pub fn next_status(
    current: DeploymentStatus,
    event: &DeploymentEvent,
) -> Result<DeploymentStatus, DeployError> {
    use DeploymentEvent as E;
    use DeploymentStatus as S;

    let next = match (current, event) {
        // Happy path
        (S::Pending, E::Provision) => S::Provisioning,
        (S::Provisioning, E::Provisioned) => S::Authenticating,
        (S::Authenticating, E::Authenticated) => S::Launching,
        (S::Launching, E::Launched) => S::Warming,
        (S::Warming, E::BecameReady) => S::Ready,

        // Reconcile jumps
        (s, E::AdoptWarming) if !s.is_terminal() => S::Warming,
        (s, E::AdoptReady) if !s.is_terminal() => S::Ready,
        (s, E::Restart) if !s.is_terminal() => S::Provisioning,

        // Failure from any live state
        (s, E::Fail(_)) if !s.is_terminal() => S::Failed,

        // Teardown from anywhere
        (_, E::Teardown) => S::Terminated,

        (S::Failed, E::Reset) => S::Pending,

        // Invalid transitions
        (state, event) => {
            return Err(DeployError::InvalidTransition(format!(
                "{:?} -> {:?}",
                state, event
            )));
        }
    };

    Ok(next)
}
