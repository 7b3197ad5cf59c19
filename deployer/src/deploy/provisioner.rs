//! Instance provisioning
//!
//! Requests one instance and polls it until a remote command runs on it.
//! Every poll is bounded by the policy's attempt ceiling; transient failures
//! are absorbed here and only the final exhaustion crosses the stage
//! boundary.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::infra::backend::{CreatedInstance, InfraBackend, InstanceStatus};
use crate::models::preset::InstanceSpec;
use crate::remote::exec::{RemoteCommand, RemoteExec};

/// Lifecycle of the instance as seen by the provisioner; only moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstancePhase {
    Absent,
    Requested,
    Booting,
    NetworkReady,
    Reachable,
    Failed,
}

impl InstancePhase {
    fn advance(self, next: InstancePhase) -> InstancePhase {
        if self == InstancePhase::Failed || next <= self {
            self
        } else {
            next
        }
    }
}

/// Reachability retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ProvisionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// An instance that accepted a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedInstance {
    pub instance_id: String,
    pub address: String,
    /// Polls it took, including the successful one
    pub attempts: u32,
}

enum Poll {
    Reachable(String),
    Waiting(String),
}

pub struct Provisioner {
    backend: Arc<dyn InfraBackend>,
    remote: Arc<dyn RemoteExec>,
    policy: ProvisionPolicy,
}

impl Provisioner {
    pub fn new(
        backend: Arc<dyn InfraBackend>,
        remote: Arc<dyn RemoteExec>,
        policy: ProvisionPolicy,
    ) -> Self {
        Self {
            backend,
            remote,
            policy,
        }
    }

    /// Ask the backend for an instance. A failed create is never repeated
    /// here: the provider may have created it anyway.
    pub async fn request(&self, name: &str, spec: &InstanceSpec) -> Result<CreatedInstance, DeployError> {
        self.backend.create(name, spec).await
    }

    /// Request an instance and wait for it
    pub async fn provision(
        &self,
        name: &str,
        spec: &InstanceSpec,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedInstance, DeployError> {
        let created = self.request(name, spec).await?;
        self.await_reachable(&created.instance_id, cancel).await
    }

    /// Poll until the instance runs a remote command, up to the attempt ceiling
    pub async fn await_reachable(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedInstance, DeployError> {
        let mut phase = InstancePhase::Requested;
        let mut last_wait = String::from("no attempt made");

        for attempt in 1..=self.policy.max_attempts {
            if cancel.is_cancelled() {
                return Err(DeployError::Cancelled(format!(
                    "waiting for instance {}",
                    instance_id
                )));
            }

            match self.poll(instance_id, &mut phase).await {
                Ok(Poll::Reachable(address)) => {
                    info!(
                        "Instance {} reachable at {} after {} attempt(s)",
                        instance_id, address, attempt
                    );
                    return Ok(ProvisionedInstance {
                        instance_id: instance_id.to_string(),
                        address,
                        attempts: attempt,
                    });
                }
                Ok(Poll::Waiting(reason)) => {
                    debug!(
                        "Instance {} attempt {}/{}: {}",
                        instance_id, attempt, self.policy.max_attempts, reason
                    );
                    last_wait = reason;
                }
                Err(e) => {
                    phase = phase.advance(InstancePhase::Failed);
                    debug!("Instance {} is {:?}", instance_id, phase);
                    return Err(e);
                }
            }

            if attempt < self.policy.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(DeployError::Cancelled(format!(
                            "waiting for instance {}",
                            instance_id
                        )));
                    }
                    _ = tokio::time::sleep(self.policy.retry_delay) => {}
                }
            }
        }

        Err(DeployError::ProvisionTimeout {
            attempts: self.policy.max_attempts,
            detail: format!("instance {} ({:?}): {}", instance_id, phase, last_wait),
        })
    }

    async fn poll(&self, instance_id: &str, phase: &mut InstancePhase) -> Result<Poll, DeployError> {
        let observation = match self.backend.describe(instance_id).await {
            Ok(observation) => observation,
            Err(e) if e.is_transient() => return Ok(Poll::Waiting(e.to_string())),
            Err(e) => return Err(e),
        };

        if observation.is_gone() {
            return Err(DeployError::ProvisionRejected(format!(
                "instance {} is {:?}",
                instance_id, observation.status
            )));
        }

        let address = match (&observation.status, observation.address) {
            (InstanceStatus::Active, Some(address)) => address,
            (status, _) => {
                self.enter(instance_id, phase, InstancePhase::Booting);
                return Ok(Poll::Waiting(format!("status {:?}, no usable address", status)));
            }
        };
        self.enter(instance_id, phase, InstancePhase::NetworkReady);

        match self.remote.exec(&address, &RemoteCommand::new("true")).await {
            Ok(output) if output.success() => {
                self.enter(instance_id, phase, InstancePhase::Reachable);
                Ok(Poll::Reachable(address))
            }
            Ok(output) => Ok(Poll::Waiting(format!(
                "probe exited {}: {}",
                output.exit_code,
                output.summary()
            ))),
            Err(e) if e.is_transient() => {
                warn!("Instance {} not reachable yet: {}", instance_id, e);
                Ok(Poll::Waiting(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn enter(&self, instance_id: &str, phase: &mut InstancePhase, next: InstancePhase) {
        let advanced = phase.advance(next);
        if advanced != *phase {
            info!("Instance {}: {:?} -> {:?}", instance_id, phase, advanced);
            *phase = advanced;
        }
    }
}
