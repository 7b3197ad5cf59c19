//! Deployment reconciler
//!
//! Drives one named deployment through its stages, persisting the record
//! after every transition so a restarted orchestrator picks up where the
//! last one stopped. Stages run strictly in order; cancellation is honored
//! at stage boundaries and between polls, never inside a network call.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::authn::credentials::{CredentialKind, CredentialSet, ExecutionContext};
use crate::authn::resolver::CredentialResolver;
use crate::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use crate::deploy::launcher::{ContainerLauncher, LaunchPolicy};
use crate::deploy::provisioner::{ProvisionPolicy, Provisioner};
use crate::deploy::readiness::{ReadinessGate, ReadinessPolicy, ReadyResult};
use crate::errors::{DeployError, DeploymentFailure};
use crate::http::health::{ContainerAwareProbe, HealthProbe};
use crate::infra::backend::{BackendFactory, InfraBackend, InstanceObservation, InstanceStatus};
use crate::models::health::{HealthSignal, ReadinessPhase};
use crate::models::preset::Preset;
use crate::models::record::DeploymentRecord;
use crate::remote::exec::RemoteExec;
use crate::storage::identity::{IdentityStore, Registration};
use crate::storage::settings::Settings;

/// How `deploy` treats what already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeployMode {
    /// Register a fresh attempt; existing live deployments are conflicts
    #[default]
    Normal,

    /// Compare with what runs and only do what is missing
    Force,
}

/// What reconcile mode decided after observing the outside world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing usable exists, full deployment
    Fresh,

    /// An instance exists but is not reachable yet; wait for it
    AwaitInstance,

    /// Instance is up but the container is missing, dead or stale
    Relaunch,

    /// The container runs and is loading
    AdoptWarming,

    /// The container runs and is ready; nothing to do
    AlreadyReady,
}

/// Result of a successful deployment
#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub name: String,
    pub status: DeploymentStatus,
    pub address: Option<String>,
    pub instance_id: Option<String>,
    pub container: Option<String>,
    pub attempt: u32,
    pub readiness: Option<ReadyResult>,
    pub reconciled: Option<ReconcileAction>,
}

/// Record plus a live sample
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub record: DeploymentRecord,
    pub signal: Option<HealthSignal>,
    pub latency: Option<Duration>,
}

/// Stage policies
#[derive(Debug, Clone, Default)]
pub struct ReconcilerOptions {
    pub provision: ProvisionPolicy,
    pub launch: LaunchPolicy,
    pub readiness: ReadinessPolicy,

    /// Destroy side effects when a stage fails instead of keeping them
    pub rollback_on_failure: bool,
}

impl ReconcilerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            provision: settings.provision.policy(),
            launch: settings.launch.policy(),
            readiness: settings.readiness.policy(),
            rollback_on_failure: settings.rollback_on_failure,
        }
    }
}

/// Per-attempt working set, owned by one reconciliation
struct Attempt<'a> {
    preset: &'a Preset,
    record: DeploymentRecord,
    credentials: CredentialSet,
    backend: Arc<dyn InfraBackend>,
    readiness: Option<ReadyResult>,
    reconciled: Option<ReconcileAction>,
}

pub struct Reconciler {
    store: Arc<IdentityStore>,
    resolver: CredentialResolver,
    backends: Arc<dyn BackendFactory>,
    remote: Arc<dyn RemoteExec>,
    probe: Arc<dyn HealthProbe>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        store: Arc<IdentityStore>,
        resolver: CredentialResolver,
        backends: Arc<dyn BackendFactory>,
        remote: Arc<dyn RemoteExec>,
        probe: Arc<dyn HealthProbe>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            store,
            resolver,
            backends,
            remote,
            probe,
            options,
        }
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    /// Deploy a preset to READY
    pub async fn deploy(
        &self,
        preset: &Preset,
        mode: DeployMode,
        cancel: &CancellationToken,
    ) -> Result<DeploymentReport, DeploymentFailure> {
        let early = |e| DeploymentFailure::new(&preset.name, DeploymentStatus::Pending, e);

        preset.validate().map_err(early)?;
        let credentials = self.resolver.resolve(preset).map_err(early)?;
        let backend = self.connect(&credentials).map_err(early)?;

        let registration = match mode {
            DeployMode::Normal => self.store.register(preset).await,
            DeployMode::Force => self.store.adopt(preset).await,
        }
        .map_err(early)?;

        let Registration { record, claim: _claim } = registration;
        info!(
            "Deploying '{}' ({:?} mode, attempt {})",
            preset.name, mode, record.attempt_count
        );

        let mut attempt = Attempt {
            preset,
            record,
            credentials,
            backend,
            readiness: None,
            reconciled: None,
        };

        if mode == DeployMode::Force {
            match self.reconcile(&mut attempt, cancel).await {
                Ok(action) => attempt.reconciled = Some(action),
                Err(e) => return Err(self.fail(&mut attempt, e).await),
            }
        }

        self.finish(attempt, cancel).await
    }

    /// Continue a persisted, non-terminal deployment from its recorded status
    pub async fn resume(
        &self,
        preset: &Preset,
        cancel: &CancellationToken,
    ) -> Result<DeploymentReport, DeploymentFailure> {
        let early = |e| DeploymentFailure::new(&preset.name, DeploymentStatus::Pending, e);

        preset.validate().map_err(early)?;
        let credentials = self.resolver.resolve(preset).map_err(early)?;
        let backend = self.connect(&credentials).map_err(early)?;

        let Registration { record, claim: _claim } = self
            .store
            .claim_existing(preset)
            .await
            .map_err(|e| DeploymentFailure::new(&preset.name, DeploymentStatus::Pending, e))?;
        info!("Resuming '{}' from {}", preset.name, record.status);

        let attempt = Attempt {
            preset,
            record,
            credentials,
            backend,
            readiness: None,
            reconciled: None,
        };

        self.finish(attempt, cancel).await
    }

    /// Stop the container, destroy the instance, mark the record TERMINATED.
    /// The poisoned flag survives.
    pub async fn teardown(&self, preset: &Preset) -> Result<DeploymentRecord, DeployError> {
        let api_key = self.resolver.resolve_cloud_key(preset)?;
        let backend = self.backends.connect(&api_key)?;
        let Registration { mut record, claim: _claim } =
            self.store.claim_for_teardown(&preset.name).await?;

        let launcher = self.launcher();
        if let (Some(address), Some(container)) = (&record.public_address, &record.container_name) {
            if let Err(e) = launcher.stop(address, container).await {
                warn!("Could not stop container {}: {}", container, e);
            }
        }

        let instance_id = match &record.instance_id {
            Some(id) => Some(id.clone()),
            None => backend
                .find_by_name(&record.name)
                .await?
                .map(|found| found.instance_id),
        };
        if let Some(id) = instance_id {
            backend.destroy(&id).await?;
        }

        record.clear_side_effects();
        if record.status != DeploymentStatus::Terminated {
            record.apply(DeploymentEvent::Teardown)?;
        }
        self.store.save(&record).await?;
        info!("'{}' is TERMINATED", record.name);
        Ok(record)
    }

    /// The stored record and one live health sample
    pub async fn status(&self, preset: &Preset) -> Result<StatusReport, DeployError> {
        let record = self
            .store
            .load(&preset.name)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("No record for '{}'", preset.name)))?;

        let Some(address) = record.public_address.clone() else {
            return Ok(StatusReport {
                record,
                signal: None,
                latency: None,
            });
        };

        let endpoint = preset.health_endpoint(&address)?;
        let started = Instant::now();
        let signal = self.probe.sample(&endpoint).await;
        let latency = started.elapsed();

        Ok(StatusReport {
            record,
            signal: Some(signal),
            latency: Some(latency),
        })
    }

    fn connect(&self, credentials: &CredentialSet) -> Result<Arc<dyn InfraBackend>, DeployError> {
        let api_key = credentials
            .cloud_api_for(ExecutionContext::Local)
            .ok_or_else(|| DeployError::MissingCredential {
                kind: CredentialKind::CloudApi,
                detail: "no provider key bound to the local context".to_string(),
            })?;
        self.backends.connect(api_key)
    }

    fn provisioner(&self, backend: Arc<dyn InfraBackend>) -> Provisioner {
        Provisioner::new(backend, self.remote.clone(), self.options.provision.clone())
    }

    fn launcher(&self) -> ContainerLauncher {
        ContainerLauncher::new(self.remote.clone(), self.options.launch.clone())
    }

    fn container_probe(&self, container_name: &str) -> ContainerAwareProbe {
        ContainerAwareProbe::new(self.probe.clone(), self.remote.clone(), container_name)
    }

    async fn finish(
        &self,
        mut attempt: Attempt<'_>,
        cancel: &CancellationToken,
    ) -> Result<DeploymentReport, DeploymentFailure> {
        if let Err(e) = self.drive(&mut attempt, cancel).await {
            return Err(self.fail(&mut attempt, e).await);
        }

        let record = &attempt.record;
        info!(
            "'{}' is READY at {}",
            record.name,
            record.public_address.as_deref().unwrap_or("?")
        );
        Ok(DeploymentReport {
            name: record.name.clone(),
            status: record.status,
            address: record.public_address.clone(),
            instance_id: record.instance_id.clone(),
            container: record.container_name.clone(),
            attempt: record.attempt_count,
            readiness: attempt.readiness.take(),
            reconciled: attempt.reconciled,
        })
    }

    /// Run stages from the record's status until READY
    async fn drive(&self, attempt: &mut Attempt<'_>, cancel: &CancellationToken) -> Result<(), DeployError> {
        loop {
            let stage = attempt.record.status;
            if stage == DeploymentStatus::Ready {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(DeployError::Cancelled(format!("before {}", stage)));
            }

            match stage {
                DeploymentStatus::Pending => {
                    self.transition(&mut attempt.record, DeploymentEvent::Provision).await?;
                }
                DeploymentStatus::Provisioning => {
                    let provisioner = self.provisioner(attempt.backend.clone());
                    let instance_id = match attempt.record.instance_id.clone() {
                        Some(id) => id,
                        None => self.create_instance(attempt, &provisioner).await?,
                    };

                    let reached = provisioner.await_reachable(&instance_id, cancel).await?;
                    attempt.record.public_address = Some(reached.address);
                    self.transition(&mut attempt.record, DeploymentEvent::Provisioned).await?;
                }
                DeploymentStatus::Authenticating => {
                    let address = require_address(&attempt.record)?;
                    let launcher = self.launcher();
                    launcher.preflight(&address).await?;
                    launcher.authenticate(&address, &attempt.credentials).await?;
                    self.transition(&mut attempt.record, DeploymentEvent::Authenticated).await?;
                }
                DeploymentStatus::Launching => {
                    let address = require_address(&attempt.record)?;
                    attempt.record.container_name = Some(attempt.preset.container_name().to_string());
                    self.store.save(&attempt.record).await?;

                    let handle = self
                        .launcher()
                        .launch(&address, attempt.preset, &attempt.credentials)
                        .await?;
                    attempt.record.container_name = Some(handle.container_name);
                    self.transition(&mut attempt.record, DeploymentEvent::Launched).await?;
                }
                DeploymentStatus::Warming => {
                    let address = require_address(&attempt.record)?;
                    let endpoint = attempt.preset.health_endpoint(&address)?;
                    let probe = self.container_probe(attempt.preset.container_name());
                    let gate = ReadinessGate::new(self.options.readiness.clone());

                    let ready = gate.await_ready(&probe, &endpoint, cancel).await?;
                    info!(
                        "'{}' ready after {} poll(s) in {:?}",
                        attempt.record.name, ready.polls, ready.elapsed
                    );
                    attempt.readiness = Some(ready);
                    self.transition(&mut attempt.record, DeploymentEvent::BecameReady).await?;
                }
                DeploymentStatus::Ready => return Ok(()),
                DeploymentStatus::Failed | DeploymentStatus::Terminated => {
                    return Err(DeployError::InvalidTransition(format!(
                        "'{}' is {}",
                        attempt.record.name, stage
                    )));
                }
            }
        }
    }

    /// Adopt a live instance already carrying the name, else create one. The
    /// request is persisted before it goes out and stays marked unless the
    /// provider refused it outright.
    async fn create_instance(
        &self,
        attempt: &mut Attempt<'_>,
        provisioner: &Provisioner,
    ) -> Result<String, DeployError> {
        let preset = attempt.preset;
        let name = preset.name.as_str();
        if let Some(found) = attempt.backend.find_by_name(name).await? {
            info!("Found instance {} for '{}'", found.instance_id, name);
            attempt.record.instance_id = Some(found.instance_id.clone());
            attempt.record.public_address = found.address;
            self.store.save(&attempt.record).await?;
            return Ok(found.instance_id);
        }

        attempt.record.create_requested = true;
        self.store.save(&attempt.record).await?;

        match provisioner.request(name, &preset.instance).await {
            Ok(created) => {
                attempt.record.instance_id = Some(created.instance_id.clone());
                attempt.record.public_address = created.address;
                self.store.save(&attempt.record).await?;
                Ok(created.instance_id)
            }
            Err(e) => {
                if is_refusal(&e) {
                    attempt.record.create_requested = false;
                } else {
                    warn!("Create of '{}' has unknown outcome: {}", name, e);
                }
                Err(e)
            }
        }
    }

    /// Observe instance, container and service, then move the record to
    /// the first stage that still has work to do
    async fn reconcile(
        &self,
        attempt: &mut Attempt<'_>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileAction, DeployError> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled("before reconcile".to_string()));
        }

        let Some(instance) = self.observe_instance(attempt).await? else {
            info!("No live instance for '{}'", attempt.record.name);
            attempt.record.clear_side_effects();
            self.enter_provisioning(&mut attempt.record).await?;
            return Ok(ReconcileAction::Fresh);
        };

        attempt.record.instance_id = Some(instance.instance_id.clone());
        attempt.record.public_address = instance.address.clone();

        let Some(address) = instance
            .address
            .filter(|_| instance.status == InstanceStatus::Active)
        else {
            info!(
                "Instance {} is {:?}, waiting for it",
                instance.instance_id, instance.status
            );
            self.enter_provisioning(&mut attempt.record).await?;
            return Ok(ReconcileAction::AwaitInstance);
        };

        let container_name = attempt.preset.container_name();
        let state = match self.launcher().inspect(&address, container_name).await {
            Ok(state) => state,
            Err(e) if e.is_transient() => {
                warn!("Cannot inspect {} yet: {}", address, e);
                self.enter_provisioning(&mut attempt.record).await?;
                return Ok(ReconcileAction::AwaitInstance);
            }
            Err(e) => return Err(e),
        };

        let usable = state
            .as_ref()
            .map(|s| s.running && !s.is_dead() && s.image == attempt.preset.image)
            .unwrap_or(false);
        if !usable {
            info!(
                "Container {} on {} is {:?}, relaunching",
                container_name, address, state
            );
            self.enter_provisioning(&mut attempt.record).await?;
            return Ok(ReconcileAction::Relaunch);
        }

        attempt.record.container_name = Some(container_name.to_string());
        let endpoint = attempt.preset.health_endpoint(&address)?;
        let signal = self.container_probe(container_name).sample(&endpoint).await;

        match signal.phase() {
            ReadinessPhase::Ready => {
                info!("'{}' already serves on {}", attempt.record.name, address);
                self.transition(&mut attempt.record, DeploymentEvent::AdoptReady).await?;
                Ok(ReconcileAction::AlreadyReady)
            }
            ReadinessPhase::Warming | ReadinessPhase::Booting => {
                self.transition(&mut attempt.record, DeploymentEvent::AdoptWarming).await?;
                Ok(ReconcileAction::AdoptWarming)
            }
            ReadinessPhase::Crashed => {
                info!("Container {} does not respond, relaunching", container_name);
                self.enter_provisioning(&mut attempt.record).await?;
                Ok(ReconcileAction::Relaunch)
            }
        }
    }

    /// The instance this record owns, else a live one carrying its name
    async fn observe_instance(
        &self,
        attempt: &Attempt<'_>,
    ) -> Result<Option<InstanceObservation>, DeployError> {
        let observed = match &attempt.record.instance_id {
            Some(id) => match attempt.backend.describe(id).await {
                Ok(observation) => Some(observation),
                Err(DeployError::NotFound(_)) => None,
                Err(e) => return Err(e),
            },
            None => attempt.backend.find_by_name(&attempt.record.name).await?,
        };
        Ok(observed.filter(|o| !o.is_gone()))
    }

    /// Put the record at PROVISIONING; an existing instance id is reused
    async fn enter_provisioning(&self, record: &mut DeploymentRecord) -> Result<(), DeployError> {
        let event = match record.status {
            DeploymentStatus::Pending => DeploymentEvent::Provision,
            DeploymentStatus::Provisioning => {
                self.store.save(record).await?;
                return Ok(());
            }
            _ => DeploymentEvent::Restart,
        };
        self.transition(record, event).await
    }

    async fn transition(
        &self,
        record: &mut DeploymentRecord,
        event: DeploymentEvent,
    ) -> Result<(), DeployError> {
        let from = record.status;
        record.apply(event)?;
        self.store.save(record).await?;
        info!("'{}': {} -> {}", record.name, from, record.status);
        Ok(())
    }

    /// Record the failure; clean up when asked to and poison the name when
    /// external resources are left in an unknown state
    async fn fail(&self, attempt: &mut Attempt<'_>, err: DeployError) -> DeploymentFailure {
        let stage = attempt.record.status;
        let name = attempt.record.name.clone();
        error!("'{}' failed in {}: {}", name, stage, err);

        let cancelled = matches!(err, DeployError::Cancelled(_));
        let mut poison_reason = None;

        if attempt.record.has_side_effects() {
            if cancelled || self.options.rollback_on_failure {
                match self.cleanup(attempt).await {
                    Ok(()) => attempt.record.clear_side_effects(),
                    Err(cleanup_err) => {
                        poison_reason = Some(format!(
                            "cleanup after {} in {} failed: {}",
                            err.kind(),
                            stage,
                            cleanup_err
                        ));
                    }
                }
            } else {
                poison_reason = Some(format!(
                    "{} in {} left instance {} in place",
                    err.kind(),
                    stage,
                    attempt.record.instance_id.as_deref().unwrap_or("(create unconfirmed)")
                ));
            }
        }

        if !attempt.record.status.is_terminal() {
            if let Err(e) = attempt.record.apply(DeploymentEvent::Fail(err.to_string())) {
                warn!("Could not record failure of '{}': {}", name, e);
            }
        }
        if let Some(reason) = &poison_reason {
            attempt.record.poison(reason.as_str());
        }

        if let Err(e) = self.store.save(&attempt.record).await {
            error!("Could not persist failure of '{}': {}", name, e);
            if let Some(reason) = &poison_reason {
                if let Err(e) = self.store.mark_poisoned(&name, reason).await {
                    error!("Could not poison '{}' ({}): {}", name, reason, e);
                }
            }
        }

        let mut failure = DeploymentFailure::new(&name, stage, err);
        if poison_reason.is_some() {
            failure.poisoned = true;
            warn!("Identity '{}' is poisoned", name);
        }
        failure
    }

    /// Best-effort removal of everything this attempt created
    async fn cleanup(&self, attempt: &Attempt<'_>) -> Result<(), DeployError> {
        let record = &attempt.record;
        if let (Some(address), Some(container)) = (&record.public_address, &record.container_name) {
            if let Err(e) = self.launcher().stop(address, container).await {
                warn!("Could not stop container {}: {}", container, e);
            }
        }
        let instance_id = match &record.instance_id {
            Some(id) => Some(id.clone()),
            None if record.create_requested => attempt
                .backend
                .find_by_name(&record.name)
                .await?
                .map(|found| found.instance_id),
            None => None,
        };
        if let Some(id) = instance_id {
            attempt.backend.destroy(&id).await?;
        }
        info!("Cleaned up after '{}'", record.name);
        Ok(())
    }
}

/// The provider answered and did not create anything
fn is_refusal(err: &DeployError) -> bool {
    matches!(
        err,
        DeployError::ProvisionRejected(_)
            | DeployError::ConfigError(_)
            | DeployError::ValidationError(_)
            | DeployError::NotFound(_)
    )
}

fn require_address(record: &DeploymentRecord) -> Result<String, DeployError> {
    record.public_address.clone().ok_or_else(|| {
        DeployError::Internal(format!("'{}' has no instance address", record.name))
    })
}
