//! Reconciler tests against in-memory provider, host and service

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use gpudeploy::authn::credentials::CredentialKind;
use gpudeploy::authn::resolver::CredentialResolver;
use gpudeploy::authn::secrets::MapSecretSource;
use gpudeploy::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use gpudeploy::deploy::launcher::LaunchPolicy;
use gpudeploy::deploy::provisioner::ProvisionPolicy;
use gpudeploy::deploy::readiness::ReadinessPolicy;
use gpudeploy::deploy::reconciler::{DeployMode, ReconcileAction, Reconciler, ReconcilerOptions};
use gpudeploy::errors::DeployError;
use gpudeploy::filesys::dir::Dir;
use gpudeploy::infra::backend::InstanceStatus;
use gpudeploy::models::health::HealthSignal;
use gpudeploy::models::preset::RegistrySpec;
use gpudeploy::models::record::DeploymentRecord;
use gpudeploy::remote::exec::ExecOutput;
use gpudeploy::storage::identity::IdentityStore;

use crate::fakes::{failed, preset, FakeBackend, FakeConnector, FakeContainer, FakeRemote, ScriptedProbe, IMAGE};

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<IdentityStore>,
    backend: Arc<FakeBackend>,
    remote: Arc<FakeRemote>,
    probe: Arc<ScriptedProbe>,
    reconciler: Reconciler,
}

fn secrets() -> MapSecretSource {
    MapSecretSource::new()
        .with("LAMBDA_API_KEY", "secret_lambda")
        .with("HF_TOKEN", "hf_abc")
        .with("GHCR_TOKEN", "ghp_xyz")
}

fn options(rollback_on_failure: bool) -> ReconcilerOptions {
    ReconcilerOptions {
        provision: ProvisionPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
        },
        launch: LaunchPolicy::default(),
        readiness: ReadinessPolicy {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
        },
        rollback_on_failure,
    }
}

fn harness_with(source: MapSecretSource, probe: Arc<ScriptedProbe>, rollback: bool) -> Harness {
    harness_with_options(source, probe, options(rollback))
}

fn harness_with_options(
    source: MapSecretSource,
    probe: Arc<ScriptedProbe>,
    options: ReconcilerOptions,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(IdentityStore::new(Dir::new(dir.path().join("records"))));
    let backend = FakeBackend::new();
    let remote = FakeRemote::new();

    let reconciler = Reconciler::new(
        store.clone(),
        CredentialResolver::new(Arc::new(source)),
        Arc::new(FakeConnector(backend.clone())),
        remote.clone(),
        probe.clone(),
        options,
    );

    Harness {
        _dir: dir,
        store,
        backend,
        remote,
        probe,
        reconciler,
    }
}

fn harness() -> Harness {
    harness_with(secrets(), ScriptedProbe::always(HealthSignal::ready()), false)
}

#[tokio::test]
async fn test_deploy_reaches_ready() {
    let h = harness();
    let preset = preset("flux");

    let report = h
        .reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, DeploymentStatus::Ready);
    assert_eq!(report.address.as_deref(), Some("10.0.0.1"));
    assert_eq!(report.instance_id.as_deref(), Some("i-1"));
    assert_eq!(report.container.as_deref(), Some("flux"));
    assert_eq!(report.readiness.as_ref().map(|r| r.polls), Some(1));
    assert!(report.reconciled.is_none());

    let record = h.store.load("flux").await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Ready);
    assert!(!h.store.is_active("flux"));

    assert_eq!(h.backend.creates(), vec!["flux".to_string()]);
    assert_eq!(h.remote.count("docker pull"), 1);
    assert_eq!(h.remote.count("docker run"), 1);
    assert_eq!(h.remote.count("docker login"), 0);
    assert!(h
        .remote
        .stdin()
        .iter()
        .any(|env| env.contains("HF_TOKEN=hf_abc")));
}

#[tokio::test]
async fn test_missing_model_token_fails_before_side_effects() {
    let source = MapSecretSource::new().with("LAMBDA_API_KEY", "secret_lambda");
    let h = harness_with(source, ScriptedProbe::always(HealthSignal::ready()), false);

    let failure = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        DeployError::MissingCredential {
            kind: CredentialKind::ModelAccess,
            ..
        }
    ));
    assert_eq!(failure.stage, DeploymentStatus::Pending);
    assert!(!failure.poisoned);
    assert!(h.backend.creates().is_empty());
    assert!(h.remote.calls().is_empty());
    assert!(h.store.load("flux").await.unwrap().is_none());
}

#[tokio::test]
async fn test_registry_login_runs_as_remote_root() {
    let h = harness();
    let mut preset = preset("flux");
    preset.registry = Some(RegistrySpec {
        server: "ghcr.io".to_string(),
        username: "deploy-bot".to_string(),
        password: "${GHCR_TOKEN}".to_string(),
    });

    h.reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap();

    let calls = h.remote.calls();
    let login = calls
        .iter()
        .position(|c| c.starts_with("sudo docker login ghcr.io"))
        .unwrap();
    let pull = calls.iter().position(|c| c.contains("docker pull")).unwrap();
    assert!(login < pull);
    assert!(!calls[login].contains("ghp_xyz"));
    assert!(h.remote.stdin().iter().any(|s| s == "ghp_xyz"));
}

#[tokio::test]
async fn test_force_adopts_ready_container() {
    let h = harness();
    h.backend
        .add_instance("i-7", "flux", InstanceStatus::Active, Some("10.0.0.7"));
    h.remote.set_container(Some(FakeContainer::running(IMAGE)));

    let report = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Force, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.reconciled, Some(ReconcileAction::AlreadyReady));
    assert_eq!(report.status, DeploymentStatus::Ready);
    assert_eq!(report.instance_id.as_deref(), Some("i-7"));
    assert!(h.backend.creates().is_empty());
    assert_eq!(h.remote.count("docker run"), 0);
    assert_eq!(h.remote.count("docker pull"), 0);
}

#[tokio::test]
async fn test_force_adopts_warming_container() {
    let probe = ScriptedProbe::new(vec![
        HealthSignal::warming(),
        HealthSignal::warming(),
        HealthSignal::ready(),
    ]);
    let h = harness_with(secrets(), probe, false);
    h.backend
        .add_instance("i-7", "flux", InstanceStatus::Active, Some("10.0.0.7"));
    h.remote.set_container(Some(FakeContainer::running(IMAGE)));

    let report = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Force, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.reconciled, Some(ReconcileAction::AdoptWarming));
    assert_eq!(report.status, DeploymentStatus::Ready);
    assert_eq!(h.remote.count("docker run"), 0);
    assert_eq!(h.probe.samples(), 3);
}

#[tokio::test]
async fn test_force_relaunches_dead_container() {
    let h = harness();
    h.backend
        .add_instance("i-7", "flux", InstanceStatus::Active, Some("10.0.0.7"));
    h.remote.set_container(Some(FakeContainer {
        status: "exited".to_string(),
        running: false,
        restart_count: 0,
        image: IMAGE.to_string(),
    }));

    let report = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Force, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.reconciled, Some(ReconcileAction::Relaunch));
    assert_eq!(report.status, DeploymentStatus::Ready);
    assert!(h.backend.creates().is_empty());
    assert_eq!(h.remote.count("docker run"), 1);
}

#[tokio::test]
async fn test_force_without_instance_deploys_fresh() {
    let h = harness();

    let report = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Force, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.reconciled, Some(ReconcileAction::Fresh));
    assert_eq!(h.backend.creates().len(), 1);
}

#[tokio::test]
async fn test_resume_continues_from_launching() {
    let h = harness();
    let preset = preset("flux");
    h.backend
        .add_instance("i-3", "flux", InstanceStatus::Active, Some("10.0.0.3"));

    let mut record = DeploymentRecord::new("flux", preset.frozen_digest());
    record.apply(DeploymentEvent::Provision).unwrap();
    record.instance_id = Some("i-3".to_string());
    record.public_address = Some("10.0.0.3".to_string());
    record.apply(DeploymentEvent::Provisioned).unwrap();
    record.apply(DeploymentEvent::Authenticated).unwrap();
    h.store.save(&record).await.unwrap();

    let report = h
        .reconciler
        .resume(&preset, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, DeploymentStatus::Ready);
    assert_eq!(report.address.as_deref(), Some("10.0.0.3"));
    assert!(h.backend.creates().is_empty());
    assert_eq!(h.remote.probes(), 0);
    assert_eq!(h.remote.count("docker info"), 0);
    assert_eq!(h.remote.count("docker run"), 1);
}

#[tokio::test]
async fn test_resume_finds_orphaned_instance() {
    let h = harness();
    let preset = preset("flux");
    h.backend
        .add_instance("i-5", "flux", InstanceStatus::Active, Some("10.0.0.5"));

    let mut record = DeploymentRecord::new("flux", preset.frozen_digest());
    record.apply(DeploymentEvent::Provision).unwrap();
    h.store.save(&record).await.unwrap();

    let report = h
        .reconciler
        .resume(&preset, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.instance_id.as_deref(), Some("i-5"));
    assert!(h.backend.creates().is_empty());
}

#[tokio::test]
async fn test_failure_with_side_effects_poisons_name() {
    let h = harness();
    let preset = preset("flux");
    h.remote.fail_on(
        "docker pull",
        failed("Error response from daemon: manifest unknown"),
    );

    let failure = h
        .reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), "ImagePullFailed");
    assert_eq!(failure.stage, DeploymentStatus::Launching);
    assert!(failure.poisoned);
    assert!(h.backend.destroys().is_empty());

    let record = h.store.load("flux").await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.poisoned());
    assert!(record.poison_reason.as_deref().unwrap().contains("i-1"));
    assert_eq!(
        record.history.last().map(|t| t.to),
        Some(DeploymentStatus::Failed)
    );

    h.remote.clear_failures();
    let again = h
        .reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(again.error, DeployError::PoisonedIdentity(_)));
    assert!(again.poisoned);
    assert_eq!(h.backend.creates().len(), 1);
}

#[tokio::test]
async fn test_rollback_then_release_reuses_name() {
    let h = harness_with(secrets(), ScriptedProbe::always(HealthSignal::ready()), true);
    let preset = preset("flux");
    h.remote.fail_on(
        "docker pull",
        failed("Error response from daemon: manifest unknown"),
    );

    let failure = h
        .reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(!failure.poisoned);
    assert_eq!(h.backend.destroys(), vec!["i-1".to_string()]);

    let record = h.store.load("flux").await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(!record.has_side_effects());

    h.remote.clear_failures();
    let conflict = h
        .reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(conflict.error, DeployError::NameConflict(_)));
    assert!(!conflict.poisoned);
    assert_eq!(h.backend.creates().len(), 1);

    h.reconciler.teardown(&preset).await.unwrap();
    h.store.release("flux").await.unwrap();
    let report = h
        .reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.attempt, 1);
    assert_eq!(report.instance_id.as_deref(), Some("i-2"));
}

#[tokio::test]
async fn test_lost_create_response_poisons_name() {
    let h = harness();
    let preset = preset("flux");
    h.backend.lose_next_create_response();

    let failure = h
        .reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.kind(), "ProviderUnavailable");
    assert_eq!(failure.stage, DeploymentStatus::Provisioning);
    assert!(failure.poisoned);

    let record = h.store.load("flux").await.unwrap().unwrap();
    assert!(record.poisoned());
    assert!(record.create_requested);
    assert!(record.instance_id.is_none());

    let again = h
        .reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(again.error, DeployError::PoisonedIdentity(_)));
    assert_eq!(h.backend.creates().len(), 1);
    assert_eq!(h.backend.live_named("flux"), vec!["i-1".to_string()]);
}

#[tokio::test]
async fn test_lost_create_response_is_rolled_back_by_name() {
    let h = harness_with(secrets(), ScriptedProbe::always(HealthSignal::ready()), true);
    h.backend.lose_next_create_response();

    let failure = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(!failure.poisoned);
    assert_eq!(h.backend.destroys(), vec!["i-1".to_string()]);
    assert!(h.backend.live_named("flux").is_empty());

    let record = h.store.load("flux").await.unwrap().unwrap();
    assert!(!record.has_side_effects());
}

#[tokio::test]
async fn test_refused_create_does_not_poison() {
    let h = harness();
    h.backend.reject_next_create();

    let failure = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.kind(), "ProvisionRejected");
    assert!(!failure.poisoned);

    let record = h.store.load("flux").await.unwrap().unwrap();
    assert!(!record.poisoned());
    assert!(!record.has_side_effects());
    assert!(h.backend.live_named("flux").is_empty());
}

#[tokio::test]
async fn test_deploy_adopts_instance_already_named() {
    let h = harness();
    h.backend
        .add_instance("i-4", "flux", InstanceStatus::Active, Some("10.0.0.4"));

    let report = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.instance_id.as_deref(), Some("i-4"));
    assert!(h.backend.creates().is_empty());
}

#[tokio::test]
async fn test_registry_login_rejected() {
    let h = harness();
    let mut preset = preset("flux");
    preset.registry = Some(RegistrySpec {
        server: "ghcr.io".to_string(),
        username: "deploy-bot".to_string(),
        password: "${GHCR_TOKEN}".to_string(),
    });
    h.remote.fail_on(
        "docker login",
        failed("Error response from daemon: Get \"https://ghcr.io/v2/\": denied: denied"),
    );

    let failure = h
        .reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), "AuthRejected");
    assert_eq!(failure.stage, DeploymentStatus::Authenticating);
    assert!(failure.poisoned);
    assert_eq!(h.remote.count("docker pull"), 0);
    assert_eq!(h.remote.count("docker run"), 0);
}

#[tokio::test]
async fn test_missing_gpu_runtime_fails_launch() {
    let h = harness();
    h.remote.fail_on(
        "docker run",
        failed("docker: Error response from daemon: could not select device driver \"\" with capabilities: [[gpu]]."),
    );

    let failure = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), "RuntimeCapabilityUnavailable");
    assert_eq!(failure.stage, DeploymentStatus::Launching);
    assert!(failure.poisoned);

    let record = h.store.load("flux").await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.poisoned());
    assert_eq!(h.backend.status_of("i-1"), Some(InstanceStatus::Active));
}

#[tokio::test]
async fn test_cancel_while_warming_cleans_up() {
    let h = harness_with(secrets(), ScriptedProbe::always(HealthSignal::warming()), false);
    let cancel = CancellationToken::new();
    h.probe.cancel_when_sampled(cancel.clone());

    let failure = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &cancel)
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), "Cancelled");
    assert_eq!(failure.stage, DeploymentStatus::Warming);
    assert!(!failure.poisoned);
    assert_eq!(h.backend.destroys(), vec!["i-1".to_string()]);
    assert!(h.backend.live_named("flux").is_empty());
    assert_eq!(h.remote.count("docker rm -f"), 2);

    let record = h.store.load("flux").await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(!record.poisoned());
    assert!(!record.has_side_effects());
}

#[tokio::test]
async fn test_failed_cleanup_poisons_name() {
    let h = harness_with(secrets(), ScriptedProbe::always(HealthSignal::ready()), true);
    h.backend.fail_destroys();
    h.remote.fail_on(
        "docker pull",
        failed("Error response from daemon: manifest unknown"),
    );

    let failure = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), "ImagePullFailed");
    assert!(failure.poisoned);
    assert_eq!(h.backend.destroys(), vec!["i-1".to_string()]);

    let record = h.store.load("flux").await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.poisoned());
    assert!(record
        .poison_reason
        .as_deref()
        .unwrap()
        .starts_with("cleanup after ImagePullFailed"));
}

#[tokio::test]
async fn test_preflight_installs_missing_docker() {
    let mut options = options(false);
    options.launch = LaunchPolicy {
        bootstrap_docker: true,
        ..LaunchPolicy::default()
    };
    let h = harness_with_options(secrets(), ScriptedProbe::always(HealthSignal::ready()), options);
    h.remote.without_docker();

    let report = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, DeploymentStatus::Ready);
    assert_eq!(h.remote.count("docker info"), 2);
    assert_eq!(h.remote.count("apt-get install -y docker-ce"), 1);
    let calls = h.remote.calls();
    let enable = calls
        .iter()
        .position(|c| c == "sudo systemctl enable --now docker")
        .unwrap();
    let pull = calls.iter().position(|c| c.contains("docker pull")).unwrap();
    assert!(enable < pull);
}

#[tokio::test]
async fn test_missing_docker_without_bootstrap() {
    let h = harness();
    h.remote.without_docker();

    let failure = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), "RuntimeCapabilityUnavailable");
    assert_eq!(failure.stage, DeploymentStatus::Authenticating);
    assert_eq!(h.remote.count("apt-get"), 0);
}

#[tokio::test]
async fn test_exited_container_is_a_crash() {
    let h = harness_with(secrets(), ScriptedProbe::always(HealthSignal::unreachable()), false);
    h.remote.fail_on(
        "docker inspect",
        ExecOutput {
            stdout: format!("exited|false|0|{}\n", IMAGE),
            stderr: String::new(),
            exit_code: 0,
        },
    );

    let failure = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), "ServiceCrashed");
    assert_eq!(failure.stage, DeploymentStatus::Warming);
    assert_eq!(h.probe.samples(), 1);
}

#[tokio::test]
async fn test_endless_warm_up_is_a_timeout() {
    let h = harness_with(secrets(), ScriptedProbe::always(HealthSignal::warming()), false);

    let failure = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        DeployError::ReadinessTimeout { warming: true, .. }
    ));
    assert_eq!(failure.stage, DeploymentStatus::Warming);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let h = harness();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let failure = h
        .reconciler
        .deploy(&preset("flux"), DeployMode::Normal, &cancel)
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), "Cancelled");
    assert!(!failure.poisoned);
    assert!(h.backend.creates().is_empty());
}

#[tokio::test]
async fn test_teardown_then_release_frees_name() {
    let h = harness();
    let preset = preset("flux");
    h.reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap();

    let record = h.reconciler.teardown(&preset).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Terminated);
    assert!(!record.has_side_effects());
    assert_eq!(h.backend.status_of("i-1"), Some(InstanceStatus::Terminated));

    h.store.release("flux").await.unwrap();
    let report = h
        .reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.attempt, 1);
    assert_eq!(h.backend.creates().len(), 2);
}

#[tokio::test]
async fn test_status_samples_service() {
    let h = harness();
    let preset = preset("flux");
    h.reconciler
        .deploy(&preset, DeployMode::Normal, &CancellationToken::new())
        .await
        .unwrap();

    let report = h.reconciler.status(&preset).await.unwrap();
    assert_eq!(report.record.status, DeploymentStatus::Ready);
    assert!(report.signal.unwrap().ready);
    assert!(report.latency.is_some());

    let missing = h.reconciler.status(&crate::fakes::preset("other")).await;
    assert!(matches!(missing, Err(DeployError::NotFound(_))));
}
