//! Identity store tests

use gpudeploy::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use gpudeploy::errors::DeployError;
use gpudeploy::filesys::dir::Dir;
use gpudeploy::storage::identity::IdentityStore;
use tokio_test::{assert_err, assert_ok};

use crate::fakes::preset;

fn store(dir: &tempfile::TempDir) -> IdentityStore {
    IdentityStore::new(Dir::new(dir.path().join("records")))
}

#[tokio::test]
async fn test_fresh_name_registers_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let preset = preset("flux");

    let (first, second) = tokio::join!(store.register(&preset), store.register(&preset));
    let results = [first, second];

    let registered = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(registered, 1);
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(DeployError::AlreadyInProgress(_))))
        .count();
    assert_eq!(rejected, 1);
}

#[tokio::test]
async fn test_registration_persists_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let preset = preset("flux");

    let registration = assert_ok!(store.register(&preset).await);
    assert!(store.is_active("flux"));
    assert_eq!(registration.claim.name(), "flux");

    let loaded = store.load("flux").await.unwrap().unwrap();
    assert_eq!(loaded.status, DeploymentStatus::Pending);
    assert_eq!(loaded.preset_digest, preset.frozen_digest());

    drop(registration);
    assert!(!store.is_active("flux"));
}

#[tokio::test]
async fn test_in_progress_record_blocks_register() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let preset = preset("flux");

    drop(assert_ok!(store.register(&preset).await));

    let err = assert_err!(store.register(&preset).await);
    assert!(matches!(err, DeployError::AlreadyInProgress(_)));
}

#[tokio::test]
async fn test_ready_record_is_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let preset = preset("flux");

    let mut record = store.register(&preset).await.unwrap().record;
    for event in [
        DeploymentEvent::Provision,
        DeploymentEvent::Provisioned,
        DeploymentEvent::Authenticated,
        DeploymentEvent::Launched,
        DeploymentEvent::BecameReady,
    ] {
        record.apply(event).unwrap();
    }
    store.save(&record).await.unwrap();

    let err = assert_err!(store.register(&preset).await);
    assert!(matches!(err, DeployError::NameConflict(_)));
}

#[tokio::test]
async fn test_poisoned_name_is_never_reused() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let preset = preset("flux");

    let mut record = store.register(&preset).await.unwrap().record;
    record.apply(DeploymentEvent::Provision).unwrap();
    record.instance_id = Some("i-1".to_string());
    record.apply(DeploymentEvent::Fail("lost".to_string())).unwrap();
    store.save(&record).await.unwrap();
    store.mark_poisoned("flux", "instance left behind").await.unwrap();

    assert!(matches!(
        store.register(&preset).await,
        Err(DeployError::PoisonedIdentity(_))
    ));
    assert!(matches!(
        store.adopt(&preset).await,
        Err(DeployError::PoisonedIdentity(_))
    ));
    assert!(matches!(
        store.claim_existing(&preset).await,
        Err(DeployError::PoisonedIdentity(_))
    ));

    // teardown still gets through
    let teardown = store.claim_for_teardown("flux").await.unwrap();
    assert!(teardown.record.poisoned());
}

#[tokio::test]
async fn test_failed_record_is_a_name_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let preset = preset("flux");

    let mut record = store.register(&preset).await.unwrap().record;
    record.apply(DeploymentEvent::Fail("no capacity".to_string())).unwrap();
    store.save(&record).await.unwrap();

    let err = assert_err!(store.register(&preset).await);
    assert!(matches!(err, DeployError::NameConflict(_)));
    let stored = store.load("flux").await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Failed);
    assert_eq!(stored.attempt_count, 1);

    // reconcile mode takes the failed record over as a new attempt
    let adopted = assert_ok!(store.adopt(&preset).await);
    assert_eq!(adopted.record.status, DeploymentStatus::Pending);
    assert_eq!(adopted.record.attempt_count, 2);
}

#[tokio::test]
async fn test_frozen_fields_after_launch() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let preset = preset("flux");

    let mut record = store.register(&preset).await.unwrap().record;
    record.apply(DeploymentEvent::Provision).unwrap();
    record.apply(DeploymentEvent::Provisioned).unwrap();
    record.apply(DeploymentEvent::Authenticated).unwrap();
    record.apply(DeploymentEvent::Fail("pull failed".to_string())).unwrap();
    store.save(&record).await.unwrap();

    let mut changed = preset.clone();
    changed.image = "ghcr.io/acme/image-server:2.0".to_string();
    let err = store.adopt(&changed).await.unwrap_err();
    assert!(matches!(err, DeployError::PresetFrozen(_)));

    // env is not frozen
    let mut env_only = preset.clone();
    env_only.env.insert("LOG_LEVEL".to_string(), "debug".to_string());
    assert!(store.adopt(&env_only).await.is_ok());
}

#[tokio::test]
async fn test_release_requires_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let preset = preset("flux");

    let registration = store.register(&preset).await.unwrap();
    assert!(matches!(
        store.release("flux").await,
        Err(DeployError::AlreadyInProgress(_))
    ));

    let mut record = registration.record;
    drop(registration.claim);
    assert!(matches!(
        store.release("flux").await,
        Err(DeployError::InvalidTransition(_))
    ));

    record.apply(DeploymentEvent::Teardown).unwrap();
    store.save(&record).await.unwrap();
    store.release("flux").await.unwrap();
    assert!(store.load("flux").await.unwrap().is_none());
    assert!(store.register(&preset).await.is_ok());
}

#[tokio::test]
async fn test_corrupt_record_is_a_storage_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let records = Dir::new(dir.path().join("records"));
    records.create().await.unwrap();
    tokio::fs::write(records.path().join("flux.json"), b"{not json")
        .await
        .unwrap();

    let err = store.load("flux").await.unwrap_err();
    assert!(matches!(err, DeployError::StorageError(_)));
    assert!(store.list().await.unwrap().is_empty());
}
