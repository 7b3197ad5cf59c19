//! HTTP probe and provider client tests against a mock server

use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gpudeploy::authn::credentials::CloudApiKey;
use gpudeploy::errors::DeployError;
use gpudeploy::http::health::{HealthProbe, HttpHealthProbe};
use gpudeploy::infra::backend::{InfraBackend, InstanceStatus};
use gpudeploy::infra::lambda::LambdaBackend;
use gpudeploy::models::health::{HealthEndpoint, ReadinessPhase};
use gpudeploy::storage::settings::ProviderSettings;

use crate::fakes::preset;

fn endpoint(server: &MockServer, ready_path: Option<&str>) -> HealthEndpoint {
    let address = server.address();
    HealthEndpoint::new(&address.ip().to_string(), address.port(), "/health", ready_path).unwrap()
}

fn probe() -> HttpHealthProbe {
    HttpHealthProbe::new(Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_probe_ready_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;

    let signal = probe().sample(&endpoint(&server, None)).await;
    assert_eq!(signal.phase(), ReadinessPhase::Ready);
}

#[tokio::test]
async fn test_probe_loading_body_is_warming() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": "loading", "progress": 0.4})),
        )
        .mount(&server)
        .await;

    let signal = probe().sample(&endpoint(&server, None)).await;
    assert_eq!(signal.phase(), ReadinessPhase::Warming);
}

#[tokio::test]
async fn test_probe_ready_endpoint_decides() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("alive"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ready"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let signal = probe().sample(&endpoint(&server, Some("/ready"))).await;
    assert_eq!(signal.phase(), ReadinessPhase::Warming);
}

#[tokio::test]
async fn test_probe_error_status_is_crashed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let signal = probe().sample(&endpoint(&server, None)).await;
    assert!(signal.reachable);
    assert!(!signal.responding);
    assert_eq!(signal.phase(), ReadinessPhase::Crashed);
}

#[tokio::test]
async fn test_probe_closed_port_is_booting() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let endpoint = HealthEndpoint::new("127.0.0.1", port, "/health", None).unwrap();

    let signal = probe().sample(&endpoint).await;
    assert_eq!(signal.phase(), ReadinessPhase::Booting);
}

fn backend(server: &MockServer) -> LambdaBackend {
    let settings = ProviderSettings {
        base_url: server.uri(),
        request_timeout_secs: 5,
        default_ssh_key_name: Some("ops-default".to_string()),
    };
    let key = CloudApiKey::new(SecretString::from("secret_lambda".to_string()));
    LambdaBackend::new(&key, &settings).unwrap()
}

#[tokio::test]
async fn test_lambda_create() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/instance-operations/launch"))
        .and(header("authorization", "Bearer secret_lambda"))
        .and(body_partial_json(json!({
            "region_name": "us-east-1",
            "instance_type_name": "gpu_1x_a10",
            "ssh_key_names": ["ops"],
            "quantity": 1,
            "name": "flux"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"instance_ids": ["i-abc"]}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let created = backend(&server)
        .create("flux", &preset("flux").instance)
        .await
        .unwrap();
    assert_eq!(created.instance_id, "i-abc");
    assert!(created.address.is_none());
}

#[tokio::test]
async fn test_lambda_create_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/instance-operations/launch"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "code": "instance-operations/launch/insufficient-capacity",
                "message": "Not enough capacity to fulfill launch request.",
                "suggestion": "Choose an instance type with more availability"
            }
        })))
        .mount(&server)
        .await;

    let err = backend(&server)
        .create("flux", &preset("flux").instance)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ProvisionRejected(ref m) if m.contains("capacity")));
}

#[tokio::test]
async fn test_lambda_unavailable_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/instances/i-abc"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = backend(&server).describe("i-abc").await.unwrap_err();
    assert!(matches!(err, DeployError::ProviderUnavailable(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_lambda_describe_and_find() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/instances/i-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"id": "i-abc", "name": "flux", "ip": "203.0.113.7", "status": "active"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "i-old", "name": "flux", "ip": "203.0.113.1", "status": "terminated"},
                {"id": "i-other", "name": "sdxl", "ip": null, "status": "booting"},
                {"id": "i-abc", "name": "flux", "ip": "203.0.113.7", "status": "active"}
            ]
        })))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let observed = backend.describe("i-abc").await.unwrap();
    assert_eq!(observed.status, InstanceStatus::Active);
    assert_eq!(observed.address.as_deref(), Some("203.0.113.7"));
    assert!(observed.is_network_ready());

    let found = backend.find_by_name("flux").await.unwrap().unwrap();
    assert_eq!(found.instance_id, "i-abc");
    assert!(backend.find_by_name("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_lambda_destroy_unknown_instance() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/instance-operations/terminate"))
        .and(body_partial_json(json!({"instance_ids": ["i-gone"]})))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"code": "global/object-does-not-exist", "message": "Specified instance does not exist."}
        })))
        .expect(1)
        .mount(&server)
        .await;

    backend(&server).destroy("i-gone").await.unwrap();
}

#[tokio::test]
async fn test_lambda_requires_ssh_key_name() {
    let server = MockServer::start().await;
    let settings = ProviderSettings {
        base_url: server.uri(),
        request_timeout_secs: 5,
        default_ssh_key_name: None,
    };
    let key = CloudApiKey::new(SecretString::from("secret_lambda".to_string()));
    let backend = LambdaBackend::new(&key, &settings).unwrap();

    let mut spec = preset("flux").instance;
    spec.ssh_key_name = None;
    // LAMBDA_SSH_KEY_NAME may be set in the environment running the tests
    if std::env::var(gpudeploy::infra::lambda::SSH_KEY_NAME_ENV).is_err() {
        let err = backend.create("flux", &spec).await.unwrap_err();
        assert!(matches!(err, DeployError::ConfigError(_)));
    }
}
