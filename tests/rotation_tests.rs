//! # Rotation Integration Tests
//!
//! Rotation controller and reconciliation driver against the in-memory store.

use chrono::{Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{APIService, APIServiceSpec};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trust_controller::certauthority::{is_signed_by, leaf_info, CertificateAuthority};
use trust_controller::constants::{
    CA_CERTIFICATE_KEY, CA_PRIVATE_KEY_KEY, TLS_CERTIFICATE_CHAIN_KEY, TLS_PRIVATE_KEY_KEY,
};
use trust_controller::controller::{
    ApiServiceController, MaterialState, RotationController, RotationSettings,
};
use trust_controller::dynamic_cert::{DynamicCertProvider, TriggerListener};
use trust_controller::runtime::{Driver, DriverConfig};
use trust_controller::store::{MemoryStore, ResourceStore};

const SECRET: &str = "api-tls-serving-certificate";
const DNS_NAME: &str = "api.trust.svc";
const API_SERVICE: &str = "v1alpha1.login.trust.example";

fn settings() -> RotationSettings {
    RotationSettings {
        secret_name: SECRET.to_string(),
        labels: BTreeMap::from([("app.kubernetes.io/name".to_string(), "test".to_string())]),
        ca_common_name: "rotation test CA".to_string(),
        ca_duration: Duration::from_secs(365 * 24 * 3600),
        serving_duration: Duration::from_secs(30 * 24 * 3600),
        renew_before: Duration::from_secs(7 * 24 * 3600),
        dns_names: vec![DNS_NAME.to_string()],
        ip_addrs: Vec::new(),
    }
}

struct Harness {
    store: Arc<MemoryStore<Secret>>,
    serving: Arc<DynamicCertProvider>,
    ca: Arc<DynamicCertProvider>,
    controller: Arc<RotationController>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::<Secret>::namespaced("trust"));
    let ca = Arc::new(DynamicCertProvider::new_ca("ca"));
    let serving = Arc::new(DynamicCertProvider::new_serving_cert("serving"));
    let controller = Arc::new(RotationController::new(
        Arc::clone(&store) as Arc<dyn ResourceStore<Secret>>,
        Arc::clone(&ca),
        Arc::clone(&serving),
        settings(),
    ));
    Harness {
        store,
        serving,
        ca,
        controller,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_expired_serving_certificate_is_replaced() {
    let h = harness();
    let now = Utc::now();

    let ca = CertificateAuthority::new("rotation test CA", Duration::from_secs(365 * 24 * 3600))
        .unwrap();
    let expired = ca
        .issue_server_cert_pem_with_window(
            &[DNS_NAME.to_string()],
            &[],
            now - ChronoDuration::days(60),
            now - ChronoDuration::days(1),
        )
        .unwrap();

    let data = BTreeMap::from([
        (CA_CERTIFICATE_KEY.to_string(), ByteString(ca.bundle())),
        (
            CA_PRIVATE_KEY_KEY.to_string(),
            ByteString(ca.private_key_to_pem().to_vec()),
        ),
        (
            TLS_CERTIFICATE_CHAIN_KEY.to_string(),
            ByteString(expired.cert_pem.clone().into_bytes()),
        ),
        (
            TLS_PRIVATE_KEY_KEY.to_string(),
            ByteString(expired.key_pem.as_bytes().to_vec()),
        ),
    ]);
    h.store
        .create(&Secret {
            metadata: ObjectMeta {
                name: Some(SECRET.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..Secret::default()
        })
        .await
        .unwrap();

    // The server was still handing out the expired pair
    h.serving
        .set_cert_key_content(expired.cert_pem.as_bytes(), expired.key_pem.as_bytes())
        .unwrap();
    let before = h.serving.snapshot();

    let started = std::time::Instant::now();
    let report = h.controller.rotate().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.ca, MaterialState::Fresh);
    assert_eq!(report.serving, MaterialState::Stale);
    assert!(report.persisted);

    let after = h.serving.snapshot();
    assert!(after.revision > before.revision);
    let content = after.content.clone().unwrap();
    assert_ne!(content.cert(), expired.cert_pem.as_bytes());

    let info = leaf_info(content.cert()).unwrap();
    assert!(info.not_after > Utc::now());
    assert!(is_signed_by(content.cert(), &ca.bundle()).unwrap());

    // Persisted before propagated: the secret holds what the provider serves
    let secret = h.store.get(SECRET).await.unwrap().unwrap();
    let persisted = &secret.data.unwrap()[TLS_CERTIFICATE_CHAIN_KEY];
    assert_eq!(persisted.0.as_slice(), content.cert());
    assert_eq!(h.ca.current_ca_bundle_content().unwrap(), ca.bundle());
}

#[tokio::test]
async fn test_deleted_secret_is_reminted_by_the_driver() {
    let h = harness();
    let shutdown = CancellationToken::new();
    let config = DriverConfig {
        resync_interval: Duration::from_secs(3600),
        backoff_start: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
        watch_restart_delay: Duration::from_millis(10),
    };
    let driver = Driver::new(Arc::clone(&h.controller), config)
        .with_resync_key(SECRET)
        .with_watch({
            let controller = Arc::clone(&h.controller);
            move || controller.watch_keys()
        });
    let task = tokio::spawn(driver.run(shutdown.clone()));

    let serving = Arc::clone(&h.serving);
    wait_for("initial material", || serving.current_cert_key_content().is_some()).await;
    let first = serving.current_cert_key_content().unwrap();

    h.store.delete(SECRET).await.unwrap();

    let store = Arc::clone(&h.store);
    wait_for("re-minted material", || {
        serving
            .current_cert_key_content()
            .is_some_and(|current| current.cert() != first.cert())
            && !store.snapshot().is_empty()
    })
    .await;

    let secret = h.store.get(SECRET).await.unwrap().unwrap();
    assert_eq!(
        secret.data.unwrap()[TLS_CERTIFICATE_CHAIN_KEY].0.as_slice(),
        serving.current_cert_key_content().unwrap().cert()
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}

fn fast_driver_config() -> DriverConfig {
    DriverConfig {
        resync_interval: Duration::from_secs(3600),
        backoff_start: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
        watch_restart_delay: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn test_ca_rotation_reaches_the_api_service() {
    let h = harness();
    let api_services = Arc::new(MemoryStore::<APIService>::new());
    api_services
        .create(&APIService {
            metadata: ObjectMeta {
                name: Some(API_SERVICE.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(APIServiceSpec::default()),
            status: None,
        })
        .await
        .unwrap();

    let syncer = Arc::new(ApiServiceController::new(
        Arc::clone(&api_services) as Arc<dyn ResourceStore<APIService>>,
        Arc::clone(&h.ca),
        API_SERVICE,
    ));
    let (ca_changed, ca_changes) = mpsc::unbounded_channel();
    h.ca
        .add_listener(Arc::new(TriggerListener::new(API_SERVICE, ca_changed)));

    let shutdown = CancellationToken::new();
    let rotation = Driver::new(Arc::clone(&h.controller), fast_driver_config())
        .with_resync_key(SECRET)
        .with_watch({
            let controller = Arc::clone(&h.controller);
            move || controller.watch_keys()
        });
    let sync = Driver::new(Arc::clone(&syncer), fast_driver_config())
        .with_resync_key(API_SERVICE)
        .with_watch({
            let syncer = Arc::clone(&syncer);
            move || syncer.watch_keys()
        })
        .with_trigger(ca_changes);
    let tasks = [
        tokio::spawn(rotation.run(shutdown.clone())),
        tokio::spawn(sync.run(shutdown.clone())),
    ];

    let published = {
        let api_services = Arc::clone(&api_services);
        move || {
            api_services
                .snapshot()
                .pop()
                .and_then(|s| s.spec)
                .and_then(|spec| spec.ca_bundle)
                .map(|bundle| bundle.0)
        }
    };
    let ca = Arc::clone(&h.ca);
    wait_for("initial CA bundle in the APIService", || {
        published().is_some() && published() == ca.current_ca_bundle_content()
    })
    .await;
    let first = published().unwrap();

    // Losing the secret mints a new CA
    h.store.delete(SECRET).await.unwrap();
    wait_for("rotated CA bundle in the APIService", || {
        published().is_some_and(|bundle| bundle != first)
            && published() == ca.current_ca_bundle_content()
    })
    .await;

    shutdown.cancel();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_store_outage_keeps_serving_previous_material() {
    let h = harness();
    h.controller.rotate().await.unwrap();
    let served = h.serving.current_cert_key_content().unwrap();

    h.store.fail_next_calls(1);
    assert!(h.controller.rotate().await.is_err());
    assert_eq!(
        h.serving.current_cert_key_content().unwrap().cert(),
        served.cert()
    );

    let report = h.controller.rotate().await.unwrap();
    assert!(!report.persisted);
}
