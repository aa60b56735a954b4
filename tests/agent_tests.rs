//! # Agent Integration Tests
//!
//! Agent controller convergence against the in-memory store.

use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, Pod, PodSpec, PodStatus, Toleration, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use trust_controller::controller::agent::{PassReport, WatchedFields};
use trust_controller::controller::{AgentController, AgentSettings};
use trust_controller::crd::CredentialIssuer;
use trust_controller::dynamic_cert::DynamicCertProvider;
use trust_controller::runtime::SteadyState;
use trust_controller::store::{MemoryStore, ResourceStore, Selector};

const REFERENCES: usize = 3;

struct Harness {
    references: Arc<MemoryStore<Pod>>,
    agents: Arc<MemoryStore<Pod>>,
    controller: AgentController,
}

fn harness() -> Harness {
    let references = Arc::new(MemoryStore::<Pod>::namespaced("kube-system"));
    let agents = Arc::new(MemoryStore::<Pod>::namespaced("trust"));
    let issuers = Arc::new(MemoryStore::<CredentialIssuer>::new());
    let settings = AgentSettings {
        image: "registry.example/agent:1".to_string(),
        name_prefix: "kube-cert-agent-".to_string(),
        reference_selector: Selector::from([(
            "component".to_string(),
            "kube-controller-manager".to_string(),
        )]),
        credential_issuer_name: "trust-controller-config".to_string(),
        labels: BTreeMap::new(),
        discovery_url: None,
        max_unready: Duration::from_secs(60),
    };
    let controller = AgentController::new(
        Arc::clone(&references) as Arc<dyn ResourceStore<Pod>>,
        Arc::clone(&agents) as Arc<dyn ResourceStore<Pod>>,
        issuers as Arc<dyn ResourceStore<CredentialIssuer>>,
        Arc::new(DynamicCertProvider::new_ca("ca")),
        settings,
    );
    Harness {
        references,
        agents,
        controller,
    }
}

/// Control-plane pods that differ only in name
fn reference_pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                "component".to_string(),
                "kube-controller-manager".to_string(),
            )])),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "kube-controller-manager".to_string(),
                image: Some("registry.k8s.io/kube-controller-manager:v1.30.0".to_string()),
                volume_mounts: Some(vec![VolumeMount {
                    name: "k8s-certs".to_string(),
                    mount_path: "/etc/kubernetes/pki".to_string(),
                    read_only: Some(true),
                    ..VolumeMount::default()
                }]),
                ..Container::default()
            }],
            volumes: Some(vec![Volume {
                name: "k8s-certs".to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: "/etc/kubernetes/pki".to_string(),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Volume::default()
            }]),
            node_selector: Some(BTreeMap::from([(
                "node-role.kubernetes.io/control-plane".to_string(),
                String::new(),
            )])),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                effect: Some("NoExecute".to_string()),
                ..Toleration::default()
            }]),
            ..PodSpec::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..PodStatus::default()
        }),
    }
}

/// Run passes until `required` consecutive passes took no action
async fn converge(controller: &AgentController, required: u32) -> Vec<PassReport> {
    let mut steady = SteadyState::new(required);
    let mut reports = Vec::new();
    for _ in 0..20 {
        let report = controller.reconcile_pass().await.unwrap();
        let actions = report.actions();
        reports.push(report);
        if steady.observe(actions) {
            return reports;
        }
    }
    panic!("agent pods did not converge: {reports:?}");
}

#[tokio::test]
async fn test_toleration_drift_replaces_exactly_one_pod() {
    let h = harness();
    for i in 0..REFERENCES {
        h.references
            .create(&reference_pod(&format!("kube-controller-manager-{i}")))
            .await
            .unwrap();
    }

    let reports = converge(&h.controller, 3).await;
    assert_eq!(reports[0].created.len(), REFERENCES);
    let original: BTreeMap<String, String> = h
        .agents
        .snapshot()
        .iter()
        .map(|pod| (pod.name_any(), pod.uid().unwrap()))
        .collect();
    assert_eq!(original.len(), REFERENCES);

    // Someone adds a toleration to one agent pod
    let mut drifted = h.agents.snapshot().remove(1);
    let drifted_name = drifted.name_any();
    drifted
        .spec
        .as_mut()
        .unwrap()
        .tolerations
        .get_or_insert_with(Vec::new)
        .push(Toleration {
            key: Some("example.com/maintenance".to_string()),
            operator: Some("Exists".to_string()),
            ..Toleration::default()
        });
    h.agents.update(&drifted).await.unwrap();

    let reports = converge(&h.controller, 3).await;
    let deleted: Vec<String> = reports.iter().flat_map(|r| r.deleted.clone()).collect();
    let created: Vec<String> = reports.iter().flat_map(|r| r.created.clone()).collect();
    assert_eq!(deleted, vec![drifted_name.clone()]);
    assert_eq!(created, vec![drifted_name.clone()]);

    let agents = h.agents.snapshot();
    assert_eq!(agents.len(), REFERENCES);
    for pod in &agents {
        let name = pod.name_any();
        let uid = pod.uid().unwrap();
        if name == drifted_name {
            assert_ne!(original[&name], uid, "drifted pod was not replaced");
        } else {
            assert_eq!(original[&name], uid, "{name} should not have been touched");
        }
    }

    let fields: Vec<WatchedFields> = agents.iter().map(WatchedFields::of).collect();
    assert!(fields.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(fields[0].tolerations.len(), 1);
}

#[tokio::test]
async fn test_reference_change_rolls_agent() {
    let h = harness();
    let reference = h
        .references
        .create(&reference_pod("kube-controller-manager-0"))
        .await
        .unwrap();
    converge(&h.controller, 3).await;

    let mut moved = reference.clone();
    moved.spec.as_mut().unwrap().node_name = Some("control-plane-2".to_string());
    h.references.update(&moved).await.unwrap();

    converge(&h.controller, 3).await;
    let agents = h.agents.snapshot();
    assert_eq!(agents.len(), 1);
    assert_eq!(
        agents[0].spec.as_ref().unwrap().node_name.as_deref(),
        Some("control-plane-2")
    );
}
