//! # Agent Controller
//!
//! Keeps one agent pod per running reference (control-plane) pod. An agent pod
//! copies only what it needs to reach the reference pod's privileged material:
//! node binding, node selector, tolerations, volumes, and the first container's
//! volume mounts. It runs its own image and command.
//!
//! Pods cannot be edited in place, so an agent whose watched fields drift from
//! its reference is deleted; the creation path of the following pass replaces
//! it. After every pass the result is published as the
//! `KubeClusterSigningCertificate` strategy of the CredentialIssuer.

use crate::config::ControllerConfig;
use crate::constants::{
    AGENT_COMMAND, AGENT_LABEL_KEY, AGENT_LABEL_VALUE, AGENT_REFERENCE_NAME_ANNOTATION,
    AGENT_REFERENCE_UID_ANNOTATION,
};
use crate::crd::{
    CredentialIssuer, CredentialIssuerFrontend, CredentialIssuerStrategy, StrategyStatus,
    TokenCredentialRequestApiInfo, KUBE_CLUSTER_SIGNING_CERTIFICATE_STRATEGY,
    REASON_AGENT_PODS_READY, REASON_NO_REFERENCE_PODS, REASON_STORE_ERROR,
    REASON_STORE_FORBIDDEN, REASON_STORE_UNAVAILABLE,
};
use crate::dynamic_cert::DynamicCertProvider;
use crate::issuer::{self, StatusError};
use crate::observability::metrics;
use crate::runtime::{Outcome, Reconcile};
use crate::store::{parse_selector, ResourceStore, Selector, StoreError};
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    Container, Pod, PodSecurityContext, PodSpec, Toleration, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const AGENT_CONTROLLER: &str = "kube-cert-agent";

/// The single key this controller reconciles
pub const AGENT_KEY: &str = "kube-cert-agent";

const AGENT_CONTAINER_NAME: &str = "sleeper";

/// Requeue after a pass that changed something, so the follow-up pass runs soon
const CONVERGE_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue while agent pods exist but none has reached the Running phase
const PENDING_REQUEUE: Duration = Duration::from_secs(5);

/// Tolerations the API server adds to every pod on admission
const ADMISSION_TOLERATION_KEYS: &[&str] =
    &["node.kubernetes.io/not-ready", "node.kubernetes.io/unreachable"];

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Status(#[from] StatusError),
}

/// Settings of the agent controller, derived from [`ControllerConfig`]
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub image: String,
    pub name_prefix: String,
    pub reference_selector: Selector,
    pub credential_issuer_name: String,
    pub labels: BTreeMap<String, String>,
    pub discovery_url: Option<String>,
    pub max_unready: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &ControllerConfig) -> Result<Self, StoreError> {
        Ok(Self {
            image: config.agent_image.clone(),
            name_prefix: config.agent_name_prefix.clone(),
            reference_selector: parse_selector(&config.agent_reference_selector)?,
            credential_issuer_name: config.credential_issuer_name.clone(),
            labels: config.labels(),
            discovery_url: config.discovery_url.clone(),
            max_unready: config.max_unready(),
        })
    }

    fn agent_selector() -> Selector {
        Selector::from([(AGENT_LABEL_KEY.to_string(), AGENT_LABEL_VALUE.to_string())])
    }
}

/// Corrective actions of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Running reference pods seen
    pub reference_pods: usize,
    /// Agent pods seen, healthy or not
    pub agent_pods: usize,
    /// Agent pods kept by this pass that are in the Running phase
    pub running_agents: usize,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    /// Agent pods already terminating, waiting to be replaced
    pub pending: usize,
}

impl PassReport {
    pub fn actions(&self) -> usize {
        self.created.len() + self.deleted.len() + self.pending
    }
}

/// The part of an agent pod that must track its reference pod
#[derive(Debug, Clone, PartialEq)]
pub struct WatchedFields {
    pub node_name: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub volumes: Vec<Volume>,
    pub volume_mounts: Vec<VolumeMount>,
    pub image: Option<String>,
    pub command: Vec<String>,
}

impl WatchedFields {
    pub fn of(pod: &Pod) -> Self {
        let spec = pod.spec.clone().unwrap_or_default();
        let container = spec.containers.first().cloned().unwrap_or_default();
        Self {
            node_name: spec.node_name,
            node_selector: spec.node_selector.unwrap_or_default(),
            tolerations: spec
                .tolerations
                .unwrap_or_default()
                .into_iter()
                .filter(|t| !is_admission_toleration(t))
                .collect(),
            volumes: spec.volumes.unwrap_or_default(),
            volume_mounts: container.volume_mounts.unwrap_or_default(),
            image: container.image,
            command: container.command.unwrap_or_default(),
        }
    }
}

fn is_admission_toleration(toleration: &Toleration) -> bool {
    toleration.toleration_seconds.is_some()
        && toleration.effect.as_deref() == Some("NoExecute")
        && toleration
            .key
            .as_deref()
            .is_some_and(|key| ADMISSION_TOLERATION_KEYS.contains(&key))
}

fn is_running(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            == Some("Running")
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

/// Deterministic agent pod name for the reference pod with `uid`
pub fn agent_pod_name(prefix: &str, uid: &str) -> String {
    let digest = Sha256::digest(uid.as_bytes());
    let suffix: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{prefix}{suffix}")
}

/// Maintains agent pods and publishes the signing-certificate strategy
pub struct AgentController {
    reference_pods: Arc<dyn ResourceStore<Pod>>,
    agent_pods: Arc<dyn ResourceStore<Pod>>,
    issuers: Arc<dyn ResourceStore<CredentialIssuer>>,
    ca_provider: Arc<DynamicCertProvider>,
    settings: AgentSettings,
    unready_since: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for AgentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentController")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AgentController {
    pub fn new(
        reference_pods: Arc<dyn ResourceStore<Pod>>,
        agent_pods: Arc<dyn ResourceStore<Pod>>,
        issuers: Arc<dyn ResourceStore<CredentialIssuer>>,
        ca_provider: Arc<DynamicCertProvider>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            reference_pods,
            agent_pods,
            issuers,
            ca_provider,
            settings,
            unready_since: Mutex::new(None),
        }
    }

    /// Keys for the driver from changes to reference pods
    pub fn watch_reference_keys(&self) -> BoxStream<'static, String> {
        self.reference_pods
            .watch(&self.settings.reference_selector)
            .map(|_| AGENT_KEY.to_string())
            .boxed()
    }

    /// Keys for the driver from changes to agent pods
    pub fn watch_agent_keys(&self) -> BoxStream<'static, String> {
        self.agent_pods
            .watch(&AgentSettings::agent_selector())
            .map(|_| AGENT_KEY.to_string())
            .boxed()
    }

    /// Desired agent pod for `reference`; `None` when the reference has no uid yet
    pub fn desired_pod(&self, reference: &Pod) -> Option<Pod> {
        let uid = reference.metadata.uid.as_deref()?;
        let spec = reference.spec.clone().unwrap_or_default();
        let volume_mounts = spec
            .containers
            .first()
            .and_then(|c| c.volume_mounts.clone());

        let mut labels = self.settings.labels.clone();
        labels.insert(AGENT_LABEL_KEY.to_string(), AGENT_LABEL_VALUE.to_string());

        Some(Pod {
            metadata: ObjectMeta {
                name: Some(agent_pod_name(&self.settings.name_prefix, uid)),
                labels: Some(labels),
                annotations: Some(BTreeMap::from([
                    (
                        AGENT_REFERENCE_NAME_ANNOTATION.to_string(),
                        reference.name_any(),
                    ),
                    (AGENT_REFERENCE_UID_ANNOTATION.to_string(), uid.to_string()),
                ])),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: AGENT_CONTAINER_NAME.to_string(),
                    image: Some(self.settings.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    command: Some(AGENT_COMMAND.iter().map(ToString::to_string).collect()),
                    volume_mounts,
                    ..Container::default()
                }],
                volumes: spec.volumes,
                node_name: spec.node_name,
                node_selector: spec.node_selector,
                tolerations: spec.tolerations,
                restart_policy: Some("Never".to_string()),
                termination_grace_period_seconds: Some(0),
                automount_service_account_token: Some(false),
                security_context: Some(PodSecurityContext {
                    run_as_user: Some(0),
                    run_as_group: Some(0),
                    ..PodSecurityContext::default()
                }),
                ..PodSpec::default()
            }),
            ..Pod::default()
        })
    }

    /// One pass: delete unhealthy, orphaned, or drifted agents, then create missing ones
    pub async fn reconcile_pass(&self) -> Result<PassReport, StoreError> {
        let references: Vec<Pod> = self
            .reference_pods
            .list(&self.settings.reference_selector)
            .await?
            .into_iter()
            .filter(is_running)
            .collect();
        let agents = self
            .agent_pods
            .list(&AgentSettings::agent_selector())
            .await?;

        let desired: HashMap<String, Pod> = references
            .iter()
            .filter_map(|reference| {
                let pod = self.desired_pod(reference);
                if pod.is_none() {
                    debug!(pod = %reference.name_any(), "reference pod has no uid yet");
                }
                pod
            })
            .filter_map(|pod| {
                let uid = pod.annotations().get(AGENT_REFERENCE_UID_ANNOTATION)?.clone();
                Some((uid, pod))
            })
            .collect();

        let mut report = PassReport {
            reference_pods: references.len(),
            agent_pods: agents.len(),
            ..PassReport::default()
        };
        let mut present = HashSet::new();

        for agent in &agents {
            let name = agent.name_any();
            present.insert(name.clone());
            if agent.metadata.deletion_timestamp.is_some() {
                report.pending += 1;
                continue;
            }

            let reason = if is_terminated(agent) {
                Some("terminated")
            } else {
                match agent
                    .annotations()
                    .get(AGENT_REFERENCE_UID_ANNOTATION)
                    .and_then(|uid| desired.get(uid))
                {
                    None => Some("orphaned"),
                    Some(want) if WatchedFields::of(agent) != WatchedFields::of(want) => {
                        Some("drifted")
                    }
                    Some(_) => None,
                }
            };

            if let Some(reason) = reason {
                match self.agent_pods.delete(&name).await {
                    Ok(()) | Err(StoreError::NotFound { .. }) => {
                        info!(pod = %name, reason, "deleted agent pod");
                        report.deleted.push(name);
                    }
                    Err(e) => return Err(e),
                }
            } else if is_running(agent) {
                report.running_agents += 1;
            }
        }

        for pod in desired.values() {
            let name = pod.name_any();
            if present.contains(&name) {
                continue;
            }
            match self.agent_pods.create(pod).await {
                Ok(_) => {
                    info!(pod = %name, "created agent pod");
                    report.created.push(name);
                }
                Err(StoreError::AlreadyExists { .. }) => {
                    debug!(pod = %name, "agent pod already exists");
                }
                Err(e) => return Err(e),
            }
        }

        report.created.sort();
        report.deleted.sort();
        metrics::increment_agent_pods_created(report.created.len() as u64);
        metrics::increment_agent_pods_deleted(report.deleted.len() as u64);
        Ok(report)
    }

    fn strategy(
        &self,
        status: StrategyStatus,
        reason: &str,
        message: String,
        frontend: Option<CredentialIssuerFrontend>,
    ) -> CredentialIssuerStrategy {
        CredentialIssuerStrategy {
            r#type: KUBE_CLUSTER_SIGNING_CERTIFICATE_STRATEGY.to_string(),
            status,
            reason: reason.to_string(),
            message,
            last_update_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            frontend,
        }
    }

    fn frontend(&self) -> Option<CredentialIssuerFrontend> {
        let server = self.settings.discovery_url.clone()?;
        let bundle = self.ca_provider.current_ca_bundle_content()?;
        Some(CredentialIssuerFrontend::TokenCredentialRequestApi {
            token_credential_request_info: TokenCredentialRequestApiInfo {
                server,
                certificate_authority_data: base64::engine::general_purpose::STANDARD
                    .encode(bundle),
            },
        })
    }

    async fn publish(&self, strategy: CredentialIssuerStrategy) -> Result<(), StatusError> {
        issuer::update_strategy(
            self.issuers.as_ref(),
            &self.settings.credential_issuer_name,
            &self.settings.labels,
            &strategy,
        )
        .await
        .map(|_| ())
    }

    fn mark_ready(&self) {
        *self
            .unready_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// How long store failures have lasted, starting the clock on the first one
    fn unready_for(&self) -> Duration {
        let mut since = self
            .unready_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        since.get_or_insert_with(Instant::now).elapsed()
    }

    /// Outages are tolerated for `max_unready`; denials and other failures are
    /// published right away with their own reason
    async fn publish_store_failure(&self, e: &StoreError) {
        let (reason, message) = match e {
            StoreError::Unavailable(_) => {
                let unready = self.unready_for();
                if unready < self.settings.max_unready {
                    debug!(error = %e, unready = ?unready, "store unavailable, within the allowed period");
                    return;
                }
                warn!(error = %e, unready = ?unready, "store unavailable past the allowed period");
                (
                    REASON_STORE_UNAVAILABLE,
                    format!("could not reach the cluster: {e}"),
                )
            }
            StoreError::Forbidden(_) => {
                warn!(error = %e, "store request denied");
                (
                    REASON_STORE_FORBIDDEN,
                    format!("the cluster denied the request: {e}"),
                )
            }
            _ => {
                warn!(error = %e, "store request failed");
                (REASON_STORE_ERROR, format!("store request failed: {e}"))
            }
        };
        let strategy = self.strategy(StrategyStatus::Error, reason, message, None);
        if let Err(publish_error) = self.publish(strategy).await {
            error!(error = %publish_error, "failed to publish store failure");
        }
    }
}

#[async_trait::async_trait]
impl Reconcile for AgentController {
    type Error = AgentError;

    fn name(&self) -> &'static str {
        AGENT_CONTROLLER
    }

    async fn reconcile(&self, _key: &str) -> Result<Outcome, AgentError> {
        let report = match self.reconcile_pass().await {
            Ok(report) => {
                self.mark_ready();
                report
            }
            Err(e) => {
                self.publish_store_failure(&e).await;
                return Err(e.into());
            }
        };

        if report.reference_pods == 0 {
            let selector = crate::store::selector_string(&self.settings.reference_selector);
            self.publish(self.strategy(
                StrategyStatus::Error,
                REASON_NO_REFERENCE_PODS,
                format!("could not find a running pod matching selector \"{selector}\""),
                None,
            ))
            .await?;
            // Leftover agents were deleted as orphans above
            return Ok(Outcome::Done);
        }

        if report.actions() > 0 {
            debug!(
                created = report.created.len(),
                deleted = report.deleted.len(),
                pending = report.pending,
                "agent pods not converged yet"
            );
            return Ok(Outcome::RequeueAfter(CONVERGE_REQUEUE));
        }

        if report.running_agents == 0 {
            debug!(
                agent_pods = report.agent_pods,
                "no agent pod is running yet"
            );
            return Ok(Outcome::RequeueAfter(PENDING_REQUEUE));
        }

        self.publish(self.strategy(
            StrategyStatus::Success,
            REASON_AGENT_PODS_READY,
            format!("{} agent pods are ready", report.running_agents),
            self.frontend(),
        ))
        .await?;
        Ok(Outcome::Done)
    }
}
