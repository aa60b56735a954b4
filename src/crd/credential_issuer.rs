//! # CredentialIssuer
//!
//! Cluster-scoped resource whose status publishes how clients can exchange
//! credentials with the gateway. Several controllers each own one strategy
//! entry; the entries are merged by [`crate::issuer`].

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Strategy backed by agent pods with access to the cluster signing key (most preferred)
pub const KUBE_CLUSTER_SIGNING_CERTIFICATE_STRATEGY: &str = "KubeClusterSigningCertificate";

/// Strategy backed by the impersonation proxy
pub const IMPERSONATION_PROXY_STRATEGY: &str = "ImpersonationProxy";

/// Agent pods are converged with their reference pods
pub const REASON_AGENT_PODS_READY: &str = "AgentPodsReady";

/// No running reference pod was found to derive agent pods from
pub const REASON_NO_REFERENCE_PODS: &str = "NoReferencePods";

/// Store requests kept failing for longer than the allowed unready period
pub const REASON_STORE_UNAVAILABLE: &str = "StoreUnavailable";

/// The cluster rejected the controller's credentials or RBAC permissions
pub const REASON_STORE_FORBIDDEN: &str = "StoreForbidden";

/// A store request failed for a reason other than an outage or a denial
pub const REASON_STORE_ERROR: &str = "StoreError";

/// CredentialIssuer Custom Resource Definition
///
/// The spec is intentionally empty; everything of interest lives in the status.
///
/// # Example
///
/// ```yaml
/// apiVersion: config.trust-controller.dev/v1alpha1
/// kind: CredentialIssuer
/// metadata:
///   name: trust-controller-config
/// status:
///   strategies:
///     - type: KubeClusterSigningCertificate
///       status: Success
///       reason: AgentPodsReady
///       message: 3 agent pods are ready
///       lastUpdateTime: "2026-01-01T00:00:00Z"
///       frontend:
///         type: TokenCredentialRequestAPI
///         tokenCredentialRequestInfo:
///           server: https://gateway.example.com
///           certificateAuthorityData: LS0tLS1CRUdJTi...
/// ```
#[allow(
    clippy::empty_structs_with_brackets,
    reason = "the CustomResource derive requires a braced spec struct"
)]
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "CredentialIssuer",
    group = "config.trust-controller.dev",
    version = "v1alpha1",
    status = "CredentialIssuerStatus",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CredentialIssuerSpec {}

/// Published status: one entry per strategy type plus the deprecated kubeconfig mirror
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialIssuerStatus {
    /// Strategy reports, ordered by preference
    #[serde(default)]
    pub strategies: Vec<CredentialIssuerStrategy>,
    /// Deprecated: mirror of the last TokenCredentialRequestAPI frontend that was merged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config_info: Option<CredentialIssuerKubeConfigInfo>,
}

/// One strategy report
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialIssuerStrategy {
    /// Strategy type, e.g. `KubeClusterSigningCertificate`
    pub r#type: String,
    pub status: StrategyStatus,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable explanation
    pub message: String,
    /// RFC3339 timestamp of the report
    pub last_update_time: String,
    /// How clients reach this strategy, when it is usable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend: Option<CredentialIssuerFrontend>,
}

impl CredentialIssuerStrategy {
    /// Same report apart from its timestamp
    pub fn same_report(&self, other: &Self) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.frontend == other.frontend
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum StrategyStatus {
    Success,
    Error,
}

/// Client-facing entry point of a strategy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type")]
pub enum CredentialIssuerFrontend {
    #[serde(rename = "TokenCredentialRequestAPI", rename_all = "camelCase")]
    TokenCredentialRequestApi {
        token_credential_request_info: TokenCredentialRequestApiInfo,
    },
    #[serde(rename = "ImpersonationProxy", rename_all = "camelCase")]
    ImpersonationProxy {
        impersonation_proxy_info: ImpersonationProxyInfo,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenCredentialRequestApiInfo {
    /// Kubernetes API server URL clients should talk to
    pub server: String,
    /// Base64-encoded PEM CA bundle for `server`
    pub certificate_authority_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImpersonationProxyInfo {
    /// HTTPS endpoint of the impersonation proxy
    pub endpoint: String,
    /// Base64-encoded PEM CA bundle for `endpoint`
    pub certificate_authority_data: String,
}

/// Deprecated single-strategy summary kept for older kubeconfig tooling
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialIssuerKubeConfigInfo {
    pub server: String,
    pub certificate_authority_data: String,
}
