//! # Custom Resource Definitions
//!
//! CRD types for the Trust Controller.
//!
//! ## Module Structure
//!
//! - `credential_issuer.rs` - `CredentialIssuer` resource and its published status

mod credential_issuer;

// Re-export all public types
pub use credential_issuer::{
    CredentialIssuer, CredentialIssuerFrontend, CredentialIssuerKubeConfigInfo,
    CredentialIssuerSpec, CredentialIssuerStatus, CredentialIssuerStrategy, ImpersonationProxyInfo,
    StrategyStatus, TokenCredentialRequestApiInfo, IMPERSONATION_PROXY_STRATEGY,
    KUBE_CLUSTER_SIGNING_CERTIFICATE_STRATEGY, REASON_AGENT_PODS_READY, REASON_NO_REFERENCE_PODS,
    REASON_STORE_ERROR, REASON_STORE_FORBIDDEN, REASON_STORE_UNAVAILABLE,
};
