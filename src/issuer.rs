//! # Credential Issuer Status
//!
//! Merges strategy reports from independent controllers into the single
//! `CredentialIssuer` status.
//!
//! Reports are keyed by strategy type and kept in a deterministic order:
//! highest configured weight first, then type name ascending. Writers never
//! lock locally; they fetch, merge, and write with the object's
//! resourceVersion, and redo the whole cycle when the store reports a conflict.

use crate::constants::STATUS_UPDATE_ATTEMPTS;
use crate::crd::{
    CredentialIssuer, CredentialIssuerFrontend, CredentialIssuerKubeConfigInfo,
    CredentialIssuerSpec, CredentialIssuerStatus, CredentialIssuerStrategy,
    IMPERSONATION_PROXY_STRATEGY, KUBE_CLUSTER_SIGNING_CERTIFICATE_STRATEGY,
};
use crate::observability::metrics;
use crate::store::{ResourceStore, StoreError};
use kube::api::ObjectMeta;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Strategy type preferences; unlisted types weigh 0
pub const STRATEGY_WEIGHTS: &[(&str, i32)] = &[
    (KUBE_CLUSTER_SIGNING_CERTIFICATE_STRATEGY, 2),
    (IMPERSONATION_PROXY_STRATEGY, 1),
];

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("CredentialIssuer '{name}' status update still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { name: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of [`update_strategy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The published status already carried this report
    Unchanged,
    Updated,
}

fn weight(strategy_type: &str) -> i32 {
    STRATEGY_WEIGHTS
        .iter()
        .find(|(t, _)| *t == strategy_type)
        .map_or(0, |(_, w)| *w)
}

fn compare_strategies(a: &CredentialIssuerStrategy, b: &CredentialIssuerStrategy) -> Ordering {
    weight(&b.r#type)
        .cmp(&weight(&a.r#type))
        .then_with(|| a.r#type.cmp(&b.r#type))
}

/// Merge one strategy report into a status
///
/// The entry with the same type is overwritten, otherwise the report is
/// appended; the list is then stably re-sorted. A TokenCredentialRequestAPI
/// frontend is mirrored into `kubeConfigInfo`, which other merges leave alone.
pub fn merge_strategy(
    existing: &CredentialIssuerStatus,
    strategy: &CredentialIssuerStrategy,
) -> CredentialIssuerStatus {
    let mut status = existing.clone();

    match status
        .strategies
        .iter_mut()
        .find(|s| s.r#type == strategy.r#type)
    {
        Some(slot) => *slot = strategy.clone(),
        None => status.strategies.push(strategy.clone()),
    }
    status.strategies.sort_by(compare_strategies);

    if let Some(CredentialIssuerFrontend::TokenCredentialRequestApi {
        token_credential_request_info: info,
    }) = &strategy.frontend
    {
        status.kube_config_info = Some(CredentialIssuerKubeConfigInfo {
            server: info.server.clone(),
            certificate_authority_data: info.certificate_authority_data.clone(),
        });
    }

    status
}

/// Publish `strategy` into the named CredentialIssuer, creating it with `labels` if missing
///
/// A report that differs from the published one only in `lastUpdateTime` is
/// not written.
pub async fn update_strategy(
    store: &dyn ResourceStore<CredentialIssuer>,
    name: &str,
    labels: &BTreeMap<String, String>,
    strategy: &CredentialIssuerStrategy,
) -> Result<StatusUpdate, StatusError> {
    for attempt in 1..=STATUS_UPDATE_ATTEMPTS {
        let mut issuer = match store.get(name).await? {
            Some(issuer) => issuer,
            None => {
                let fresh = CredentialIssuer {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        labels: Some(labels.clone()),
                        ..ObjectMeta::default()
                    },
                    spec: CredentialIssuerSpec::default(),
                    status: None,
                };
                match store.create(&fresh).await {
                    Ok(created) => {
                        info!(credential_issuer = %name, "created CredentialIssuer");
                        created
                    }
                    Err(StoreError::AlreadyExists { .. }) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let current = issuer.status.clone().unwrap_or_default();
        let effective = current
            .strategies
            .iter()
            .find(|s| s.same_report(strategy))
            .unwrap_or(strategy);
        let merged = merge_strategy(&current, effective);
        if merged == current {
            debug!(credential_issuer = %name, strategy = %strategy.r#type, "strategy unchanged");
            return Ok(StatusUpdate::Unchanged);
        }

        issuer.status = Some(merged);
        match store.update_status(&issuer).await {
            Ok(_) => {
                info!(
                    credential_issuer = %name,
                    strategy = %strategy.r#type,
                    status = ?strategy.status,
                    reason = %strategy.reason,
                    "published strategy"
                );
                return Ok(StatusUpdate::Updated);
            }
            Err(StoreError::Conflict { .. }) => {
                metrics::increment_status_write_conflicts();
                debug!(credential_issuer = %name, attempt, "status write conflicted, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(StatusError::ConflictRetriesExhausted {
        name: name.to_string(),
        attempts: STATUS_UPDATE_ATTEMPTS,
    })
}
