//! # Rotation Controller
//!
//! Keeps the persisted CA and serving certificate valid and mirrors them into
//! the two trust material providers.
//!
//! Both items go through the same decision on every pass:
//!
//! | State | Meaning | Action |
//! |---|---|---|
//! | Missing | no data in the secret | mint |
//! | Invalid | unparsable, key mismatch, not yet valid, or (serving) not signed by the CA | mint |
//! | Stale | now is within the renew-before window of `notAfter` | mint |
//! | Fresh | usable | none |
//!
//! Minting the CA always mints a new serving certificate. Newly minted
//! material is written to the secret first; the providers are updated only
//! after that write succeeded.

use crate::certauthority::{self, CaError, CertificateAuthority, CertificateInfo, Clock};
use crate::config::ControllerConfig;
use crate::constants::{
    CA_CERTIFICATE_KEY, CA_PRIVATE_KEY_KEY, TLS_CERTIFICATE_CHAIN_KEY, TLS_PRIVATE_KEY_KEY,
};
use crate::dynamic_cert::{CertKeyError, DynamicCertProvider};
use crate::observability::metrics;
use crate::runtime::{Outcome, Reconcile};
use crate::store::{ResourceStore, StoreError, WatchEvent};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const ROTATION_CONTROLLER: &str = "certs-rotation";

const ITEM_CA: &str = "ca";
const ITEM_SERVING: &str = "serving";

/// Shortest requeue, so an already-stale item is not re-minted in a tight loop
const MIN_REQUEUE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RotationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("minting {item} failed: {source}")]
    Mint {
        item: &'static str,
        #[source]
        source: CaError,
    },

    #[error("provider rejected {item}: {source}")]
    Provider {
        item: &'static str,
        #[source]
        source: CertKeyError,
    },
}

/// Condition of one persisted item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialState {
    Missing,
    Invalid,
    Stale,
    Fresh,
}

impl MaterialState {
    pub fn needs_mint(self) -> bool {
        self != Self::Fresh
    }
}

/// Outcome of one rotation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub ca: MaterialState,
    pub serving: MaterialState,
    /// Whether new material was written to the secret
    pub persisted: bool,
    /// Earliest time either item enters its renew-before window
    pub next_renewal: Option<DateTime<Utc>>,
}

/// Settings of the rotation controller, derived from [`ControllerConfig`]
#[derive(Debug, Clone)]
pub struct RotationSettings {
    pub secret_name: String,
    pub labels: BTreeMap<String, String>,
    pub ca_common_name: String,
    pub ca_duration: Duration,
    pub serving_duration: Duration,
    pub renew_before: Duration,
    pub dns_names: Vec<String>,
    pub ip_addrs: Vec<IpAddr>,
}

impl From<&ControllerConfig> for RotationSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            secret_name: config.serving_cert_secret_name.clone(),
            labels: config.labels(),
            ca_common_name: config.ca_common_name.clone(),
            ca_duration: config.ca_duration(),
            serving_duration: config.serving_cert_duration(),
            renew_before: config.serving_cert_renew_before(),
            dns_names: config.serving_dns_names(),
            ip_addrs: Vec::new(),
        }
    }
}

/// Decide what to do with one certificate/key pair
///
/// `signer` is the CA bundle the certificate must chain to, if any.
pub fn evaluate(
    cert: Option<&[u8]>,
    key: Option<&[u8]>,
    signer: Option<&[u8]>,
    now: DateTime<Utc>,
    renew_before: Duration,
) -> (MaterialState, Option<CertificateInfo>) {
    let (Some(cert), Some(key)) = (cert, key) else {
        return (MaterialState::Missing, None);
    };
    if cert.is_empty() || key.is_empty() {
        return (MaterialState::Missing, None);
    }

    let info = match certauthority::validate_cert_key(cert, key) {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "persisted certificate rejected");
            return (MaterialState::Invalid, None);
        }
    };
    if now < info.not_before {
        warn!(not_before = %info.not_before, "persisted certificate not yet valid");
        return (MaterialState::Invalid, Some(info));
    }
    if let Some(signer) = signer {
        match certauthority::is_signed_by(cert, signer) {
            Ok(true) => {}
            Ok(false) => {
                warn!("persisted certificate is not signed by the current CA");
                return (MaterialState::Invalid, Some(info));
            }
            Err(e) => {
                warn!(error = %e, "persisted certificate could not be checked against the CA");
                return (MaterialState::Invalid, Some(info));
            }
        }
    }

    if renewal_time(&info, renew_before) <= now {
        (MaterialState::Stale, Some(info))
    } else {
        (MaterialState::Fresh, Some(info))
    }
}

fn renewal_time(info: &CertificateInfo, renew_before: Duration) -> DateTime<Utc> {
    let window = chrono::Duration::from_std(renew_before).unwrap_or(chrono::Duration::MAX);
    info.not_after
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn data_value<'a>(data: Option<&'a BTreeMap<String, ByteString>>, key: &str) -> Option<&'a [u8]> {
    data.and_then(|d| d.get(key)).map(|v| v.0.as_slice())
}

/// Mints, persists, and propagates the CA and serving certificate
pub struct RotationController {
    store: Arc<dyn ResourceStore<Secret>>,
    ca_provider: Arc<DynamicCertProvider>,
    serving_provider: Arc<DynamicCertProvider>,
    settings: RotationSettings,
    clock: Clock,
}

impl std::fmt::Debug for RotationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationController")
            .field("settings", &self.settings)
            .field("ca_provider", &self.ca_provider)
            .field("serving_provider", &self.serving_provider)
            .finish_non_exhaustive()
    }
}

impl RotationController {
    pub fn new(
        store: Arc<dyn ResourceStore<Secret>>,
        ca_provider: Arc<DynamicCertProvider>,
        serving_provider: Arc<DynamicCertProvider>,
        settings: RotationSettings,
    ) -> Self {
        Self::with_clock(
            store,
            ca_provider,
            serving_provider,
            settings,
            Arc::new(Utc::now),
        )
    }

    pub fn with_clock(
        store: Arc<dyn ResourceStore<Secret>>,
        ca_provider: Arc<DynamicCertProvider>,
        serving_provider: Arc<DynamicCertProvider>,
        settings: RotationSettings,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            ca_provider,
            serving_provider,
            settings,
            clock,
        }
    }

    pub fn secret_name(&self) -> &str {
        &self.settings.secret_name
    }

    /// Keys for the driver: the secret name on every change to the managed secret
    pub fn watch_keys(&self) -> BoxStream<'static, String> {
        let name = self.settings.secret_name.clone();
        self.store
            .watch_named(&name)
            .filter_map(move |event| {
                let key = match &event {
                    WatchEvent::Applied(secret) | WatchEvent::Deleted(secret) => {
                        (secret.name_any() == name).then(|| name.clone())
                    }
                    WatchEvent::Restarted => Some(name.clone()),
                };
                futures::future::ready(key)
            })
            .boxed()
    }

    /// One pass of the state machine
    pub async fn rotate(&self) -> Result<RotationReport, RotationError> {
        let now = (self.clock)();
        let renew_before = self.settings.renew_before;
        let existing = self.store.get(&self.settings.secret_name).await?;
        let data = existing.as_ref().and_then(|s| s.data.as_ref());

        let ca_cert = data_value(data, CA_CERTIFICATE_KEY);
        let ca_key = data_value(data, CA_PRIVATE_KEY_KEY);
        let (ca_state, ca_info) = evaluate(ca_cert, ca_key, None, now, renew_before);

        let (ca, ca_minted) = match (ca_state, ca_cert, ca_key) {
            (MaterialState::Fresh, Some(cert), Some(key)) => {
                let ca = CertificateAuthority::load_with_clock(cert, key, Arc::clone(&self.clock))
                    .map_err(|source| RotationError::Mint {
                        item: ITEM_CA,
                        source,
                    })?;
                (ca, false)
            }
            _ => {
                info!(secret = %self.settings.secret_name, state = ?ca_state, "minting new CA");
                let ca = CertificateAuthority::new_with_clock(
                    &self.settings.ca_common_name,
                    self.settings.ca_duration,
                    Arc::clone(&self.clock),
                )
                .map_err(|source| RotationError::Mint {
                    item: ITEM_CA,
                    source,
                })?;
                (ca, true)
            }
        };
        let ca_bundle = ca.bundle();
        let ca_key_pem = ca.private_key_to_pem();

        let tls_cert = data_value(data, TLS_CERTIFICATE_CHAIN_KEY);
        let tls_key = data_value(data, TLS_PRIVATE_KEY_KEY);
        let (serving_state, serving_info) = if ca_minted {
            (MaterialState::Invalid, None)
        } else {
            evaluate(tls_cert, tls_key, Some(&ca_bundle), now, renew_before)
        };

        let mut serving_pem: Option<(Vec<u8>, zeroize::Zeroizing<Vec<u8>>)> = None;
        let mut serving_info = serving_info;
        if serving_state.needs_mint() {
            info!(secret = %self.settings.secret_name, state = ?serving_state, "minting new serving certificate");
            let issued = ca
                .issue_server_cert_pem(
                    &self.settings.dns_names,
                    &self.settings.ip_addrs,
                    self.settings.serving_duration,
                )
                .map_err(|source| RotationError::Mint {
                    item: ITEM_SERVING,
                    source,
                })?;
            serving_info = certauthority::leaf_info(issued.cert_pem.as_bytes()).ok();
            serving_pem = Some((
                issued.cert_pem.into_bytes(),
                zeroize::Zeroizing::new(issued.key_pem.as_bytes().to_vec()),
            ));
        }

        let persisted = ca_minted || serving_pem.is_some();
        let (tls_cert, tls_key): (Vec<u8>, zeroize::Zeroizing<Vec<u8>>) = match serving_pem {
            Some(pair) => pair,
            None => (
                tls_cert.unwrap_or_default().to_vec(),
                zeroize::Zeroizing::new(tls_key.unwrap_or_default().to_vec()),
            ),
        };

        if persisted {
            self.persist(existing, &ca_bundle, &ca_key_pem, &tls_cert, &tls_key)
                .await?;
            if ca_minted {
                metrics::increment_certificates_minted(ITEM_CA);
            }
            metrics::increment_certificates_minted(ITEM_SERVING);
        }

        // Only durably recorded material reaches the providers
        sync_provider(&self.ca_provider, ITEM_CA, &ca_bundle, &ca_key_pem)?;
        sync_provider(&self.serving_provider, ITEM_SERVING, &tls_cert, &tls_key)?;

        let ca_info = if ca_minted { ca.info().ok() } else { ca_info };
        let next_renewal = [ca_info, serving_info]
            .iter()
            .flatten()
            .map(|info| renewal_time(info, renew_before))
            .min();

        Ok(RotationReport {
            ca: ca_state,
            serving: serving_state,
            persisted,
            next_renewal,
        })
    }

    async fn persist(
        &self,
        existing: Option<Secret>,
        ca_cert: &[u8],
        ca_key: &[u8],
        tls_cert: &[u8],
        tls_key: &[u8],
    ) -> Result<(), RotationError> {
        let data = BTreeMap::from([
            (CA_CERTIFICATE_KEY.to_string(), ByteString(ca_cert.to_vec())),
            (CA_PRIVATE_KEY_KEY.to_string(), ByteString(ca_key.to_vec())),
            (TLS_CERTIFICATE_CHAIN_KEY.to_string(), ByteString(tls_cert.to_vec())),
            (TLS_PRIVATE_KEY_KEY.to_string(), ByteString(tls_key.to_vec())),
        ]);

        match existing {
            Some(mut secret) => {
                secret.data = Some(data);
                let labels = secret.metadata.labels.get_or_insert_with(BTreeMap::new);
                labels.extend(self.settings.labels.clone());
                self.store.update(&secret).await?;
                info!(secret = %self.settings.secret_name, "updated trust material secret");
            }
            None => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(self.settings.secret_name.clone()),
                        labels: Some(self.settings.labels.clone()),
                        ..ObjectMeta::default()
                    },
                    type_: Some("Opaque".to_string()),
                    data: Some(data),
                    ..Secret::default()
                };
                self.store.create(&secret).await?;
                info!(secret = %self.settings.secret_name, "created trust material secret");
            }
        }
        Ok(())
    }
}

/// Install `cert`/`key` into `provider` unless it already holds exactly them
fn sync_provider(
    provider: &DynamicCertProvider,
    item: &'static str,
    cert: &[u8],
    key: &[u8],
) -> Result<bool, RotationError> {
    if let Some(current) = provider.current_cert_key_content() {
        if current.cert() == cert && current.key() == key {
            return Ok(false);
        }
    }
    provider
        .set_cert_key_content(cert, key)
        .map_err(|source| RotationError::Provider { item, source })?;
    debug!(provider = %provider.name(), "provider updated from persisted material");
    Ok(true)
}

#[async_trait::async_trait]
impl Reconcile for RotationController {
    type Error = RotationError;

    fn name(&self) -> &'static str {
        ROTATION_CONTROLLER
    }

    async fn reconcile(&self, _key: &str) -> Result<Outcome, RotationError> {
        let report = self.rotate().await?;
        debug!(
            ca = ?report.ca,
            serving = ?report.serving,
            persisted = report.persisted,
            "rotation pass complete"
        );

        let now = (self.clock)();
        Ok(match report.next_renewal {
            Some(at) => {
                let wait = (at - now).to_std().unwrap_or(MIN_REQUEUE).max(MIN_REQUEUE);
                Outcome::RequeueAfter(wait)
            }
            None => Outcome::Done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn settings() -> RotationSettings {
        RotationSettings {
            secret_name: "serving".to_string(),
            labels: BTreeMap::from([("app".to_string(), "test".to_string())]),
            ca_common_name: "test CA".to_string(),
            ca_duration: 100 * DAY,
            serving_duration: 10 * DAY,
            renew_before: 2 * DAY,
            dns_names: vec!["api.ns.svc".to_string()],
            ip_addrs: Vec::new(),
        }
    }

    fn controller(
        store: Arc<MemoryStore<Secret>>,
    ) -> (RotationController, Arc<DynamicCertProvider>, Arc<DynamicCertProvider>) {
        let ca = Arc::new(DynamicCertProvider::new_ca("ca"));
        let serving = Arc::new(DynamicCertProvider::new_serving_cert("serving"));
        let controller = RotationController::new(
            store,
            Arc::clone(&ca),
            Arc::clone(&serving),
            settings(),
        );
        (controller, ca, serving)
    }

    #[test]
    fn test_evaluate_states() {
        let now = Utc::now();
        assert_eq!(evaluate(None, None, None, now, DAY).0, MaterialState::Missing);
        assert_eq!(
            evaluate(Some(b"garbage"), Some(b"garbage"), None, now, DAY).0,
            MaterialState::Invalid
        );

        let fresh = testutil::create_certificate(now - DAY, now + 10 * DAY).unwrap();
        let bundle = fresh.ca.bundle();
        let (state, info) = evaluate(
            Some(fresh.cert_pem.as_bytes()),
            Some(fresh.key_pem.as_bytes()),
            Some(&bundle),
            now,
            2 * DAY,
        );
        assert_eq!(state, MaterialState::Fresh);
        assert!(info.is_some());

        // inside the renew-before window
        let stale = testutil::create_certificate(now - DAY, now + DAY).unwrap();
        assert_eq!(
            evaluate(
                Some(stale.cert_pem.as_bytes()),
                Some(stale.key_pem.as_bytes()),
                None,
                now,
                2 * DAY
            )
            .0,
            MaterialState::Stale
        );

        // signed by a different CA
        assert_eq!(
            evaluate(
                Some(stale.cert_pem.as_bytes()),
                Some(stale.key_pem.as_bytes()),
                Some(&bundle),
                now,
                Duration::ZERO
            )
            .0,
            MaterialState::Invalid
        );
    }

    #[tokio::test]
    async fn test_first_pass_mints_and_persists_everything() {
        let store = Arc::new(MemoryStore::<Secret>::namespaced("ns"));
        let (controller, ca, serving) = controller(Arc::clone(&store));

        let report = controller.rotate().await.unwrap();
        assert_eq!(report.ca, MaterialState::Missing);
        assert!(report.persisted);

        let secret = store.get("serving").await.unwrap().unwrap();
        let data = secret.data.unwrap();
        assert_eq!(data.len(), 4);
        assert_eq!(
            ca.current_ca_bundle_content().unwrap(),
            data[CA_CERTIFICATE_KEY].0
        );
        assert_eq!(
            serving.current_cert_key_content().unwrap().cert(),
            data[TLS_CERTIFICATE_CHAIN_KEY].0.as_slice()
        );
        assert_eq!(secret.metadata.labels.unwrap()["app"], "test");

        let again = controller.rotate().await.unwrap();
        assert_eq!(again.ca, MaterialState::Fresh);
        assert_eq!(again.serving, MaterialState::Fresh);
        assert!(!again.persisted);
        assert_eq!(serving.revision(), 1);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_providers_untouched() {
        let store = Arc::new(MemoryStore::<Secret>::namespaced("ns"));
        let (controller, ca, serving) = controller(Arc::clone(&store));

        // an empty secret exists, but the write of new material loses a race
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("serving".to_string()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        };
        let stored = store.create(&secret).await.unwrap();
        store.conflict_next_writes(1);

        assert!(matches!(
            controller.rotate().await,
            Err(RotationError::Store(StoreError::Conflict { .. }))
        ));
        assert!(ca.current_cert_key_content().is_none());
        assert!(serving.current_cert_key_content().is_none());
        assert_eq!(
            store.get("serving").await.unwrap().unwrap().metadata.resource_version,
            stored.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_foreign_serving_cert_is_replaced() {
        let store = Arc::new(MemoryStore::<Secret>::namespaced("ns"));
        let (controller, _ca, serving) = controller(Arc::clone(&store));
        controller.rotate().await.unwrap();

        let now = Utc::now();
        let foreign = testutil::create_certificate(now - DAY, now + 10 * DAY).unwrap();
        let mut secret = store.get("serving").await.unwrap().unwrap();
        let data = secret.data.as_mut().unwrap();
        data.insert(
            TLS_CERTIFICATE_CHAIN_KEY.to_string(),
            ByteString(foreign.cert_pem.as_bytes().to_vec()),
        );
        data.insert(
            TLS_PRIVATE_KEY_KEY.to_string(),
            ByteString(foreign.key_pem.as_bytes().to_vec()),
        );
        store.update(&secret).await.unwrap();

        let report = controller.rotate().await.unwrap();
        assert_eq!(report.ca, MaterialState::Fresh);
        assert_eq!(report.serving, MaterialState::Invalid);
        assert_ne!(
            serving.current_cert_key_content().unwrap().cert(),
            foreign.cert_pem.as_bytes()
        );
    }

    #[tokio::test]
    async fn test_reconcile_requeues_before_renewal() {
        let store = Arc::new(MemoryStore::<Secret>::namespaced("ns"));
        let (controller, _, _) = controller(store);
        match controller.reconcile("serving").await.unwrap() {
            Outcome::RequeueAfter(after) => {
                // serving cert: 10 days validity, renewed 2 days before expiry
                assert!(after <= 8 * DAY);
                assert!(after > 7 * DAY);
            }
            Outcome::Done => panic!("expected a requeue"),
        }
    }
}
