//! rustls integration: the serving provider is consulted on every handshake,
//! and client certificates are checked against the CA provider's current bundle.

use super::{CertKeyContent, DynamicCertProvider};
use crate::certauthority;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

/// Resolves the server certificate from a [`DynamicCertProvider`]
///
/// The parsed key is cached per provider revision. When the provider is unset
/// or holds content rustls cannot load, the last good certificate keeps being
/// served; only a provider that never had content aborts the handshake.
#[derive(Debug)]
pub struct ProviderCertResolver {
    provider: Arc<DynamicCertProvider>,
    cache: Mutex<Option<(u64, Arc<CertifiedKey>)>>,
}

impl ProviderCertResolver {
    pub fn new(provider: Arc<DynamicCertProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(None),
        }
    }

    /// Certificate for a new connection, built from the provider's current snapshot
    pub fn current_certified_key(&self) -> Option<Arc<CertifiedKey>> {
        let snapshot = self.provider.snapshot();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let last_good = cache.as_ref().map(|(_, key)| Arc::clone(key));

        let Some(content) = snapshot.content.as_ref() else {
            return last_good;
        };
        if let Some((revision, key)) = cache.as_ref() {
            if *revision == snapshot.revision {
                return Some(Arc::clone(key));
            }
        }

        match certified_key(content) {
            Ok(key) => {
                let key = Arc::new(key);
                *cache = Some((snapshot.revision, Arc::clone(&key)));
                Some(key)
            }
            Err(e) => {
                warn!(
                    provider = %self.provider.name(),
                    revision = snapshot.revision,
                    error = %e,
                    "serving content could not be loaded for TLS, keeping the previous certificate"
                );
                last_good
            }
        }
    }
}

impl ResolvesServerCert for ProviderCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current_certified_key()
    }
}

fn certified_key(content: &CertKeyContent) -> Result<CertifiedKey, rustls::Error> {
    let chain: Vec<CertificateDer<'static>> = certauthority::parse_certificates(content.cert())
        .map_err(|e| rustls::Error::General(e.to_string()))?
        .into_iter()
        .map(CertificateDer::from)
        .collect();

    let key_der = ::pem::parse_many(content.key())
        .map_err(|e| rustls::Error::General(format!("invalid private key PEM: {e}")))?
        .into_iter()
        .find(|block| block.tag() == PRIVATE_KEY_TAG)
        .ok_or_else(|| rustls::Error::General("no PKCS#8 private key found".to_string()))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.into_contents()));

    let signing_key = ring::sign::any_supported_type(&key)?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Optional client authentication against the CA provider's current bundle
///
/// Client certificates are requested only while the CA provider has content.
/// Clients without a certificate are accepted; a presented certificate must
/// chain to the current CA. The webpki verifier is rebuilt once per CA revision.
pub struct ProviderClientVerifier {
    ca: Arc<DynamicCertProvider>,
    crypto: Arc<CryptoProvider>,
    cache: Mutex<Option<(u64, Arc<dyn ClientCertVerifier>)>>,
}

impl std::fmt::Debug for ProviderClientVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClientVerifier")
            .field("ca", &self.ca)
            .finish_non_exhaustive()
    }
}

impl ProviderClientVerifier {
    pub fn new(ca: Arc<DynamicCertProvider>, crypto: Arc<CryptoProvider>) -> Self {
        Self {
            ca,
            crypto,
            cache: Mutex::new(None),
        }
    }

    fn current_verifier(&self) -> Result<Arc<dyn ClientCertVerifier>, rustls::Error> {
        let snapshot = self.ca.snapshot();
        let content = snapshot
            .content
            .as_ref()
            .ok_or_else(|| rustls::Error::General("no client CA configured".to_string()))?;

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((revision, verifier)) = cache.as_ref() {
            if *revision == snapshot.revision {
                return Ok(Arc::clone(verifier));
            }
        }

        let roots = certauthority::pool_from_bundle(content.cert())
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&self.crypto))
                .allow_unauthenticated()
                .build()
                .map_err(|e| rustls::Error::General(format!("client verifier: {e:?}")))?;
        debug!(revision = snapshot.revision, "rebuilt client certificate verifier");
        *cache = Some((snapshot.revision, Arc::clone(&verifier)));
        Ok(verifier)
    }
}

impl ClientCertVerifier for ProviderClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.ca.snapshot().content.is_some()
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.current_verifier()?
            .verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.crypto
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS server configuration whose certificate follows `serving` and whose
/// optional client authentication follows `ca`
pub fn server_config(
    serving: Arc<DynamicCertProvider>,
    ca: Arc<DynamicCertProvider>,
) -> Result<ServerConfig, rustls::Error> {
    let crypto = Arc::new(ring::default_provider());
    let verifier = Arc::new(ProviderClientVerifier::new(ca, Arc::clone(&crypto)));
    let mut config = ServerConfig::builder_with_provider(crypto)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(Arc::new(ProviderCertResolver::new(serving)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}
