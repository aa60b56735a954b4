//! # Certificate Authority
//!
//! Self-signed CA creation and leaf certificate issuance.
//!
//! Each issued leaf gets a fresh ECDSA P-256 key. Validity windows are computed
//! from an injectable clock, with `notBefore` backdated slightly to tolerate
//! clock skew between the controller and its clients.
//!
//! ## Module Structure
//!
//! - `validation.rs` - PEM parsing, key/certificate matching, signature checks

mod validation;

pub use validation::{
    is_signed_by, leaf_info, parse_certificates, validate_cert_key, CertificateInfo,
};

use chrono::{DateTime, Utc};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

/// Backdating applied to every `notBefore`
pub const CLOCK_SKEW_ALLOWANCE: Duration = Duration::from_secs(5 * 60);

/// Source of "now" for validity windows
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Certificate authority errors
#[derive(Debug, Error)]
pub enum CaError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("certificate parsing error: {0}")]
    Parse(String),

    #[error("private key does not match certificate")]
    KeyMismatch,

    #[error("invalid DNS name '{0}'")]
    InvalidDnsName(String),

    #[error("validity window out of range: {0}")]
    InvalidValidity(String),
}

/// Freshly issued leaf certificate and its private key
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

/// Certificate authority holding its own certificate and private key as PEM
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_cert_pem: String,
    ca_key_pem: Zeroizing<String>,
    clock: Clock,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish_non_exhaustive()
    }
}

fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

impl CertificateAuthority {
    /// Create a new self-signed CA valid for `validity` from now
    pub fn new(common_name: &str, validity: Duration) -> Result<Self, CaError> {
        Self::new_with_clock(common_name, validity, system_clock())
    }

    /// Create a new self-signed CA whose validity window is derived from `clock`
    pub fn new_with_clock(
        common_name: &str,
        validity: Duration,
        clock: Clock,
    ) -> Result<Self, CaError> {
        let (not_before, not_after) = validity_window(clock(), validity)?;
        Self::new_with_window(common_name, not_before, not_after, clock)
    }

    /// Create a CA with an explicit validity window, which may lie in the past
    pub fn new_with_window(
        common_name: &str,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        clock: Clock,
    ) -> Result<Self, CaError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;

        let key_pair = KeyPair::generate()
            .map_err(|e| CaError::KeyGeneration(format!("failed to generate CA key: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::Generation(format!("failed to create CA cert: {e}")))?;

        Ok(Self {
            ca_cert_pem: cert.pem(),
            ca_key_pem: Zeroizing::new(key_pair.serialize_pem()),
            clock,
        })
    }

    /// Load a previously persisted CA, checking that the key belongs to the certificate
    pub fn load(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CaError> {
        Self::load_with_clock(cert_pem, key_pem, system_clock())
    }

    pub fn load_with_clock(cert_pem: &[u8], key_pem: &[u8], clock: Clock) -> Result<Self, CaError> {
        validate_cert_key(cert_pem, key_pem)?;
        let ca_cert_pem = String::from_utf8(cert_pem.to_vec())
            .map_err(|e| CaError::Pem(format!("CA certificate is not UTF-8: {e}")))?;
        let ca_key_pem = String::from_utf8(key_pem.to_vec())
            .map_err(|e| CaError::Pem(format!("CA private key is not UTF-8: {e}")))?;
        Ok(Self {
            ca_cert_pem,
            ca_key_pem: Zeroizing::new(ca_key_pem),
            clock,
        })
    }

    /// The CA certificate as raw PEM
    pub fn bundle(&self) -> Vec<u8> {
        self.ca_cert_pem.as_bytes().to_vec()
    }

    /// The CA certificate as a verification set
    pub fn pool(&self) -> Result<RootCertStore, CaError> {
        pool_from_bundle(self.ca_cert_pem.as_bytes())
    }

    /// The CA private key as PEM
    pub fn private_key_to_pem(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.ca_key_pem.as_bytes().to_vec())
    }

    /// Validity window of the CA certificate
    pub fn info(&self) -> Result<CertificateInfo, CaError> {
        leaf_info(self.ca_cert_pem.as_bytes())
    }

    /// Issue a TLS server certificate valid for `validity` from now
    pub fn issue_server_cert_pem(
        &self,
        dns_names: &[String],
        ip_addrs: &[IpAddr],
        validity: Duration,
    ) -> Result<IssuedCertificate, CaError> {
        let (not_before, not_after) = validity_window((self.clock)(), validity)?;
        self.issue_server_cert_pem_with_window(dns_names, ip_addrs, not_before, not_after)
    }

    /// Issue a TLS server certificate with an explicit validity window
    pub fn issue_server_cert_pem_with_window(
        &self,
        dns_names: &[String],
        ip_addrs: &[IpAddr],
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<IssuedCertificate, CaError> {
        let mut params = CertificateParams::default();
        let common_name = dns_names.first().map_or("trust-controller", String::as_str);
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;

        let mut sans = Vec::with_capacity(dns_names.len() + ip_addrs.len());
        for name in dns_names {
            let dns = Ia5String::try_from(name.clone())
                .map_err(|e| CaError::InvalidDnsName(format!("{name}: {e}")))?;
            sans.push(SanType::DnsName(dns));
        }
        sans.extend(ip_addrs.iter().copied().map(SanType::IpAddress));
        params.subject_alt_names = sans;

        self.sign_leaf(&params, "server")
    }

    /// Issue a TLS client certificate for `common_name`, valid for `validity` from now
    pub fn issue_client_cert_pem(
        &self,
        common_name: &str,
        validity: Duration,
    ) -> Result<IssuedCertificate, CaError> {
        let (not_before, not_after) = validity_window((self.clock)(), validity)?;
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;

        self.sign_leaf(&params, "client")
    }

    fn sign_leaf(&self, params: &CertificateParams, role: &str) -> Result<IssuedCertificate, CaError> {
        let leaf_key = KeyPair::generate()
            .map_err(|e| CaError::KeyGeneration(format!("failed to generate {role} key: {e}")))?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| CaError::Pem(format!("failed to load CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| CaError::Parse(format!("failed to create issuer: {e}")))?;

        let cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| CaError::Generation(format!("failed to sign {role} cert: {e}")))?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: Zeroizing::new(leaf_key.serialize_pem()),
        })
    }
}

/// Verification set holding every certificate of a PEM bundle
pub fn pool_from_bundle(bundle: &[u8]) -> Result<RootCertStore, CaError> {
    let mut roots = RootCertStore::empty();
    for der in parse_certificates(bundle)? {
        roots
            .add(CertificateDer::from(der))
            .map_err(|e| CaError::Parse(format!("failed to add CA to pool: {e}")))?;
    }
    Ok(roots)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn
}

fn validity_window(
    now: DateTime<Utc>,
    validity: Duration,
) -> Result<(DateTime<Utc>, DateTime<Utc>), CaError> {
    let skew = chrono::Duration::from_std(CLOCK_SKEW_ALLOWANCE)
        .map_err(|e| CaError::InvalidValidity(e.to_string()))?;
    let validity = chrono::Duration::from_std(validity)
        .map_err(|e| CaError::InvalidValidity(e.to_string()))?;
    let not_after = now
        .checked_add_signed(validity)
        .ok_or_else(|| CaError::InvalidValidity(format!("{now} + {validity}")))?;
    Ok((now - skew, not_after))
}

fn to_offset(at: DateTime<Utc>) -> Result<::time::OffsetDateTime, CaError> {
    ::time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| CaError::InvalidValidity(e.to_string()))
}
