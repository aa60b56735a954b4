//! PEM parsing and certificate/key validation helpers.

use super::CaError;
use chrono::{DateTime, Utc};
use rcgen::KeyPair;
use x509_parser::prelude::*;

const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Validity window and subject of a parsed leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub common_name: String,
}

impl CertificateInfo {
    fn from_x509(cert: &X509Certificate<'_>) -> Result<Self, CaError> {
        let not_before = timestamp(cert.validity().not_before.timestamp())?;
        let not_after = timestamp(cert.validity().not_after.timestamp())?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();
        Ok(Self {
            not_before,
            not_after,
            common_name,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, CaError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CaError::Parse(format!("timestamp {secs} out of range")))
}

/// Decode every `CERTIFICATE` block of a PEM document into DER, leaf first
pub fn parse_certificates(pem_data: &[u8]) -> Result<Vec<Vec<u8>>, CaError> {
    let blocks = ::pem::parse_many(pem_data).map_err(|e| CaError::Pem(e.to_string()))?;
    let ders: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|block| block.tag() == CERTIFICATE_TAG)
        .map(|block| block.into_contents())
        .collect();
    if ders.is_empty() {
        return Err(CaError::Pem("no CERTIFICATE block found".to_string()));
    }
    Ok(ders)
}

/// Parse the leaf (first) certificate of a PEM chain
pub fn leaf_info(cert_pem: &[u8]) -> Result<CertificateInfo, CaError> {
    let ders = parse_certificates(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&ders[0])
        .map_err(|e| CaError::Parse(format!("failed to parse certificate: {e}")))?;
    CertificateInfo::from_x509(&cert)
}

/// Check that `key_pem` is the private key of the leaf certificate in `cert_pem`
///
/// Every certificate in the chain must parse. Only PKCS#8 keys are accepted.
pub fn validate_cert_key(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertificateInfo, CaError> {
    let ders = parse_certificates(cert_pem)?;
    let mut certs = Vec::with_capacity(ders.len());
    for der in &ders {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| CaError::Parse(format!("failed to parse certificate: {e}")))?;
        certs.push(cert);
    }

    let key_str = std::str::from_utf8(key_pem)
        .map_err(|e| CaError::Pem(format!("private key is not UTF-8: {e}")))?;
    let key = KeyPair::from_pem(key_str)
        .map_err(|e| CaError::Pem(format!("failed to parse private key: {e}")))?;

    let leaf = &certs[0];
    if leaf.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
        return Err(CaError::KeyMismatch);
    }
    CertificateInfo::from_x509(leaf)
}

/// Whether the leaf certificate of `cert_pem` carries a valid signature from the CA in `ca_pem`
pub fn is_signed_by(cert_pem: &[u8], ca_pem: &[u8]) -> Result<bool, CaError> {
    let cert_ders = parse_certificates(cert_pem)?;
    let ca_ders = parse_certificates(ca_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_ders[0])
        .map_err(|e| CaError::Parse(format!("failed to parse certificate: {e}")))?;
    let (_, ca) = X509Certificate::from_der(&ca_ders[0])
        .map_err(|e| CaError::Parse(format!("failed to parse CA certificate: {e}")))?;
    Ok(cert.verify_signature(Some(ca.public_key())).is_ok())
}
