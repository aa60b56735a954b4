//! Test helpers for minting certificates with arbitrary validity windows.
//!
//! Used by unit and integration tests to exercise expiry handling without
//! waiting for real time to pass.

use crate::certauthority::{CaError, CertificateAuthority, Clock};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use zeroize::Zeroizing;

/// DNS name placed on certificates minted by [`create_certificate`]
pub const TEST_DNS_NAME: &str = "test.trust-controller.example";

/// A CA and a leaf certificate it signed
#[derive(Debug)]
pub struct TestCertificate {
    pub ca: CertificateAuthority,
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
}

/// Mint a fresh CA (valid for a day around now) and a leaf certificate with
/// exactly the given `not_before`/`not_after`, both of which may be in the past.
pub fn create_certificate(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<TestCertificate, CaError> {
    let now = Utc::now();
    let ca = CertificateAuthority::new_with_window(
        "test CA",
        now - chrono::Duration::days(1),
        now + chrono::Duration::days(1),
        fixed_clock(now),
    )?;
    let leaf = ca.issue_server_cert_pem_with_window(
        &[TEST_DNS_NAME.to_string()],
        &[],
        not_before,
        not_after,
    )?;
    Ok(TestCertificate {
        ca,
        cert_pem: leaf.cert_pem,
        key_pem: leaf.key_pem,
    })
}

/// A clock frozen at `at`
pub fn fixed_clock(at: DateTime<Utc>) -> Clock {
    Arc::new(move || at)
}
