//! Trust Controller Library
//!
//! Keeps an authentication gateway's TLS identity, its certificate authority,
//! and its published credential strategies self-healing and rotated without
//! downtime.
//!
//! The pieces, leaves first:
//!
//! - [`dynamic_cert`] - hot-swappable certificate/key holder read on every TLS handshake
//! - [`certauthority`] - self-signed CA creation, leaf issuance, PEM validation
//! - [`controller::rotation`] - mints and rotates the persisted trust material
//! - [`issuer`] - merges strategy reports into the published `CredentialIssuer` status
//! - [`controller::agent`] - keeps agent pods in lockstep with their reference pods
//! - [`controller::api_service`] - copies the CA bundle into the aggregated API's APIService
//!
//! Controllers share one reconciliation driver ([`runtime::driver`]) and talk to
//! the cluster through the [`store::ResourceStore`] abstraction. Tests are
//! included in the module files and under `tests/`.

pub mod certauthority;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod dynamic_cert;
pub mod issuer;
pub mod observability;
pub mod runtime;
pub mod server;
pub mod store;
pub mod testutil;
