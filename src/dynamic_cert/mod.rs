//! # Dynamic Certificates
//!
//! Hot-swappable holder for one role of trust material (the CA, or the serving
//! certificate). Readers take a copy-on-write snapshot, so a TLS handshake
//! never waits behind a writer and never sees half an update.
//!
//! ## Module Structure
//!
//! - `listener.rs` - change listener capability and its adapters
//! - `tls.rs` - rustls certificate resolver reading a provider per handshake

mod listener;
pub mod tls;

pub use listener::{Listener, MetricsListener, TriggerListener};

use crate::certauthority::{self, CaError};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};
use zeroize::Zeroizing;

/// Rejected certificate/key content
#[derive(Debug, Error)]
pub enum CertKeyError {
    #[error("{provider}: certificate is empty")]
    EmptyCertificate { provider: String },

    #[error("{provider}: private key is empty")]
    EmptyKey { provider: String },

    #[error("{provider}: invalid certificate/key pair: {source}")]
    Invalid {
        provider: String,
        #[source]
        source: CaError,
    },
}

/// PEM certificate chain and matching PEM private key
pub struct CertKeyContent {
    cert: Vec<u8>,
    key: Zeroizing<Vec<u8>>,
}

impl CertKeyContent {
    pub fn cert(&self) -> &[u8] {
        &self.cert
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for CertKeyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertKeyContent")
            .field("cert_len", &self.cert.len())
            .finish_non_exhaustive()
    }
}

/// Immutable view of a provider at one revision
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub content: Option<Arc<CertKeyContent>>,
    pub revision: u64,
}

/// Concurrency-safe, hot-swappable certificate/key holder
///
/// One instance per trust material role, created at startup and shared by
/// `Arc` with every consumer.
pub struct DynamicCertProvider {
    name: String,
    current: RwLock<Arc<Snapshot>>,
    // Serializes writers so every notifier queue receives revisions in order
    notifiers: Mutex<Vec<Notifier>>,
}

/// Delivery queue of one listener, drained by a dedicated thread
///
/// The setter only pushes the new revision; a slow listener delays nothing but
/// its own queue. The thread exits once the provider is dropped.
struct Notifier {
    sender: mpsc::UnboundedSender<u64>,
}

impl Notifier {
    fn spawn(provider: &str, listener: Arc<dyn Listener>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<u64>();
        let name = provider.to_string();
        let spawned = std::thread::Builder::new()
            .name(format!("{provider}-listener"))
            .spawn(move || {
                while let Some(revision) = receiver.blocking_recv() {
                    trace!(provider = %name, revision, "notifying listener");
                    listener.enqueue();
                }
            });
        if let Err(e) = spawned {
            error!(provider, error = %e, "could not start listener thread, listener disabled");
        }
        Self { sender }
    }

    fn notify(&self, revision: u64) {
        // A closed queue means the listener thread never started
        let _ = self.sender.send(revision);
    }
}

impl fmt::Debug for DynamicCertProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicCertProvider")
            .field("name", &self.name)
            .field("revision", &self.snapshot().revision)
            .finish_non_exhaustive()
    }
}

impl DynamicCertProvider {
    /// Provider for the CA role
    pub fn new_ca(name: impl Into<String>) -> Self {
        Self::new(name)
    }

    /// Provider for the serving certificate role
    pub fn new_serving_cert(name: impl Into<String>) -> Self {
        Self::new(name)
    }

    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: RwLock::new(Arc::new(Snapshot::default())),
            notifiers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate and install a new certificate/key pair
    ///
    /// On error the current content is left untouched and no listener runs.
    pub fn set_cert_key_content(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<(), CertKeyError> {
        if cert_pem.is_empty() {
            return Err(CertKeyError::EmptyCertificate {
                provider: self.name.clone(),
            });
        }
        if key_pem.is_empty() {
            return Err(CertKeyError::EmptyKey {
                provider: self.name.clone(),
            });
        }
        certauthority::validate_cert_key(cert_pem, key_pem).map_err(|source| {
            CertKeyError::Invalid {
                provider: self.name.clone(),
                source,
            }
        })?;

        let content = CertKeyContent {
            cert: cert_pem.to_vec(),
            key: Zeroizing::new(key_pem.to_vec()),
        };
        self.swap(Some(Arc::new(content)));
        Ok(())
    }

    /// Clear the content; listeners are still notified
    pub fn unset_cert_key_content(&self) {
        self.swap(None);
    }

    /// Latest content, if any
    pub fn current_cert_key_content(&self) -> Option<Arc<CertKeyContent>> {
        self.snapshot().content.clone()
    }

    /// Certificate bytes only; for the CA role this is the CA bundle
    pub fn current_ca_bundle_content(&self) -> Option<Vec<u8>> {
        self.current_cert_key_content()
            .map(|content| content.cert.clone())
    }

    /// Content together with its revision
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn revision(&self) -> u64 {
        self.snapshot().revision
    }

    /// Register a listener run after every successful change
    ///
    /// Each listener gets its own delivery thread, so it may block or call back
    /// into the provider without holding up the setter or other listeners.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        let notifier = Notifier::spawn(&self.name, listener);
        self.notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notifier);
    }

    fn swap(&self, content: Option<Arc<CertKeyContent>>) {
        let notifiers = self
            .notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let revision = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let revision = current.revision + 1;
            *current = Arc::new(Snapshot { content, revision });
            revision
        };

        debug!(provider = %self.name, revision, "trust material changed");
        for notifier in notifiers.iter() {
            notifier.notify(revision);
        }
    }
}
