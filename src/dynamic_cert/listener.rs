//! Change listeners for [`super::DynamicCertProvider`].

use crate::observability::metrics;
use tokio::sync::mpsc;
use tracing::debug;

/// Notified after every successful set or unset of a provider's content
///
/// Called on a thread owned by the provider, once per revision and in
/// revision order. A slow implementation only delays its own notifications.
pub trait Listener: Send + Sync {
    fn enqueue(&self);
}

/// Forwards every change as a reconciliation key into a controller's trigger channel
#[derive(Debug, Clone)]
pub struct TriggerListener {
    key: String,
    sender: mpsc::UnboundedSender<String>,
}

impl TriggerListener {
    pub fn new(key: impl Into<String>, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            key: key.into(),
            sender,
        }
    }
}

impl Listener for TriggerListener {
    fn enqueue(&self) {
        if self.sender.send(self.key.clone()).is_err() {
            debug!(key = %self.key, "trigger receiver dropped, change not forwarded");
        }
    }
}

/// Counts content changes per provider
#[derive(Debug, Clone)]
pub struct MetricsListener {
    provider: String,
}

impl MetricsListener {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

impl Listener for MetricsListener {
    fn enqueue(&self) {
        metrics::increment_provider_updates(&self.provider);
    }
}
