//! # Error Policy
//!
//! Error handling and backoff logic for the reconciliation driver and watch
//! streams.

use super::backoff::ExponentialBackoff;
use crate::observability::metrics;
use std::time::Duration;
use tracing::{error, warn};

/// Coarse classification of watch stream failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorClass {
    /// 401/403: RBAC revoked or token expired
    Unauthorized,
    /// 410: resource version too old, the watch relists
    Expired,
    /// 429: API server storage reinitializing or throttling
    Throttled,
    /// 404: resource or CRD missing
    NotFound,
    /// Transport failures and other statuses
    Other,
}

impl WatchErrorClass {
    /// Classify by the HTTP status the API server answered with, if any
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            Some(401 | 403) => Self::Unauthorized,
            Some(410) => Self::Expired,
            Some(429) => Self::Throttled,
            Some(404) => Self::NotFound,
            _ => Self::Other,
        }
    }
}

/// Record a failed reconciliation and return the delay before the key is retried
pub fn handle_reconciliation_error(
    controller: &str,
    key: &str,
    err: &(dyn std::error::Error + Send + Sync),
    backoff: &mut ExponentialBackoff,
) -> Duration {
    metrics::increment_reconciliation_errors(controller);
    let delay = backoff.next_backoff();
    error!(
        controller,
        key,
        error = %err,
        attempts = backoff.attempts(),
        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        "reconciliation failed"
    );
    delay
}

/// Log a watch stream that ended and will be restarted after `delay`
pub fn handle_watch_stream_end(controller: &str, delay: Duration) {
    warn!(
        controller,
        restart_in_secs = delay.as_secs(),
        "watch stream ended, restarting"
    );
}
