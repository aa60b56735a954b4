//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use crate::constants::*;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Rejected configuration values
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error(
        "renew-before ({renew_before}s) must be less than the certificate duration ({duration}s)"
    )]
    RenewBeforeTooLong { renew_before: u64, duration: u64 },
    #[error("backoff start ({start}ms) must not exceed backoff max ({max}ms)")]
    BackoffInverted { start: u64, max: u64 },
}

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace where the controller is deployed; holds the serving secret and agent pods
    pub controller_namespace: String,
    /// Name of the secret persisting the CA and serving certificate
    pub serving_cert_secret_name: String,
    /// Service name the serving certificate is issued for
    pub service_name: String,
    /// Common name of the self-signed CA
    pub ca_common_name: String,
    /// CA validity (seconds)
    pub ca_duration_secs: u64,
    /// Serving certificate validity (seconds)
    pub serving_cert_duration_secs: u64,
    /// Window before expiry in which the serving certificate is renewed (seconds)
    pub serving_cert_renew_before_secs: u64,
    /// Name of the cluster-scoped CredentialIssuer receiving strategy reports
    pub credential_issuer_name: String,
    /// Externally reachable URL of the token credential request API, published in strategies
    pub discovery_url: Option<String>,
    /// Image run by agent pods
    pub agent_image: String,
    /// Agent pod name prefix
    pub agent_name_prefix: String,
    /// Namespace of the reference (control-plane) pods
    pub agent_reference_namespace: String,
    /// Label selector (`k=v,k2=v2`) matching reference pods
    pub agent_reference_selector: String,
    /// How long store failures may persist before an Error strategy is published (seconds)
    pub max_unready_secs: u64,
    /// Periodic resync interval for every controller (seconds)
    pub resync_interval_secs: u64,
    /// Exponential backoff starting value (milliseconds)
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    pub backoff_max_ms: u64,
    /// Per-call timeout for store requests (seconds)
    pub store_call_timeout_secs: u64,
    /// Delay before restarting a watch stream after it ends (seconds)
    pub watch_restart_delay_secs: u64,
    /// Port of the metrics and health-check HTTP server
    pub metrics_port: u16,
    /// Port of the TLS endpoint presenting the serving certificate
    pub serving_port: u16,
    /// Aggregated APIService kept in sync with the CA bundle; empty disables the sync
    pub api_service_name: String,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE), used when RUST_LOG is unset
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_namespace: DEFAULT_NAMESPACE.to_string(),
            serving_cert_secret_name: format!("{APP_NAME}-api-tls-serving-certificate"),
            service_name: format!("{APP_NAME}-api"),
            ca_common_name: format!("{APP_NAME} CA"),
            ca_duration_secs: DEFAULT_CA_DURATION_SECS,
            serving_cert_duration_secs: DEFAULT_SERVING_CERT_DURATION_SECS,
            serving_cert_renew_before_secs: DEFAULT_SERVING_CERT_RENEW_BEFORE_SECS,
            credential_issuer_name: format!("{APP_NAME}-config"),
            discovery_url: None,
            agent_image: DEFAULT_AGENT_IMAGE.to_string(),
            agent_name_prefix: DEFAULT_AGENT_NAME_PREFIX.to_string(),
            agent_reference_namespace: DEFAULT_AGENT_REFERENCE_NAMESPACE.to_string(),
            agent_reference_selector: DEFAULT_AGENT_REFERENCE_SELECTOR.to_string(),
            max_unready_secs: DEFAULT_MAX_UNREADY_SECS,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            store_call_timeout_secs: DEFAULT_STORE_CALL_TIMEOUT_SECS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            metrics_port: DEFAULT_METRICS_PORT,
            serving_port: DEFAULT_SERVING_PORT,
            api_service_name: DEFAULT_API_SERVICE_NAME.to_string(),
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            controller_namespace: env_var_or_default_str(
                "POD_NAMESPACE",
                &defaults.controller_namespace,
            ),
            serving_cert_secret_name: env_var_or_default_str(
                "SERVING_CERT_SECRET_NAME",
                &defaults.serving_cert_secret_name,
            ),
            service_name: env_var_or_default_str("SERVICE_NAME", &defaults.service_name),
            ca_common_name: env_var_or_default_str("CA_COMMON_NAME", &defaults.ca_common_name),
            ca_duration_secs: env_var_or_default("CA_DURATION_SECONDS", defaults.ca_duration_secs),
            serving_cert_duration_secs: env_var_or_default(
                "SERVING_CERT_DURATION_SECONDS",
                defaults.serving_cert_duration_secs,
            ),
            serving_cert_renew_before_secs: env_var_or_default(
                "SERVING_CERT_RENEW_BEFORE_SECONDS",
                defaults.serving_cert_renew_before_secs,
            ),
            credential_issuer_name: env_var_or_default_str(
                "CREDENTIAL_ISSUER_NAME",
                &defaults.credential_issuer_name,
            ),
            discovery_url: std::env::var("DISCOVERY_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            agent_image: env_var_or_default_str("AGENT_IMAGE", &defaults.agent_image),
            agent_name_prefix: env_var_or_default_str(
                "AGENT_NAME_PREFIX",
                &defaults.agent_name_prefix,
            ),
            agent_reference_namespace: env_var_or_default_str(
                "AGENT_REFERENCE_NAMESPACE",
                &defaults.agent_reference_namespace,
            ),
            agent_reference_selector: env_var_or_default_str(
                "AGENT_REFERENCE_SELECTOR",
                &defaults.agent_reference_selector,
            ),
            max_unready_secs: env_var_or_default("MAX_UNREADY_SECS", defaults.max_unready_secs),
            resync_interval_secs: env_var_or_default(
                "RESYNC_INTERVAL_SECS",
                defaults.resync_interval_secs,
            ),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", defaults.backoff_start_ms),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", defaults.backoff_max_ms),
            store_call_timeout_secs: env_var_or_default(
                "STORE_CALL_TIMEOUT_SECS",
                defaults.store_call_timeout_secs,
            ),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                defaults.watch_restart_delay_secs,
            ),
            metrics_port: env_var_or_default("METRICS_PORT", defaults.metrics_port),
            serving_port: env_var_or_default("SERVING_PORT", defaults.serving_port),
            api_service_name: env_var_or_default_str(
                "API_SERVICE_NAME",
                &defaults.api_service_name,
            ),
            log_level: env_var_or_default_str("LOG_LEVEL", &defaults.log_level),
            log_format: env_var_or_default_str("LOG_FORMAT", &defaults.log_format),
        }
    }

    /// Reject combinations that would make rotation or backoff misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ca_duration_secs == 0 {
            return Err(ConfigError::Zero("CA duration"));
        }
        if self.serving_cert_duration_secs == 0 {
            return Err(ConfigError::Zero("serving certificate duration"));
        }
        let required = [
            (self.resync_interval_secs, "resync interval"),
            (self.store_call_timeout_secs, "store call timeout"),
            (self.backoff_start_ms, "backoff start"),
            (self.backoff_max_ms, "backoff max"),
            (self.watch_restart_delay_secs, "watch restart delay"),
        ];
        if let Some((_, name)) = required.iter().find(|(value, _)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.serving_cert_renew_before_secs >= self.serving_cert_duration_secs {
            return Err(ConfigError::RenewBeforeTooLong {
                renew_before: self.serving_cert_renew_before_secs,
                duration: self.serving_cert_duration_secs,
            });
        }
        // The CA is renewed with the same window
        if self.serving_cert_renew_before_secs >= self.ca_duration_secs {
            return Err(ConfigError::RenewBeforeTooLong {
                renew_before: self.serving_cert_renew_before_secs,
                duration: self.ca_duration_secs,
            });
        }
        if self.backoff_start_ms > self.backoff_max_ms {
            return Err(ConfigError::BackoffInverted {
                start: self.backoff_start_ms,
                max: self.backoff_max_ms,
            });
        }
        Ok(())
    }

    /// DNS names the serving certificate is issued for
    pub fn serving_dns_names(&self) -> Vec<String> {
        vec![
            format!("{}.{}.svc", self.service_name, self.controller_namespace),
            format!(
                "{}.{}.svc.cluster.local",
                self.service_name, self.controller_namespace
            ),
        ]
    }

    /// Labels put on every object the controller creates
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (NAME_LABEL_KEY.to_string(), APP_NAME.to_string()),
            (MANAGED_BY_LABEL_KEY.to_string(), APP_NAME.to_string()),
        ])
    }

    pub fn ca_duration(&self) -> Duration {
        Duration::from_secs(self.ca_duration_secs)
    }

    pub fn serving_cert_duration(&self) -> Duration {
        Duration::from_secs(self.serving_cert_duration_secs)
    }

    pub fn serving_cert_renew_before(&self) -> Duration {
        Duration::from_secs(self.serving_cert_renew_before_secs)
    }

    pub fn max_unready(&self) -> Duration {
        Duration::from_secs(self.max_unready_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn backoff_start(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn store_call_timeout(&self) -> Duration {
        Duration::from_secs(self.store_call_timeout_secs)
    }

    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(ControllerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_default_rotation_happens_nine_months_in() {
        let config = ControllerConfig::default();
        let rotate_after =
            config.serving_cert_duration_secs - config.serving_cert_renew_before_secs;
        assert_eq!(rotate_after, 23_328_000);
    }

    #[test]
    fn test_renew_before_must_be_shorter_than_duration() {
        let config = ControllerConfig {
            serving_cert_duration_secs: 100,
            serving_cert_renew_before_secs: 100,
            ..ControllerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::RenewBeforeTooLong {
                renew_before: 100,
                duration: 100
            })
        );
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let cases: [(fn(&mut ControllerConfig), &str); 7] = [
            (|c| c.ca_duration_secs = 0, "CA duration"),
            (|c| c.serving_cert_duration_secs = 0, "serving certificate duration"),
            (|c| c.resync_interval_secs = 0, "resync interval"),
            (|c| c.store_call_timeout_secs = 0, "store call timeout"),
            (|c| c.backoff_start_ms = 0, "backoff start"),
            (|c| c.backoff_max_ms = 0, "backoff max"),
            (|c| c.watch_restart_delay_secs = 0, "watch restart delay"),
        ];
        for (zero, name) in cases {
            let mut config = ControllerConfig::default();
            zero(&mut config);
            assert_eq!(config.validate(), Err(ConfigError::Zero(name)), "{name}");
        }
    }

    #[test]
    fn test_backoff_bounds_must_be_ordered() {
        let config = ControllerConfig {
            backoff_start_ms: 5000,
            backoff_max_ms: 1000,
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BackoffInverted { .. })
        ));
    }

    #[test]
    fn test_serving_dns_names_use_service_and_namespace() {
        let config = ControllerConfig {
            service_name: "api".to_string(),
            controller_namespace: "ns".to_string(),
            ..ControllerConfig::default()
        };
        assert_eq!(
            config.serving_dns_names(),
            vec!["api.ns.svc".to_string(), "api.ns.svc.cluster.local".to_string()]
        );
    }
}
