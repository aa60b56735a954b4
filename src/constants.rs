//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Field manager / application name used for labels and logs
pub const APP_NAME: &str = "trust-controller";

/// Standard name label put on created objects
pub const NAME_LABEL_KEY: &str = "app.kubernetes.io/name";

/// Standard managed-by label put on created objects
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

/// Default namespace the controller runs in
pub const DEFAULT_NAMESPACE: &str = "trust-system";

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default port of the TLS endpoint presenting the serving certificate
pub const DEFAULT_SERVING_PORT: u16 = 8443;

/// Default aggregated APIService whose `caBundle` tracks the CA
pub const DEFAULT_API_SERVICE_NAME: &str = "v1alpha1.login.trust-controller.dev";

/// Secret data key holding the PEM CA certificate
pub const CA_CERTIFICATE_KEY: &str = "caCertificate";

/// Secret data key holding the PEM CA private key
pub const CA_PRIVATE_KEY_KEY: &str = "caCertificatePrivateKey";

/// Secret data key holding the PEM serving certificate chain
pub const TLS_CERTIFICATE_CHAIN_KEY: &str = "tlsCertificateChain";

/// Secret data key holding the PEM serving private key
pub const TLS_PRIVATE_KEY_KEY: &str = "tlsPrivateKey";

/// Default CA validity (seconds) - 100 years, the CA is rotated only when invalid or deleted
pub const DEFAULT_CA_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Default serving certificate validity (seconds) - 1 year
pub const DEFAULT_SERVING_CERT_DURATION_SECS: u64 = 31_536_000;

/// Default window before expiry in which the serving certificate is renewed (seconds)
/// 95 days, so a one year certificate rotates roughly nine months after issuance
pub const DEFAULT_SERVING_CERT_RENEW_BEFORE_SECS: u64 = 8_208_000;

/// Label marking agent pods
pub const AGENT_LABEL_KEY: &str = "kube-cert-agent.trust-controller.dev";

/// Value of [`AGENT_LABEL_KEY`] on agent pods
pub const AGENT_LABEL_VALUE: &str = "v1";

/// Command run by agent pods; they only need to stay alive for exec access
pub const AGENT_COMMAND: &[&str] = &["/bin/sleep", "infinity"];

/// Annotation on agent pods naming their reference pod
pub const AGENT_REFERENCE_NAME_ANNOTATION: &str =
    "kube-cert-agent.trust-controller.dev/controller-manager-name";

/// Annotation on agent pods recording their reference pod UID
pub const AGENT_REFERENCE_UID_ANNOTATION: &str =
    "kube-cert-agent.trust-controller.dev/controller-manager-uid";

/// Default namespace of the reference (control-plane) pods
pub const DEFAULT_AGENT_REFERENCE_NAMESPACE: &str = "kube-system";

/// Default label selector of the reference pods
pub const DEFAULT_AGENT_REFERENCE_SELECTOR: &str = "component=kube-controller-manager";

/// Default agent pod name prefix
pub const DEFAULT_AGENT_NAME_PREFIX: &str = "kube-cert-agent-";

/// Default image run by agent pods
pub const DEFAULT_AGENT_IMAGE: &str = "debian:stable-slim";

/// Default time store failures may persist before an Error strategy is published (seconds)
pub const DEFAULT_MAX_UNREADY_SECS: u64 = 60;

/// Default periodic resync interval for every controller (seconds)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 60;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default per-call timeout for store requests (seconds)
pub const DEFAULT_STORE_CALL_TIMEOUT_SECS: u64 = 30;

/// Default delay before restarting a watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Number of fetch-merge-write attempts for a status update before giving up
pub const STATUS_UPDATE_ATTEMPTS: u32 = 5;
