//! # Trust Controller
//!
//! Runs the certificate rotation controller, the agent controller, and the
//! APIService CA sync against the cluster. Serves metrics and health checks over
//! plain HTTP and the rotated serving certificate over TLS.
//!
//! Configuration comes from environment variables, see
//! [`trust_controller::config::ControllerConfig`].

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::Client;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use trust_controller::config::ControllerConfig;
use trust_controller::controller::{
    AgentController, AgentSettings, ApiServiceController, RotationController, RotationSettings,
    AGENT_KEY,
};
use trust_controller::crd::CredentialIssuer;
use trust_controller::dynamic_cert::tls::server_config;
use trust_controller::dynamic_cert::{DynamicCertProvider, MetricsListener, TriggerListener};
use trust_controller::observability;
use trust_controller::runtime::{Driver, DriverConfig};
use trust_controller::server::{start_server, start_tls_server, ServerState};
use trust_controller::store::{KubeStore, ResourceStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Configure rustls crypto provider FIRST, before any other operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|provider| {
            anyhow::anyhow!("a rustls crypto provider is already installed: {provider:?}")
        })?;

    let config = ControllerConfig::from_env();
    init_tracing(&config);

    info!("Starting Trust Controller");
    info!(
        "Build info: datetime={}, git_hash={}",
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    config.validate().context("Invalid controller configuration")?;
    observability::metrics::register_metrics()?;

    let shutdown = CancellationToken::new();
    let server_state = Arc::new(ServerState::default());
    let server = tokio::spawn({
        let state = Arc::clone(&server_state);
        let shutdown = shutdown.clone();
        let port = config.metrics_port;
        async move {
            if let Err(e) = start_server(port, state, shutdown).await {
                error!("HTTP server error: {}", e);
            }
        }
    });

    let ca_provider = Arc::new(DynamicCertProvider::new_ca("ca"));
    let serving_provider = Arc::new(DynamicCertProvider::new_serving_cert("serving"));
    ca_provider.add_listener(Arc::new(MetricsListener::new("ca")));
    serving_provider.add_listener(Arc::new(MetricsListener::new("serving")));

    let tls_config = server_config(Arc::clone(&serving_provider), Arc::clone(&ca_provider))
        .context("Failed to build TLS server configuration")?;
    let tls_server = tokio::spawn({
        let shutdown = shutdown.clone();
        let port = config.serving_port;
        async move {
            if let Err(e) = start_tls_server(port, Arc::new(tls_config), shutdown).await {
                error!("TLS server error: {}", e);
            }
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let timeout = config.store_call_timeout();
    let secrets: Arc<dyn ResourceStore<Secret>> = Arc::new(KubeStore::<Secret>::namespaced(
        client.clone(),
        &config.controller_namespace,
        timeout,
    ));
    let reference_pods: Arc<dyn ResourceStore<Pod>> = Arc::new(KubeStore::<Pod>::namespaced(
        client.clone(),
        &config.agent_reference_namespace,
        timeout,
    ));
    let agent_pods: Arc<dyn ResourceStore<Pod>> = Arc::new(KubeStore::<Pod>::namespaced(
        client.clone(),
        &config.controller_namespace,
        timeout,
    ));
    let issuers: Arc<dyn ResourceStore<CredentialIssuer>> = Arc::new(
        KubeStore::<CredentialIssuer>::cluster(client.clone(), timeout),
    );
    let api_services: Arc<dyn ResourceStore<APIService>> =
        Arc::new(KubeStore::<APIService>::cluster(client, timeout));

    let driver_config = DriverConfig::from(&config);

    let rotation = Arc::new(RotationController::new(
        secrets,
        Arc::clone(&ca_provider),
        Arc::clone(&serving_provider),
        RotationSettings::from(&config),
    ));
    let rotation_driver = Driver::new(Arc::clone(&rotation), driver_config.clone())
        .with_resync_key(rotation.secret_name())
        .with_watch({
            let rotation = Arc::clone(&rotation);
            move || rotation.watch_keys()
        });

    // A new CA changes the frontend the agent controller publishes
    let (ca_changed, ca_changes) = mpsc::unbounded_channel();
    ca_provider.add_listener(Arc::new(TriggerListener::new(AGENT_KEY, ca_changed)));

    let agent_settings =
        AgentSettings::from_config(&config).context("Invalid agent reference selector")?;
    let agent = Arc::new(AgentController::new(
        reference_pods,
        agent_pods,
        issuers,
        Arc::clone(&ca_provider),
        agent_settings,
    ));
    let agent_driver = Driver::new(Arc::clone(&agent), driver_config.clone())
        .with_resync_key(AGENT_KEY)
        .with_watch({
            let agent = Arc::clone(&agent);
            move || agent.watch_reference_keys()
        })
        .with_watch({
            let agent = Arc::clone(&agent);
            move || agent.watch_agent_keys()
        })
        .with_trigger(ca_changes);

    let mut tasks = vec![
        ("rotation", tokio::spawn(rotation_driver.run(shutdown.clone()))),
        ("agent", tokio::spawn(agent_driver.run(shutdown.clone()))),
    ];

    if config.api_service_name.is_empty() {
        warn!("API_SERVICE_NAME is empty, APIService CA bundle sync disabled");
    } else {
        let (ca_changed, ca_changes) = mpsc::unbounded_channel();
        ca_provider.add_listener(Arc::new(TriggerListener::new(
            config.api_service_name.clone(),
            ca_changed,
        )));
        let api_service = Arc::new(ApiServiceController::new(
            api_services,
            Arc::clone(&ca_provider),
            config.api_service_name.clone(),
        ));
        let api_service_driver = Driver::new(Arc::clone(&api_service), driver_config)
            .with_resync_key(api_service.api_service_name())
            .with_watch({
                let api_service = Arc::clone(&api_service);
                move || api_service.watch_keys()
            })
            .with_trigger(ca_changes);
        tasks.push((
            "api-service",
            tokio::spawn(api_service_driver.run(shutdown.clone())),
        ));
    }
    server_state.set_ready(true);
    info!(
        namespace = %config.controller_namespace,
        secret = %config.serving_cert_secret_name,
        "Controllers started"
    );

    shutdown_signal().await;
    info!("Shutdown signal received, stopping controllers");
    server_state.set_ready(false);
    shutdown.cancel();

    for (name, task) in tasks {
        if let Err(e) = task.await {
            error!(controller = name, error = %e, "controller task failed");
        }
    }
    for (name, task) in [("HTTP", server), ("TLS", tls_server)] {
        if let Err(e) = task.await {
            error!(error = %e, "{} server task failed", name);
        }
    }

    info!("Trust Controller stopped");
    Ok(())
}

/// SIGINT or SIGTERM; a handler that cannot be installed never fires
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}

/// `RUST_LOG` wins; otherwise `LOG_LEVEL` applies to this crate
fn init_tracing(config: &ControllerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "trust_controller={}",
            config.log_level.to_lowercase()
        ))
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format.eq_ignore_ascii_case("text") {
        builder.init();
    } else {
        builder.json().init();
    }
}
