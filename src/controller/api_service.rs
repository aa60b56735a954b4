//! # APIService CA Controller
//!
//! Keeps `spec.caBundle` of the aggregated API's APIService equal to the CA
//! provider's current bundle, so the API server keeps trusting the serving
//! certificate across CA rotations. The APIService itself is installed with
//! the deployment; a missing object is logged and left alone.

use crate::dynamic_cert::DynamicCertProvider;
use crate::runtime::{Outcome, Reconcile};
use crate::store::{ResourceStore, StoreError, WatchEvent};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use k8s_openapi::ByteString;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const API_SERVICE_CONTROLLER: &str = "api-service-ca";

#[derive(Debug, Error)]
pub enum ApiServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Copies the CA bundle into one APIService
pub struct ApiServiceController {
    api_services: Arc<dyn ResourceStore<APIService>>,
    ca_provider: Arc<DynamicCertProvider>,
    name: String,
}

impl std::fmt::Debug for ApiServiceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiServiceController")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ApiServiceController {
    pub fn new(
        api_services: Arc<dyn ResourceStore<APIService>>,
        ca_provider: Arc<DynamicCertProvider>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_services,
            ca_provider,
            name: name.into(),
        }
    }

    pub fn api_service_name(&self) -> &str {
        &self.name
    }

    /// Keys for the driver: the APIService name whenever that object changes
    pub fn watch_keys(&self) -> BoxStream<'static, String> {
        let name = self.name.clone();
        self.api_services
            .watch_named(&name)
            .filter_map(move |event| {
                let key = match event {
                    WatchEvent::Applied(_) | WatchEvent::Restarted => Some(name.clone()),
                    WatchEvent::Deleted(_) => None,
                };
                futures::future::ready(key)
            })
            .boxed()
    }

    /// Write the current CA bundle into the APIService; true when it was updated
    pub async fn sync(&self) -> Result<bool, StoreError> {
        let Some(bundle) = self.ca_provider.current_ca_bundle_content() else {
            debug!(api_service = %self.name, "no CA bundle yet");
            return Ok(false);
        };
        let Some(mut api_service) = self.api_services.get(&self.name).await? else {
            debug!(api_service = %self.name, "APIService not found, nothing to update");
            return Ok(false);
        };

        let spec = api_service.spec.get_or_insert_with(Default::default);
        if spec.ca_bundle.as_ref().map(|b| b.0.as_slice()) == Some(bundle.as_slice()) {
            return Ok(false);
        }
        spec.ca_bundle = Some(ByteString(bundle));
        self.api_services.update(&api_service).await?;
        info!(
            api_service = %self.name,
            revision = self.ca_provider.revision(),
            "updated APIService CA bundle"
        );
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Reconcile for ApiServiceController {
    type Error = ApiServiceError;

    fn name(&self) -> &'static str {
        API_SERVICE_CONTROLLER
    }

    async fn reconcile(&self, _key: &str) -> Result<Outcome, ApiServiceError> {
        self.sync().await?;
        Ok(Outcome::Done)
    }
}
