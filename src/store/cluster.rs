//! kube-backed [`ResourceStore`].

use super::{selector_string, ResourceStore, Selector, StoreError, WatchEvent};
use futures::stream::BoxStream;
use futures::{Future, StreamExt};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, warn};

use crate::constants::APP_NAME;
use crate::runtime::error_policy::WatchErrorClass;

/// [`ResourceStore`] talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore<K> {
    api: Api<K>,
    kind: String,
    timeout: Duration,
}

impl<K> std::fmt::Debug for KubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    /// Store over `K` objects in one namespace
    pub fn namespaced(client: Client, namespace: &str, timeout: Duration) -> Self
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    {
        Self::from_api(Api::namespaced(client, namespace), timeout)
    }

    /// Store over cluster-scoped `K` objects
    pub fn cluster(client: Client, timeout: Duration) -> Self
    where
        K: Resource<Scope = k8s_openapi::ClusterResourceScope>,
    {
        Self::from_api(Api::all(client), timeout)
    }

    fn from_api(api: Api<K>, timeout: Duration) -> Self {
        Self {
            api,
            kind: K::kind(&()).into_owned(),
            timeout,
        }
    }

    async fn call<T, F>(&self, name: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| map_kube_error(e, &self.kind, name)),
            Err(_elapsed) => Err(StoreError::Unavailable(format!(
                "{} '{}' request timed out after {:?}",
                self.kind, name, self.timeout
            ))),
        }
    }
}

fn map_kube_error(err: kube::Error, kind: &str, name: &str) -> StoreError {
    match err {
        kube::Error::Api(e) => map_status(e.code, &e.reason, e.message, kind, name),
        other => StoreError::Unavailable(other.to_string()),
    }
}

/// Classify an API server rejection by HTTP status
fn map_status(code: u16, reason: &str, message: String, kind: &str, name: &str) -> StoreError {
    let (kind, name) = (kind.to_string(), name.to_string());
    match code {
        404 => StoreError::NotFound { kind, name },
        409 if reason == "AlreadyExists" => StoreError::AlreadyExists { kind, name },
        409 => StoreError::Conflict { kind, name },
        401 | 403 => StoreError::Forbidden(message),
        400 | 422 => StoreError::Invalid(message),
        _ => StoreError::Unavailable(message),
    }
}

/// HTTP status behind a watch failure, when the API server answered at all
fn watch_error_status(err: &watcher::Error) -> Option<u16> {
    match err {
        watcher::Error::InitialListFailed(kube::Error::Api(e))
        | watcher::Error::WatchStartFailed(kube::Error::Api(e))
        | watcher::Error::WatchFailed(kube::Error::Api(e)) => Some(e.code),
        watcher::Error::WatchError(e) => Some(e.code),
        _ => None,
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    fn watch_with(&self, config: watcher::Config) -> BoxStream<'static, WatchEvent<K>> {
        let timeout_secs = u32::try_from(self.timeout.as_secs()).unwrap_or(u32::MAX);
        let config = config.timeout(timeout_secs);
        let kind = self.kind.clone();

        watcher(self.api.clone(), config)
            .default_backoff()
            .filter_map(move |event| {
                let kind = kind.clone();
                async move {
                    match event {
                        Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj)) => {
                            Some(WatchEvent::Applied(obj))
                        }
                        Ok(watcher::Event::Delete(obj)) => Some(WatchEvent::Deleted(obj)),
                        Ok(watcher::Event::Init) => None,
                        Ok(watcher::Event::InitDone) => {
                            debug!(kind = %kind, "watch relisted");
                            Some(WatchEvent::Restarted)
                        }
                        Err(e) => {
                            let class = WatchErrorClass::from_status(watch_error_status(&e));
                            warn!(kind = %kind, error = %e, class = ?class, "watch stream error");
                            None
                        }
                    }
                }
            })
            .boxed()
    }
}

#[async_trait::async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, StoreError> {
        self.call(name, self.api.get_opt(name)).await
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<K>, StoreError> {
        let params = ListParams::default().labels(&selector_string(selector));
        let list = self.call("*", self.api.list(&params)).await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj.name_any();
        self.call(&name, self.api.create(&PostParams::default(), obj))
            .await
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj.name_any();
        self.call(&name, self.api.replace(&name, &PostParams::default(), obj))
            .await
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj.name_any();
        let value =
            serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
        // The resourceVersion in the body makes the API server reject stale writes with 409
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": value.get("status").cloned().unwrap_or(serde_json::Value::Null),
        });
        self.call(
            &name,
            self.api
                .patch_status(&name, &PatchParams::apply(APP_NAME), &Patch::Merge(patch)),
        )
        .await
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.call(name, self.api.delete(name, &DeleteParams::default()))
            .await
            .map(|_| ())
    }

    fn watch(&self, selector: &Selector) -> BoxStream<'static, WatchEvent<K>> {
        self.watch_with(watcher::Config::default().labels(&selector_string(selector)))
    }

    fn watch_named(&self, name: &str) -> BoxStream<'static, WatchEvent<K>> {
        self.watch_with(watcher::Config::default().fields(&format!("metadata.name={name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(code: u16, reason: &str) -> StoreError {
        map_status(code, reason, format!("status {code}"), "Secret", "serving")
    }

    #[test]
    fn test_status_mapping() {
        assert!(map(404, "NotFound").is_not_found());
        assert!(matches!(map(409, "AlreadyExists"), StoreError::AlreadyExists { .. }));
        assert!(map(409, "Conflict").is_conflict());
        assert!(matches!(map(422, "Invalid"), StoreError::Invalid(_)));
        assert!(matches!(map(400, "BadRequest"), StoreError::Invalid(_)));
        assert!(map(503, "ServiceUnavailable").is_unavailable());
        assert!(map(500, "InternalError").is_unavailable());
    }

    #[test]
    fn test_rbac_denial_is_not_an_outage() {
        for code in [401, 403] {
            let err = map(code, "Forbidden");
            assert_eq!(err, StoreError::Forbidden(format!("status {code}")));
            assert!(!err.is_unavailable());
        }
    }
}
