//! # Resource Store
//!
//! Typed CRUD and watch over cluster resources, one store per kind and scope.
//! Controllers only see this trait, so they run unchanged against the API
//! server or the in-memory backend used by tests.
//!
//! ## Module Structure
//!
//! - `cluster.rs` - kube-backed store with per-call timeouts
//! - `memory.rs` - in-memory store with resource versions and watch fan-out

mod cluster;
mod memory;

pub use cluster::KubeStore;
pub use memory::MemoryStore;

use futures::stream::BoxStream;
use std::collections::BTreeMap;
use thiserror::Error;

/// Equality-based label selector
pub type Selector = BTreeMap<String, String>;

/// Store failures, classified for the controllers' error policies
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    /// Optimistic-concurrency failure: the object changed since it was read
    #[error("{kind} '{name}' was modified concurrently")]
    Conflict { kind: String, name: String },

    /// Transient failure, including per-call timeouts
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    /// Authentication or RBAC rejected the request
    #[error("access denied: {0}")]
    Forbidden(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Change observed on a watched collection
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
    /// The stream re-listed or lost events; consumers should resync everything
    Restarted,
}

/// Typed CRUD + watch over one resource kind in one scope
#[async_trait::async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, StoreError>;

    async fn list(&self, selector: &Selector) -> Result<Vec<K>, StoreError>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace the object; fails with [`StoreError::Conflict`] when its
    /// resourceVersion is no longer current
    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace the status subresource, with the same conflict semantics as `update`
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Changes to objects matching `selector`, starting with the current objects
    fn watch(&self, selector: &Selector) -> BoxStream<'static, WatchEvent<K>>;

    /// Changes to the single object called `name` (a `metadata.name` field selector)
    fn watch_named(&self, name: &str) -> BoxStream<'static, WatchEvent<K>>;
}

/// Parse `k=v,k2=v2` into a [`Selector`]
pub fn parse_selector(raw: &str) -> Result<Selector, StoreError> {
    let mut selector = Selector::new();
    for term in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (key, value) = term
            .split_once('=')
            .ok_or_else(|| StoreError::Invalid(format!("selector term '{term}' is not k=v")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(StoreError::Invalid(format!(
                "selector term '{term}' has an empty key"
            )));
        }
        selector.insert(key.to_string(), value.trim().to_string());
    }
    Ok(selector)
}

/// Render a [`Selector`] in the API server's label selector syntax
pub fn selector_string(selector: &Selector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `labels` satisfies every term of `selector`
pub fn selector_matches(selector: &Selector, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selector() {
        let selector = parse_selector("component=kube-controller-manager, tier = control-plane").unwrap();
        assert_eq!(selector.len(), 2);
        assert_eq!(selector["tier"], "control-plane");
        assert_eq!(
            selector_string(&selector),
            "component=kube-controller-manager,tier=control-plane"
        );
        assert!(parse_selector("").unwrap().is_empty());
        assert!(parse_selector("novalue").is_err());
        assert!(parse_selector("=x").is_err());
    }

    #[test]
    fn test_selector_matches() {
        let selector = parse_selector("a=1").unwrap();
        let mut labels = BTreeMap::new();
        assert!(!selector_matches(&selector, None));
        assert!(!selector_matches(&selector, Some(&labels)));
        labels.insert("a".to_string(), "1".to_string());
        labels.insert("b".to_string(), "2".to_string());
        assert!(selector_matches(&selector, Some(&labels)));
        assert!(selector_matches(&Selector::new(), None));
    }
}
