//! In-memory [`ResourceStore`] with API-server-like semantics.
//!
//! Every write bumps a store-wide resource version and is fanned out to
//! watchers. Updates carrying a stale resourceVersion fail with
//! [`StoreError::Conflict`]. Faults can be injected for tests.

use super::{selector_matches, ResourceStore, Selector, StoreError, WatchEvent};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug)]
struct State<K> {
    objects: BTreeMap<String, K>,
    resource_version: u64,
}

/// In-memory store of one resource kind
#[derive(Debug)]
pub struct MemoryStore<K: Clone> {
    kind: String,
    namespace: Option<String>,
    state: Mutex<State<K>>,
    events: broadcast::Sender<WatchEvent<K>>,
    unavailable_calls: AtomicU32,
    forbidden_calls: AtomicU32,
    conflicting_writes: AtomicU32,
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Store for cluster-scoped objects
    pub fn new() -> Self {
        Self::with_namespace(None)
    }

    /// Store whose objects all live in `namespace`
    pub fn namespaced(namespace: &str) -> Self {
        Self::with_namespace(Some(namespace.to_string()))
    }

    fn with_namespace(namespace: Option<String>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            kind: K::kind(&()).into_owned(),
            namespace,
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                resource_version: 0,
            }),
            events,
            unavailable_calls: AtomicU32::new(0),
            forbidden_calls: AtomicU32::new(0),
            conflicting_writes: AtomicU32::new(0),
        }
    }

    /// Fail the next `calls` requests with [`StoreError::Unavailable`]
    pub fn fail_next_calls(&self, calls: u32) {
        self.unavailable_calls.store(calls, Ordering::SeqCst);
    }

    /// Fail the next `calls` requests with [`StoreError::Forbidden`], as an RBAC denial would
    pub fn deny_next_calls(&self, calls: u32) {
        self.forbidden_calls.store(calls, Ordering::SeqCst);
    }

    /// Reject the next `writes` updates with [`StoreError::Conflict`] as if another writer won
    pub fn conflict_next_writes(&self, writes: u32) {
        self.conflicting_writes.store(writes, Ordering::SeqCst);
    }

    /// Current objects, for assertions
    pub fn snapshot(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if take_one(&self.unavailable_calls) {
            return Err(StoreError::Unavailable(format!(
                "{} store unavailable (injected)",
                self.kind
            )));
        }
        if take_one(&self.forbidden_calls) {
            return Err(StoreError::Forbidden(format!(
                "{} access denied (injected)",
                self.kind
            )));
        }
        Ok(())
    }

    fn not_found(&self, name: &str) -> StoreError {
        StoreError::NotFound {
            kind: self.kind.clone(),
            name: name.to_string(),
        }
    }

    fn conflict(&self, name: &str) -> StoreError {
        StoreError::Conflict {
            kind: self.kind.clone(),
            name: name.to_string(),
        }
    }

    fn replace(&self, obj: &K) -> Result<K, StoreError> {
        self.check_available()?;
        let name = obj.name_any();
        if take_one(&self.conflicting_writes) {
            return Err(self.conflict(&name));
        }

        let mut state = self.lock();
        let stored = state
            .objects
            .get(&name)
            .ok_or_else(|| self.not_found(&name))?;
        if let Some(expected) = obj.meta().resource_version.as_deref() {
            if stored.meta().resource_version.as_deref() != Some(expected) {
                return Err(self.conflict(&name));
            }
        }

        let mut updated = obj.clone();
        updated.meta_mut().uid.clone_from(&stored.meta().uid);
        updated.meta_mut().namespace.clone_from(&stored.meta().namespace);
        state.resource_version += 1;
        updated.meta_mut().resource_version = Some(state.resource_version.to_string());
        state.objects.insert(name, updated.clone());
        drop(state);

        let _ = self.events.send(WatchEvent::Applied(updated.clone()));
        Ok(updated)
    }
}

impl<K> Default for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait::async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, StoreError> {
        self.check_available()?;
        Ok(self.lock().objects.get(name).cloned())
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<K>, StoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .objects
            .values()
            .filter(|obj| selector_matches(selector, obj.meta().labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        self.check_available()?;
        let name = obj.name_any();
        if name.is_empty() {
            return Err(StoreError::Invalid(format!("{} without a name", self.kind)));
        }

        let mut state = self.lock();
        if state.objects.contains_key(&name) {
            return Err(StoreError::AlreadyExists {
                kind: self.kind.clone(),
                name,
            });
        }

        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.namespace.clone_from(&self.namespace);
        state.resource_version += 1;
        meta.resource_version = Some(state.resource_version.to_string());
        state.objects.insert(name, created.clone());
        drop(state);

        let _ = self.events.send(WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        self.replace(obj)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        self.replace(obj)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let removed = self
            .lock()
            .objects
            .remove(name)
            .ok_or_else(|| self.not_found(name))?;
        let _ = self.events.send(WatchEvent::Deleted(removed));
        Ok(())
    }

    fn watch(&self, selector: &Selector) -> BoxStream<'static, WatchEvent<K>> {
        let selector = selector.clone();
        self.watch_matching(move |obj| selector_matches(&selector, obj.meta().labels.as_ref()))
    }

    fn watch_named(&self, name: &str) -> BoxStream<'static, WatchEvent<K>> {
        let name = name.to_string();
        self.watch_matching(move |obj| obj.meta().name.as_deref() == Some(name.as_str()))
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn watch_matching<F>(&self, matches: F) -> BoxStream<'static, WatchEvent<K>>
    where
        F: Fn(&K) -> bool + Send + Sync + 'static,
    {
        // Subscribe before listing so no write falls between the two
        let receiver = self.events.subscribe();
        let initial: Vec<WatchEvent<K>> = self
            .lock()
            .objects
            .values()
            .cloned()
            .map(WatchEvent::Applied)
            .chain(std::iter::once(WatchEvent::Restarted))
            .collect();

        let live = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(event) => Some((event, receiver)),
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    Some((WatchEvent::Restarted, receiver))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        stream::iter(initial)
            .chain(live)
            .filter(move |event| {
                let keep = match event {
                    WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => matches(obj),
                    WatchEvent::Restarted => true,
                };
                futures::future::ready(keep)
            })
            .boxed()
    }
}
